//! Built-in tool retrieving past conversation messages by id.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{kwarg_str, Tool, ToolArgument, ToolKwargs};
use crate::conversation::ConversationHistory;

/// Retrieves the content of a conversation message by its nanoid.
///
/// The reasoner prefixes every history message it shows the model with
/// `nanoid:<id>`, so the model can cite an id and fetch the full content
/// here. Retrieval strips that prefix before returning.
pub struct RetrieveMessageTool {
    history: Arc<RwLock<ConversationHistory>>,
    arguments: Vec<ToolArgument>,
}

impl RetrieveMessageTool {
    pub fn new(history: Arc<RwLock<ConversationHistory>>) -> Self {
        Self {
            history,
            arguments: vec![ToolArgument::required(
                "nanoid",
                "string",
                "The nanoid of the message to retrieve",
            )],
        }
    }
}

#[async_trait]
impl Tool for RetrieveMessageTool {
    fn name(&self) -> &str {
        "retrieve_message"
    }

    fn description(&self) -> &str {
        "Retrieve a past message's content from the conversation history by its id. \
         Returns the content without the nanoid prefix."
    }

    fn arguments(&self) -> &[ToolArgument] {
        &self.arguments
    }

    async fn async_execute(&self, kwargs: ToolKwargs) -> anyhow::Result<Value> {
        let nanoid = kwarg_str(&kwargs, "nanoid")?;
        log::debug!("Retrieving message with nanoid '{nanoid}'");
        match self.history.read().get_content(&nanoid) {
            Some(content) => Ok(Value::String(content)),
            None => Ok(Value::String(format!(
                "Message with nanoid '{nanoid}' not found"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use serde_json::json;

    #[tokio::test]
    async fn test_retrieves_by_id_case_insensitive() {
        let history = Arc::new(RwLock::new(ConversationHistory::new(1024)));
        let id = history.write().add_message(Role::Assistant, "the answer");
        let tool = RetrieveMessageTool::new(Arc::clone(&history));

        let mut kwargs = ToolKwargs::new();
        kwargs.insert("nanoid".into(), json!(id.to_uppercase()));
        let result = tool.async_execute(kwargs).await.unwrap();
        assert_eq!(result, json!("the answer"));
    }

    #[tokio::test]
    async fn test_unknown_id_reports_not_found() {
        let history = Arc::new(RwLock::new(ConversationHistory::new(1024)));
        let tool = RetrieveMessageTool::new(history);
        let mut kwargs = ToolKwargs::new();
        kwargs.insert("nanoid".into(), json!("does-not-exist"));
        let result = tool.async_execute(kwargs).await.unwrap();
        assert!(result.as_str().unwrap().contains("not found"));
    }
}
