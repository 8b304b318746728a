//! Agent facade: the public entry point owning every subsystem.
//!
//! An [`Agent`] is built from an [`AgentConfig`], owns the conversation
//! history, event bus, and tool registry, and constructs a fresh ReAct
//! core per call so concurrent tasks never share per-task state.

pub mod core;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value as Json;
use tera::Context;

use crate::config::{AgentConfig, AgentMode, DEFAULT_MAX_TOKENS};
use crate::conversation::{ConversationHistory, Role};
use crate::errors::AgentError;
use crate::evaluator::DefaultCompletionEvaluator;
use crate::events::{EventBus, Observer};
use crate::executor::{ContextVars, Executor};
use crate::llm::{LlmClient, OpenAiCompatibleClient};
use crate::memory::WorkingMemory;
use crate::reasoner::Reasoner;
use crate::templates::{TemplateEngine, SYSTEM_PROMPT};
use crate::tools::{RetrieveMessageTool, Tool, ToolRegistry};

pub use self::core::{ChatOptions, ReactAgent, SolveOptions};

/// High-level agent with unified configuration.
pub struct Agent {
    /// Stable 21-character agent id.
    pub id: String,
    /// Display name; defaults to `agent_<first 8 of id>`.
    pub name: String,
    config: AgentConfig,
    registry: Arc<ToolRegistry>,
    conversation: Arc<RwLock<ConversationHistory>>,
    bus: Arc<EventBus>,
    client: Arc<dyn LlmClient>,
    templates: TemplateEngine,
    last_solve_context_vars: ContextVars,
}

impl Agent {
    /// Build an agent with the bundled OpenAI-compatible provider.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let client = Arc::new(OpenAiCompatibleClient::new(
            config.base_url.clone(),
            config.api_key.clone(),
        ));
        Self::with_client(config, client)
    }

    /// Build an agent around a custom LLM client.
    pub fn with_client(
        config: AgentConfig,
        client: Arc<dyn LlmClient>,
    ) -> Result<Self, AgentError> {
        config.validate()?;

        let id = nanoid::nanoid!();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("agent_{}", &id[..8]));
        let templates = match &config.template_dir {
            Some(dir) => TemplateEngine::with_dir(dir)?,
            None => TemplateEngine::new(),
        };
        let conversation = Arc::new(RwLock::new(ConversationHistory::new(
            config.max_history_tokens,
        )));

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(RetrieveMessageTool::new(Arc::clone(&conversation))));
        registry.apply_overrides(&config.tool_overrides);

        Ok(Self {
            id,
            name,
            config,
            registry,
            conversation,
            bus: Arc::new(EventBus::new()),
            client,
            templates,
            last_solve_context_vars: ContextVars::new(),
        })
    }

    /// The agent's tool registry.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Configured interaction mode; hosts route `chat` vs `solve` on it.
    pub fn mode(&self) -> AgentMode {
        self.config.mode
    }

    /// The agent's event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The shared conversation history.
    pub fn conversation(&self) -> &Arc<RwLock<ConversationHistory>> {
        &self.conversation
    }

    // -----------------------------------------------------------------------
    // Observers and tools
    // -----------------------------------------------------------------------

    /// Subscribe an observer for the given event types.
    pub fn add_observer(&self, observer: Arc<dyn Observer>, event_types: Vec<String>) {
        self.bus.subscribe(observer, event_types);
    }

    /// Remove a previously added observer.
    pub fn remove_observer(&self, observer: &Arc<dyn Observer>) {
        self.bus.unsubscribe(observer);
    }

    /// Register a tool; rejects duplicate `(toolbox, name)` pairs.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        if self
            .registry
            .get(tool.toolbox_name(), tool.name())
            .is_some()
        {
            return Err(AgentError::Validation(format!(
                "Tool '{}' is already registered in toolbox '{}'",
                tool.name(),
                tool.toolbox_name()
            )));
        }
        self.registry.register(tool);
        Ok(())
    }

    /// Qualified names of every registered tool.
    pub fn list_tools(&self) -> Vec<String> {
        self.registry
            .get_tools()
            .iter()
            .map(|tool| format!("{}.{}", tool.toolbox_name(), tool.name()))
            .collect()
    }

    /// Context variables from the last `solve` call.
    pub fn get_context_vars(&self) -> &ContextVars {
        &self.last_solve_context_vars
    }

    /// Update the sampling temperature.
    pub fn set_temperature(&mut self, temperature: f64) -> Result<(), AgentError> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(AgentError::Validation(format!(
                "temperature {temperature} out of range 0.0..=2.0"
            )));
        }
        self.config.temperature = temperature;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Render the system prompt from configuration.
    fn build_system_prompt(&self) -> String {
        if let Some(system_prompt) = &self.config.system_prompt {
            return system_prompt.clone();
        }
        let mut context = Context::new();
        context.insert("name", &self.name);
        context.insert(
            "personality",
            self.config.personality.as_deref().unwrap_or(""),
        );
        match self.templates.render(SYSTEM_PROMPT, &context) {
            Ok(prompt) => prompt.trim().to_string(),
            Err(e) => {
                log::error!("Error rendering system prompt: {e}");
                String::new()
            }
        }
    }

    /// Build a fresh ReAct core over the current registry snapshot.
    fn build_core(&self, system_prompt: String) -> ReactAgent {
        let tools = self.registry.get_tools();
        let reasoner = Reasoner::new(
            self.config.model.clone(),
            self.config.temperature,
            Arc::clone(&self.client),
            self.templates.clone(),
            tools,
            self.id.clone(),
            self.name.clone(),
        );
        let executor = Executor::new(
            &self.registry,
            Arc::clone(&self.bus),
            self.id.clone(),
            self.name.clone(),
            self.config.allowed_modules.clone(),
        );
        let working_memory = WorkingMemory::new(
            self.config.max_history_tokens,
            system_prompt,
            String::new(),
            self.templates.clone(),
        );
        let evaluator = Box::new(DefaultCompletionEvaluator::new(
            Arc::clone(&self.client),
            self.templates.clone(),
        ));
        ReactAgent::new(
            self.id.clone(),
            self.name.clone(),
            self.config.temperature,
            self.config.max_iterations,
            Duration::from_secs(self.config.timeout_secs),
            reasoner,
            executor,
            working_memory,
            Arc::clone(&self.conversation),
            evaluator,
            Arc::clone(&self.bus),
            Arc::clone(&self.client),
        )
    }

    /// Multi-step task solving.
    pub async fn solve(&mut self, mut options: SolveOptions) -> Vec<Json> {
        if options.task.trim().is_empty() {
            return vec![serde_json::json!({ "error": "task must not be empty" })];
        }
        let system_prompt = options
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.build_system_prompt());
        options.system_prompt = Some(system_prompt.clone());
        if !options.streaming {
            options.streaming = self.config.streaming;
        }

        let mut core = self.build_core(system_prompt);
        let records = core.solve(options).await;
        self.last_solve_context_vars = core.context_vars().clone();
        records
    }

    /// Single-step chat; appends the exchange to the history on success.
    pub async fn chat(&self, options: ChatOptions) -> Result<String, AgentError> {
        if options.message.trim().is_empty() {
            return Err(AgentError::Validation("message must not be empty".into()));
        }
        let core = self.build_core(self.build_system_prompt());
        let message = options.message.clone();
        let response = core.chat(options).await?;

        let mut conversation = self.conversation.write();
        conversation.add_message(Role::User, message);
        conversation.add_message(Role::Assistant, response.clone());
        Ok(response)
    }

    /// Convenience chat with default options.
    pub async fn chat_text(&self, message: impl Into<String>) -> Result<String, AgentError> {
        self.chat(ChatOptions {
            message: message.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            streaming: self.config.streaming,
            task_id: None,
        })
        .await
    }

    /// Blocking wrapper for [`Agent::solve`].
    pub fn sync_solve(&mut self, options: SolveOptions) -> Vec<Json> {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(self.solve(options)),
            Err(e) => vec![serde_json::json!({
                "error": format!("Failed to solve task synchronously: {e}")
            })],
        }
    }

    /// Blocking wrapper for [`Agent::chat`].
    pub fn sync_chat(&self, options: ChatOptions) -> Result<String, AgentError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build runtime: {e}")))?;
        runtime.block_on(self.chat(options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionRequest, LlmError};
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            Ok(format!(
                "echo: {}",
                request.messages.last().map(|m| m.content.as_str()).unwrap_or("")
            ))
        }
    }

    fn agent() -> Agent {
        Agent::with_client(AgentConfig::default(), Arc::new(EchoClient)).unwrap()
    }

    #[test]
    fn test_agent_identity_defaults() {
        let agent = agent();
        assert_eq!(agent.id.len(), 21);
        assert_eq!(agent.name, format!("agent_{}", &agent.id[..8]));
    }

    #[test]
    fn test_agents_are_independent() {
        let a = agent();
        let b = agent();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_retrieve_message_registered_by_default() {
        let agent = agent();
        assert!(agent
            .list_tools()
            .contains(&"default.retrieve_message".to_string()));
    }

    #[test]
    fn test_duplicate_tool_rejected() {
        let agent = agent();
        agent
            .register_tool(crate::tools::math_tools::get_tools().remove(0))
            .unwrap();
        let duplicate = agent.register_tool(crate::tools::math_tools::get_tools().remove(0));
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_chat_appends_history() {
        let agent = agent();
        let response = agent.chat_text("hello there").await.unwrap();
        assert!(response.starts_with("echo:"));
        let conversation = agent.conversation().read();
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.get_history()[0].content, "hello there");
    }

    #[tokio::test]
    async fn test_empty_chat_message_rejected() {
        let agent = agent();
        assert!(agent.chat_text("   ").await.is_err());
    }

    #[test]
    fn test_system_prompt_uses_personality() {
        let config = AgentConfig {
            personality: Some("dry wit".into()),
            ..Default::default()
        };
        let agent = Agent::with_client(config, Arc::new(EchoClient)).unwrap();
        let prompt = agent.build_system_prompt();
        assert!(prompt.contains("dry wit"));
    }

    #[test]
    fn test_invalid_temperature_rejected() {
        let mut agent = agent();
        assert!(agent.set_temperature(3.0).is_err());
        assert!(agent.set_temperature(0.5).is_ok());
    }
}
