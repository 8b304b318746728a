//! Conversation history: an ordered message log with unique, stable ids.
//!
//! Every message receives a fresh 21-character nanoid on insertion. The
//! history keeps an id index alongside the ordered list so tools can
//! retrieve past messages by id; lookups are case-insensitive and
//! transparently strip the `nanoid:<id>` prefix line that the reasoner
//! prepends when it hands messages to the model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire name of the role, as sent to LLM providers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who authored the message.
    pub role: Role,
    /// The message text.
    pub content: String,
    /// Immutable 21-character identifier.
    pub nanoid: String,
}

impl Message {
    /// Create a message with a freshly generated id.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            nanoid: nanoid::nanoid!(),
        }
    }
}

/// Ordered message log with id lookup.
///
/// Bounded by `max_tokens` (soft). The knob is carried so callers can
/// configure it, but eviction is deferred; retained messages always keep
/// their insertion order and their id lookup.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
    /// Soft token budget for the history. Exposed for configuration;
    /// enforcement is a future extension.
    pub max_tokens: usize,
}

impl ConversationHistory {
    /// Create an empty history with the given soft token budget.
    pub fn new(max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            index: HashMap::new(),
            max_tokens,
        }
    }

    /// Append a message, returning its generated id.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> String {
        let message = Message::new(role, content);
        let id = message.nanoid.clone();
        log::debug!("Added {} message with nanoid '{}'", message.role, id);
        self.index
            .insert(id.to_lowercase(), self.messages.len());
        self.messages.push(message);
        id
    }

    /// The ordered message list.
    pub fn get_history(&self) -> &[Message] {
        &self.messages
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop all messages and the id index.
    pub fn clear_history(&mut self) {
        self.messages.clear();
        self.index.clear();
        log::debug!("Cleared conversation history");
    }

    /// Retrieve a message's content by id.
    ///
    /// The lookup is case-insensitive. When the stored content begins
    /// with a `nanoid:<id>` line, only the text after that line is
    /// returned.
    pub fn get_content(&self, nanoid: &str) -> Option<String> {
        let wanted = nanoid.to_lowercase();
        let message = self
            .index
            .get(&wanted)
            .map(|&i| &self.messages[i])
            .or_else(|| {
                // Fall back to scanning for ids embedded in content.
                self.messages
                    .iter()
                    .find(|m| m.content.to_lowercase().starts_with(&format!("nanoid:{wanted}")))
            })?;
        Some(strip_nanoid_prefix(&message.content))
    }
}

/// Remove a leading `nanoid:<id>` line from message content, if present.
pub fn strip_nanoid_prefix(content: &str) -> String {
    if let Some(rest) = content.strip_prefix("nanoid:") {
        match rest.split_once('\n') {
            Some((_, body)) => body.to_string(),
            None => content.to_string(),
        }
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_message_generates_21_char_id() {
        let mut history = ConversationHistory::new(1024);
        let id = history.add_message(Role::User, "hello");
        assert_eq!(id.len(), 21);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let mut history = ConversationHistory::new(1024);
        let a = history.add_message(Role::User, "one");
        let b = history.add_message(Role::Assistant, "two");
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_content_case_insensitive() {
        let mut history = ConversationHistory::new(1024);
        let id = history.add_message(Role::User, "payload");
        assert_eq!(history.get_content(&id.to_uppercase()).as_deref(), Some("payload"));
    }

    #[test]
    fn test_get_content_strips_embedded_prefix() {
        let mut history = ConversationHistory::new(1024);
        let id = history.add_message(Role::Assistant, "ignored");
        // Simulate content stored with an id prefix line.
        let mut with_prefix = ConversationHistory::new(1024);
        with_prefix.add_message(Role::Assistant, format!("nanoid:{id}\nreal body"));
        assert_eq!(with_prefix.get_content(&id).as_deref(), Some("real body"));
    }

    #[test]
    fn test_clear_history_resets_lookup() {
        let mut history = ConversationHistory::new(1024);
        let id = history.add_message(Role::User, "gone");
        history.clear_history();
        assert!(history.is_empty());
        assert!(history.get_content(&id).is_none());
    }
}
