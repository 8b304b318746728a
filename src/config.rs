//! Agent configuration consumed by the facade.
//!
//! Only the in-memory shape lives here; loading from files, environment
//! variables, and the CLI surface belong to the host application.

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::sandbox::DEFAULT_ALLOWED_MODULES;

/// Default maximum reasoning steps per `solve` call.
pub const DEFAULT_MAX_ITERATIONS: usize = 5;
/// Default soft token budget for histories.
pub const DEFAULT_MAX_HISTORY_TOKENS: usize = 64 * 1024;
/// Default per-step execution timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Default token cap for chat completions.
pub const DEFAULT_MAX_TOKENS: u32 = 4000;

/// Interaction mode of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Multi-step code-acting task solving.
    #[default]
    Codeact,
    /// Single-shot conversational mode.
    Chat,
}

/// Per-tool configuration override applied at registration time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOverride {
    /// `(toolbox, name)` of the tool the override targets.
    pub toolbox: String,
    pub name: String,
    /// Override for whether the tool requires user confirmation.
    pub requires_confirmation: Option<bool>,
    /// Override for the confirmation prompt shown to the user.
    pub confirmation_message: Option<String>,
}

/// Configuration for constructing an [`crate::agent::Agent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Language model identifier handed to the LLM client.
    pub model: String,
    /// Base URL of the completion API (OpenAI-compatible provider).
    pub base_url: Option<String>,
    /// API key for the completion API.
    pub api_key: Option<String>,
    /// Sampling temperature, validated to `0.0..=2.0`.
    pub temperature: f64,
    /// Maximum reasoning steps per task.
    pub max_iterations: usize,
    /// Soft token budget for working memory and conversation history.
    pub max_history_tokens: usize,
    /// Modules the sandbox allows the generated code to import.
    pub allowed_modules: Vec<String>,
    /// Whether LLM responses stream by default.
    pub streaming: bool,
    /// Interaction mode.
    pub mode: AgentMode,
    /// Agent display name; defaults to `agent_<first 8 of id>`.
    pub name: Option<String>,
    /// Personality fragment rendered into the system prompt.
    pub personality: Option<String>,
    /// Full system prompt override; when set, the template is skipped.
    pub system_prompt: Option<String>,
    /// Directory of prompt templates overriding the embedded defaults.
    pub template_dir: Option<String>,
    /// Per-step sandbox timeout in seconds.
    pub timeout_secs: u64,
    /// Per-tool configuration overrides.
    #[serde(default)]
    pub tool_overrides: Vec<ToolOverride>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.7,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_history_tokens: DEFAULT_MAX_HISTORY_TOKENS,
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            streaming: false,
            mode: AgentMode::Codeact,
            name: None,
            personality: None,
            system_prompt: None,
            template_dir: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            tool_overrides: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.model.trim().is_empty() {
            return Err(AgentError::Validation("model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AgentError::Validation(format!(
                "temperature {} out of range 0.0..=2.0",
                self.temperature
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_temperature_out_of_range_rejected() {
        let config = AgentConfig {
            temperature: 2.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_model_rejected() {
        let config = AgentConfig {
            model: "  ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
