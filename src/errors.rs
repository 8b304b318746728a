//! Library-wide error taxonomy.
//!
//! Components never panic across their public contracts; everything that
//! can go wrong is either reported through an [`crate::executor::ExecutionResult`]
//! envelope, surfaced as an `ErrorOccurred` event, or raised as one of the
//! variants below.

use thiserror::Error;

use crate::llm::LlmError;

/// Errors raised across the agent's public contracts.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Bad inputs detected synchronously at a call site.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed XML or missing code in a model response, after the
    /// reasoner's retry budget is exhausted.
    #[error("Parsing error: {0}")]
    Parsing(String),

    /// Template lookup or rendering failure.
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    /// Non-recoverable completion error from the LLM adapter.
    #[error(transparent)]
    Completion(#[from] LlmError),

    /// The user declined a tool confirmation; terminates the `solve`
    /// loop immediately without a TaskCompleted event.
    #[error("Task aborted: {0}")]
    TaskAborted(String),

    /// Anything else that escaped a component boundary.
    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    /// Whether this error is the user-decline abort signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, AgentError::TaskAborted(_))
    }
}
