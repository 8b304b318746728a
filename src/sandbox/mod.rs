//! Sandboxed asynchronous interpreter.
//!
//! Runs the small Python-subset programs the reasoner's prompt commits
//! the model to: an `async def main()` entry point, allow-listed module
//! imports, and tool calls through injected toolbox namespaces. The
//! executor wraps [`interp::run_program`] with a timeout and turns every
//! failure into an error `ExecutionResult`.

pub mod interp;
pub mod lexer;
pub mod modules;
pub mod parser;
pub mod value;

use thiserror::Error;

pub use interp::{has_async_main, run_program, RunOutput, ToolCaller};
pub use modules::DEFAULT_ALLOWED_MODULES;
pub use value::Value;

/// Everything that can go wrong inside a sandbox run.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// The program failed to tokenize or parse.
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// No `async def main()` entry point.
    #[error("Code lacks async main()")]
    MissingMain,

    /// Import of a module outside the allow-list.
    #[error("ImportError: import of module '{0}' is not allowed")]
    ImportDenied(String),

    /// An async callable was invoked without `await`.
    #[error("RuntimeError: {0}")]
    NotAwaited(String),

    /// A runtime exception inside guest code (catchable by `except`).
    #[error("{0}")]
    Runtime(String),

    /// The user declined a tool confirmation; never catchable in guest
    /// code and terminates the whole task.
    #[error("{0}")]
    Aborted(String),

    /// The run exceeded its wall-clock budget.
    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),
}

impl SandboxError {
    /// Whether a guest `except` block may swallow this error.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            SandboxError::Runtime(_)
                | SandboxError::NotAwaited(_)
                | SandboxError::ImportDenied(_)
        )
    }
}
