//! # codeact
//!
//! A ReAct-style code-acting agent runtime. The agent repeatedly asks a
//! language model for a small async program, runs it inside a sandboxed
//! interpreter whose namespace exposes a curated set of tools, and feeds
//! the structured result back into the next reasoning step until the
//! model declares the task complete or the iteration budget runs out.
//! Single-shot chat with conversation history and streaming token
//! delivery ride on the same machinery.
//!
//! Subsystems:
//!
//! - [`agent`]: the public [`Agent`](agent::Agent) facade and the
//!   [`ReactAgent`](agent::core::ReactAgent) loop.
//! - [`reasoner`]: prompt assembly and `<Action>` generation.
//! - [`executor`] + [`sandbox`]: async sandboxed execution with a tool
//!   namespace, timeouts, and locals capture.
//! - [`events`]: the typed event bus observers subscribe to.
//! - [`tools`], [`conversation`], [`memory`], [`evaluator`], [`llm`],
//!   [`templates`], [`xml`]: the supporting cast.

pub mod agent;
pub mod config;
pub mod conversation;
pub mod errors;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod llm;
pub mod memory;
pub mod reasoner;
pub mod sandbox;
pub mod templates;
pub mod tools;
pub mod xml;

pub use agent::{Agent, ChatOptions, SolveOptions};
pub use config::AgentConfig;
pub use errors::AgentError;
pub use events::{AgentEvent, CompletionReason, EventBus, Observer};
pub use executor::{ExecutionResult, ExecutionStatus};
pub use llm::{LlmClient, LlmError};
pub use tools::{Tool, ToolArgument, ToolRegistry};
