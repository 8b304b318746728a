//! Event system: typed events and the observer bus.
//!
//! Every interesting transition in a task's life fires an [`AgentEvent`]
//! through the agent's [`EventBus`]. Streaming UIs, confirmation flows,
//! and logging hang off the bus; the core never depends on any observer
//! being present.

/// Typed event definitions and the confirmation response channel.
pub mod types;

/// Observer registry and dispatch.
pub mod bus;

pub use bus::{ChannelObserver, EventBus, Observer, SyncObserver};
pub use types::{
    AgentEvent, CompletionReason, ConfirmationHandle, EventMeta, ParametersSummary,
};
