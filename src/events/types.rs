//! Typed events fired at every interesting transition of a task.
//!
//! Every event carries an [`EventMeta`] with the emitting agent's id and
//! name, a fresh 21-character event id, a UTC timestamp, and an optional
//! task id grouping all events of one `solve`/`chat` call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::executor::ExecutionResult;

// ---------------------------------------------------------------------------
// EventMeta
// ---------------------------------------------------------------------------

/// Fields shared by every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    /// Unique id of the agent firing the event.
    pub agent_id: String,
    /// Name of the agent firing the event.
    pub agent_name: String,
    /// Unique id of this event instance.
    pub event_id: String,
    /// UTC timestamp of event creation.
    pub timestamp: DateTime<Utc>,
    /// Optional id grouping all events of a single task.
    pub task_id: Option<String>,
}

impl EventMeta {
    /// Create metadata with a freshly generated event id.
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        task_id: Option<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            event_id: nanoid::nanoid!(),
            timestamp: Utc::now(),
            task_id,
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new("", "", None)
    }
}

// ---------------------------------------------------------------------------
// ConfirmationHandle
// ---------------------------------------------------------------------------

/// One-shot response channel carried by a `ToolConfirmationRequest`.
///
/// Exactly one response can be delivered; later calls to
/// [`ConfirmationHandle::respond`] are ignored. Clones share the same
/// underlying channel, so any observer holding a copy of the event may
/// answer.
#[derive(Clone, Default)]
pub struct ConfirmationHandle {
    inner: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl ConfirmationHandle {
    /// Create a handle and the receiver the executor awaits.
    pub fn channel() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver the user's answer. Returns `false` when a response was
    /// already delivered (the call is a no-op then).
    pub fn respond(&self, answer: impl Into<String>) -> bool {
        match self.inner.lock().take() {
            Some(tx) => tx.send(answer.into()).is_ok(),
            None => false,
        }
    }

    /// Whether a response can still be delivered.
    pub fn is_pending(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl fmt::Debug for ConfirmationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CompletionReason
// ---------------------------------------------------------------------------

/// Why a task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Success,
    MaxIterationsReached,
    Error,
    Aborted,
}

// ---------------------------------------------------------------------------
// AgentEvent
// ---------------------------------------------------------------------------

/// Parameter summary attached to tool lifecycle events: every value is
/// `str(v)` truncated to 100 characters.
pub type ParametersSummary = BTreeMap<String, String>;

/// The complete set of events the runtime emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AgentEvent {
    TaskStarted {
        #[serde(flatten)]
        meta: EventMeta,
        task_description: String,
        system_prompt: String,
    },
    StepStarted {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        system_prompt: String,
        task_description: String,
    },
    PromptGenerated {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        prompt: String,
    },
    StreamToken {
        #[serde(flatten)]
        meta: EventMeta,
        token: String,
        step_number: Option<usize>,
    },
    ThoughtGenerated {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        thought: String,
        generation_time: f64,
    },
    ActionGenerated {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        action_code: String,
        generation_time: f64,
    },
    ToolExecutionStarted {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        tool_name: String,
        parameters_summary: ParametersSummary,
    },
    ToolConfirmationRequest {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        tool_name: String,
        confirmation_message: String,
        parameters_summary: ParametersSummary,
        /// One-shot response channel; not serialized.
        #[serde(skip)]
        response: ConfirmationHandle,
    },
    ToolExecutionCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        tool_name: String,
        result_summary: String,
    },
    ToolExecutionError {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        tool_name: String,
        error: String,
    },
    ActionExecuted {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        result: ExecutionResult,
        execution_time: f64,
    },
    StepCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        step_number: usize,
        thought: String,
        action: String,
        result: ExecutionResult,
        is_complete: bool,
        final_answer: Option<String>,
    },
    ErrorOccurred {
        #[serde(flatten)]
        meta: EventMeta,
        error_message: String,
        step_number: Option<usize>,
    },
    TaskCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        final_answer: Option<String>,
        reason: CompletionReason,
    },
}

impl AgentEvent {
    /// The string discriminator observers subscribe with.
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::TaskStarted { .. } => "TaskStarted",
            AgentEvent::StepStarted { .. } => "StepStarted",
            AgentEvent::PromptGenerated { .. } => "PromptGenerated",
            AgentEvent::StreamToken { .. } => "StreamToken",
            AgentEvent::ThoughtGenerated { .. } => "ThoughtGenerated",
            AgentEvent::ActionGenerated { .. } => "ActionGenerated",
            AgentEvent::ToolExecutionStarted { .. } => "ToolExecutionStarted",
            AgentEvent::ToolConfirmationRequest { .. } => "ToolConfirmationRequest",
            AgentEvent::ToolExecutionCompleted { .. } => "ToolExecutionCompleted",
            AgentEvent::ToolExecutionError { .. } => "ToolExecutionError",
            AgentEvent::ActionExecuted { .. } => "ActionExecuted",
            AgentEvent::StepCompleted { .. } => "StepCompleted",
            AgentEvent::ErrorOccurred { .. } => "ErrorOccurred",
            AgentEvent::TaskCompleted { .. } => "TaskCompleted",
        }
    }

    /// Names of every event kind, in per-step emission order.
    pub fn all_event_types() -> Vec<String> {
        [
            "TaskStarted",
            "StepStarted",
            "PromptGenerated",
            "StreamToken",
            "ThoughtGenerated",
            "ActionGenerated",
            "ToolExecutionStarted",
            "ToolConfirmationRequest",
            "ToolExecutionCompleted",
            "ToolExecutionError",
            "ActionExecuted",
            "StepCompleted",
            "ErrorOccurred",
            "TaskCompleted",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Shared metadata of the event.
    pub fn meta(&self) -> &EventMeta {
        match self {
            AgentEvent::TaskStarted { meta, .. }
            | AgentEvent::StepStarted { meta, .. }
            | AgentEvent::PromptGenerated { meta, .. }
            | AgentEvent::StreamToken { meta, .. }
            | AgentEvent::ThoughtGenerated { meta, .. }
            | AgentEvent::ActionGenerated { meta, .. }
            | AgentEvent::ToolExecutionStarted { meta, .. }
            | AgentEvent::ToolConfirmationRequest { meta, .. }
            | AgentEvent::ToolExecutionCompleted { meta, .. }
            | AgentEvent::ToolExecutionError { meta, .. }
            | AgentEvent::ActionExecuted { meta, .. }
            | AgentEvent::StepCompleted { meta, .. }
            | AgentEvent::ErrorOccurred { meta, .. }
            | AgentEvent::TaskCompleted { meta, .. } => meta,
        }
    }
}
