//! The ReAct loop: reason → execute → update memory → evaluate → repeat.
//!
//! Owns the per-task state (working memory, context variables) and fires
//! every lifecycle event. The loop stops on completion, on the iteration
//! budget, on a non-recoverable error, or immediately when the user
//! declines a tool confirmation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::{json, Value as Json};

use crate::conversation::ConversationHistory;
use crate::errors::AgentError;
use crate::evaluator::{CompletionEvaluator, EvaluationRequest};
use crate::events::{AgentEvent, CompletionReason, EventBus, EventMeta};
use crate::executor::{ContextVars, Executor};
use crate::llm::{llm_completion, CallAttribution, ChatMessage, CompletionRequest, LlmClient};
use crate::memory::{Step, WorkingMemory};
use crate::reasoner::{GenerateActionRequest, Reasoner};
use crate::xml;

/// Attempts per step before the error propagates.
const MAX_STEP_ATTEMPTS: u32 = 3;

/// Options for a `solve` call.
#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    pub task: String,
    pub success_criteria: Option<String>,
    /// Accepted for contract compatibility; the prompt templates carry
    /// the goal through the task text.
    pub task_goal: Option<String>,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<usize>,
    pub streaming: bool,
    pub task_id: Option<String>,
}

/// Options for a `chat` call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub message: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub streaming: bool,
    pub task_id: Option<String>,
}

/// Drives the reason-act-observe cycle.
pub struct ReactAgent {
    pub agent_id: String,
    pub agent_name: String,
    pub temperature: f64,
    pub max_iterations: usize,
    step_timeout: Duration,
    reasoner: Reasoner,
    executor: Executor,
    working_memory: WorkingMemory,
    conversation: Arc<RwLock<ConversationHistory>>,
    evaluator: Box<dyn CompletionEvaluator>,
    bus: Arc<EventBus>,
    client: Arc<dyn LlmClient>,
    context_vars: ContextVars,
}

impl ReactAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        temperature: f64,
        max_iterations: usize,
        step_timeout: Duration,
        reasoner: Reasoner,
        executor: Executor,
        working_memory: WorkingMemory,
        conversation: Arc<RwLock<ConversationHistory>>,
        evaluator: Box<dyn CompletionEvaluator>,
        bus: Arc<EventBus>,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            temperature,
            max_iterations,
            step_timeout,
            reasoner,
            executor,
            working_memory,
            conversation,
            evaluator,
            bus,
            client,
            context_vars: ContextVars::new(),
        }
    }

    fn meta(&self, task_id: Option<&str>) -> EventMeta {
        EventMeta::new(
            &self.agent_id,
            &self.agent_name,
            task_id.map(|t| t.to_string()),
        )
    }

    /// Context variables accumulated by the last `solve`.
    pub fn context_vars(&self) -> &ContextVars {
        &self.context_vars
    }

    /// Update the sampling temperature for this core and its reasoner.
    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
        self.reasoner.temperature = temperature;
    }

    /// Register an extra tool on the executor.
    pub fn register_tool(&self, tool: Arc<dyn crate::tools::Tool>) {
        self.executor.register_tool(tool);
    }

    // -----------------------------------------------------------------------
    // solve
    // -----------------------------------------------------------------------

    /// Solve a task with the ReAct loop. Returns the per-step records;
    /// an aborted task appends a trailing abort record instead of firing
    /// TaskCompleted.
    pub async fn solve(&mut self, options: SolveOptions) -> Vec<Json> {
        let task_id = options
            .task_id
            .clone()
            .unwrap_or_else(|| nanoid::nanoid!());
        let max_iters = options.max_iterations.unwrap_or(self.max_iterations);

        self.working_memory.clear();
        self.context_vars.clear();
        if let Some(system_prompt) = &options.system_prompt {
            self.working_memory.system_prompt = system_prompt.clone();
        }
        self.working_memory.task_description = options.task.clone();

        // Seed the context with a snapshot of the conversation so far.
        let conversation_snapshot: Vec<Json> = self
            .conversation
            .read()
            .get_history()
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                    "nanoid": m.nanoid,
                })
            })
            .collect();
        self.context_vars.insert(
            "conversation_history".to_string(),
            Json::Array(conversation_snapshot),
        );

        self.bus
            .emit(AgentEvent::TaskStarted {
                meta: self.meta(Some(&task_id)),
                task_description: options.task.clone(),
                system_prompt: self.working_memory.system_prompt.clone(),
            })
            .await;

        let mut completed = false;
        let mut abort: Option<(usize, String)> = None;

        for step_number in 1..=max_iters {
            match self.run_step(&options, step_number, max_iters, &task_id).await {
                Ok(step) => {
                    let (is_complete, _final_answer) =
                        self.finalize_step(&options, &step, &task_id).await;
                    if is_complete {
                        let answer = self
                            .working_memory
                            .store()
                            .last()
                            .and_then(|s| s.result.result.clone());
                        self.bus
                            .emit(AgentEvent::TaskCompleted {
                                meta: self.meta(Some(&task_id)),
                                final_answer: answer,
                                reason: CompletionReason::Success,
                            })
                            .await;
                        completed = true;
                        break;
                    }
                }
                Err(AgentError::TaskAborted(message)) => {
                    log::debug!("Task execution aborted by user: {message}");
                    abort = Some((
                        step_number,
                        format!(
                            "Task aborted by user at step {step_number} - confirmation declined"
                        ),
                    ));
                    break;
                }
                Err(AgentError::Completion(e)) => {
                    self.bus
                        .emit(AgentEvent::ErrorOccurred {
                            meta: self.meta(Some(&task_id)),
                            error_message: e.to_string(),
                            step_number: Some(step_number),
                        })
                        .await;
                    return vec![json!({ "error": e.to_string() })];
                }
                Err(e) => {
                    self.bus
                        .emit(AgentEvent::ErrorOccurred {
                            meta: self.meta(Some(&task_id)),
                            error_message: e.to_string(),
                            step_number: Some(step_number),
                        })
                        .await;
                    break;
                }
            }
        }

        let steps = self.step_records(abort.as_ref().map(|(step, _)| *step));

        if let Some((_, abort_message)) = abort {
            let mut records = steps;
            records.push(json!({
                "error": abort_message,
                "aborted": true,
                "task_status": "aborted",
            }));
            return records;
        }

        if !completed {
            let reason = if self.working_memory.store().len() == max_iters {
                CompletionReason::MaxIterationsReached
            } else {
                CompletionReason::Error
            };
            self.bus
                .emit(AgentEvent::TaskCompleted {
                    meta: self.meta(Some(&task_id)),
                    final_answer: None,
                    reason,
                })
                .await;
        }
        steps
    }

    fn step_records(&self, abort_step: Option<usize>) -> Vec<Json> {
        self.working_memory
            .store()
            .iter()
            .map(|step| {
                let mut record = json!({
                    "step_number": step.step_number,
                    "thought": step.thought,
                    "action": step.action,
                    "result": step.result.to_json(),
                });
                if let Some(abort_step) = abort_step {
                    record["aborted"] = json!(step.step_number == abort_step);
                }
                record
            })
            .collect()
    }

    /// One iteration: generate an action, execute it, record the step.
    async fn run_step(
        &mut self,
        options: &SolveOptions,
        step_number: usize,
        max_iters: usize,
        task_id: &str,
    ) -> Result<Step, AgentError> {
        self.bus
            .emit(AgentEvent::StepStarted {
                meta: self.meta(Some(task_id)),
                step_number,
                system_prompt: self.working_memory.system_prompt.clone(),
                task_description: self.working_memory.task_description.clone(),
            })
            .await;

        let mut last_error: Option<AgentError> = None;
        for attempt in 1..=MAX_STEP_ATTEMPTS {
            match self
                .attempt_step(options, step_number, max_iters, task_id)
                .await
            {
                Ok(step) => return Ok(step),
                Err(e @ (AgentError::TaskAborted(_) | AgentError::Completion(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Step {step_number} attempt {attempt} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| AgentError::Internal("step failed without an error".into())))
    }

    async fn attempt_step(
        &mut self,
        options: &SolveOptions,
        step_number: usize,
        max_iters: usize,
        task_id: &str,
    ) -> Result<Step, AgentError> {
        // --- reason ---
        let history_str = self.working_memory.format_history(max_iters);
        let available_vars: Vec<String> = self.context_vars.keys().cloned().collect();
        let conversation_history = self.conversation.read().get_history().to_vec();

        let generation_start = Instant::now();
        let response = self
            .reasoner
            .generate_action(
                GenerateActionRequest {
                    task: &options.task,
                    history_str: &history_str,
                    step: step_number,
                    max_iterations: max_iters,
                    system_prompt: options
                        .system_prompt
                        .as_deref()
                        .or(Some(self.working_memory.system_prompt.as_str())),
                    streaming: options.streaming,
                    available_vars,
                    allowed_modules: self.executor.allowed_modules().to_vec(),
                    conversation_history: &conversation_history,
                    task_id: Some(task_id.to_string()),
                },
                &self.bus,
            )
            .await?;
        let generation_time = generation_start.elapsed().as_secs_f64();

        let (thought, code) = xml::parse_action_response(&response)?;
        if !response.trim_end().ends_with("</Action>") {
            log::warn!("Response might be truncated at step {step_number}");
        }

        self.bus
            .emit(AgentEvent::ThoughtGenerated {
                meta: self.meta(Some(task_id)),
                step_number,
                thought: thought.clone(),
                generation_time,
            })
            .await;
        self.bus
            .emit(AgentEvent::ActionGenerated {
                meta: self.meta(Some(task_id)),
                step_number,
                action_code: code.clone(),
                generation_time,
            })
            .await;

        // --- act ---
        let execution_start = Instant::now();
        let result = self
            .executor
            .execute_action(
                &code,
                &mut self.context_vars,
                step_number,
                self.step_timeout,
                Some(task_id.to_string()),
            )
            .await;
        let execution_time = execution_start.elapsed().as_secs_f64();

        self.bus
            .emit(AgentEvent::ActionExecuted {
                meta: self.meta(Some(task_id)),
                step_number,
                result: result.clone(),
                execution_time,
            })
            .await;

        // --- observe ---
        if result.is_success() {
            for (name, value) in &result.local_variables {
                self.context_vars
                    .insert(name.clone(), Json::String(value.clone()));
            }
            log::debug!(
                "Step {step_number}: context_vars now has {} entries",
                self.context_vars.len()
            );
        }

        let step = Step {
            step_number,
            thought,
            action: code,
            result,
        };
        self.working_memory.add(step.clone());

        // A declined confirmation aborts the whole task; the step stays
        // recorded so the returned history shows where it happened.
        if step.result.is_confirmation_decline() {
            return Err(AgentError::TaskAborted(
                step.result.error.clone().unwrap_or_default(),
            ));
        }
        Ok(step)
    }

    /// Judge completion and emit StepCompleted.
    async fn finalize_step(
        &mut self,
        options: &SolveOptions,
        step: &Step,
        task_id: &str,
    ) -> (bool, String) {
        let formatted_history = self.working_memory.format_history(self.max_iterations);
        let attribution = CallAttribution {
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            step: Some(step.step_number),
            task_id: Some(task_id.to_string()),
        };
        let (is_complete, final_answer) = self
            .evaluator
            .evaluate_completion(
                EvaluationRequest {
                    task: &options.task,
                    formatted_history: &formatted_history,
                    result: &step.result,
                    success_criteria: options.success_criteria.as_deref(),
                    model: &self.reasoner.model,
                    temperature: self.temperature,
                },
                &self.bus,
                &attribution,
            )
            .await;

        // The adjusted answer becomes the step's authoritative result.
        let mut result = step.result.clone();
        if is_complete && !final_answer.is_empty() {
            result.result = Some(final_answer.clone());
            if let Some(stored) = self.working_memory.store_mut().last_mut() {
                stored.result.result = Some(final_answer.clone());
            }
        }

        self.bus
            .emit(AgentEvent::StepCompleted {
                meta: self.meta(Some(task_id)),
                step_number: step.step_number,
                thought: step.thought.clone(),
                action: step.action.clone(),
                result,
                is_complete,
                final_answer: if is_complete {
                    Some(final_answer.clone())
                } else {
                    None
                },
            })
            .await;

        (is_complete, final_answer)
    }

    // -----------------------------------------------------------------------
    // chat
    // -----------------------------------------------------------------------

    /// Single-shot chat over the conversation history.
    pub async fn chat(&self, options: ChatOptions) -> Result<String, AgentError> {
        let task_id = options
            .task_id
            .clone()
            .unwrap_or_else(|| nanoid::nanoid!());

        let system_prompt = if self.working_memory.system_prompt.is_empty() {
            "You are a helpful AI assistant.".to_string()
        } else {
            self.working_memory.system_prompt.clone()
        };
        let mut messages = vec![ChatMessage::new("system", system_prompt)];
        for message in self.conversation.read().get_history() {
            messages.push(ChatMessage::new(message.role.as_str(), &message.content));
        }
        messages.push(ChatMessage::new("user", &options.message));

        let request = CompletionRequest {
            model: self.reasoner.model.clone(),
            messages,
            temperature: options.temperature.unwrap_or(self.temperature),
            max_tokens: Some(options.max_tokens),
        };
        let attribution = CallAttribution {
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            step: None,
            task_id: Some(task_id.clone()),
        };

        match llm_completion(
            self.client.as_ref(),
            &request,
            options.streaming,
            &self.bus,
            &attribution,
        )
        .await
        {
            Ok(response) => Ok(response.trim().to_string()),
            Err(e) => {
                log::error!("Chat failed: {e}");
                self.bus
                    .emit(AgentEvent::ErrorOccurred {
                        meta: self.meta(Some(&task_id)),
                        error_message: e.to_string(),
                        step_number: Some(1),
                    })
                    .await;
                Err(AgentError::Completion(e))
            }
        }
    }
}
