//! Action execution: drives the sandbox, injects the tool namespace, and
//! reports every outcome as an [`ExecutionResult`].
//!
//! The executor never fails across its contract. Syntax errors, denied
//! imports, runtime exceptions, bad return shapes, and timeouts all come
//! back as `execution_status = error`; the one distinguished condition is
//! a declined tool confirmation, whose error message carries
//! [`CONFIRMATION_DECLINED`] so the ReAct core can abort the task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::events::{AgentEvent, ConfirmationHandle, EventBus, EventMeta, ParametersSummary};
use crate::sandbox::{self, SandboxError, Value};
use crate::tools::{Tool, ToolKwargs, ToolRegistry};

/// Error message marker for a declined tool confirmation.
pub const CONFIRMATION_DECLINED: &str = "User declined to execute tool";

/// Character budget for parameter and result summaries in events.
const SUMMARY_CHARS: usize = 100;

/// Mutable mapping carried across steps; owned by the ReAct core.
pub type ContextVars = HashMap<String, Json>;

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Outcome kind of a sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Structured outcome of running one action program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_status: ExecutionStatus,
    /// Error rendering when `execution_status == Error`.
    pub error: Option<String>,
    /// Wall-clock seconds the run took.
    pub execution_time: f64,
    /// Task status declared by `main()`: "completed" or "inprogress".
    pub task_status: Option<String>,
    /// String rendering of the user-visible value.
    pub result: Option<String>,
    /// Plan for the next iteration, when in progress.
    pub next_step: Option<String>,
    /// Stringified locals at termination, dunder- and callable-free.
    #[serde(default)]
    pub local_variables: BTreeMap<String, String>,
}

impl ExecutionResult {
    /// Successful run.
    pub fn success(
        task_status: impl Into<String>,
        result: impl Into<String>,
        next_step: Option<String>,
        execution_time: f64,
        local_variables: BTreeMap<String, String>,
    ) -> Self {
        Self {
            execution_status: ExecutionStatus::Success,
            error: None,
            execution_time,
            task_status: Some(task_status.into()),
            result: Some(result.into()),
            next_step,
            local_variables,
        }
    }

    /// Failed run.
    pub fn error(message: impl Into<String>, execution_time: f64) -> Self {
        Self {
            execution_status: ExecutionStatus::Error,
            error: Some(message.into()),
            execution_time,
            task_status: None,
            result: None,
            next_step: None,
            local_variables: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.execution_status == ExecutionStatus::Success
    }

    /// Whether this result is the distinguished confirmation-decline.
    pub fn is_confirmation_decline(&self) -> bool {
        self.error
            .as_deref()
            .map(|e| e.contains(CONFIRMATION_DECLINED))
            .unwrap_or(false)
    }

    /// Human-readable summary used in history rendering.
    pub fn to_summary(&self) -> String {
        let mut lines = vec![format!(
            "- Execution Status: {}",
            match self.execution_status {
                ExecutionStatus::Success => "success",
                ExecutionStatus::Error => "error",
            }
        )];
        if self.is_success() {
            lines.push(format!(
                "- Task Status: {}",
                self.task_status.as_deref().unwrap_or("N/A")
            ));
            lines.push(format!(
                "- Result: {}",
                self.result.as_deref().unwrap_or("N/A")
            ));
            if let Some(next_step) = self.next_step.as_deref() {
                lines.push(format!("- Next Step: {next_step}"));
            }
        } else {
            lines.push(format!(
                "- Error: {}",
                self.error.as_deref().unwrap_or("N/A")
            ));
        }
        lines.push(format!(
            "- Execution Time: {:.2} seconds",
            self.execution_time
        ));
        if !self.local_variables.is_empty() {
            lines.push("- Variables:".to_string());
            for (name, value) in &self.local_variables {
                let mut rendered: String = value.chars().take(500).collect();
                if value.chars().count() > 500 {
                    rendered.push_str("...");
                }
                lines.push(format!("  - {name}: {rendered}"));
            }
        }
        lines.join("\n")
    }

    /// The result as a JSON object, the shape returned from `solve`.
    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

// ---------------------------------------------------------------------------
// Tool host: the sandbox-facing adapter emitting lifecycle events
// ---------------------------------------------------------------------------

struct ToolHost {
    tools: HashMap<(String, String), Arc<dyn Tool>>,
    bus: Arc<EventBus>,
    agent_id: String,
    agent_name: String,
    task_id: Option<String>,
    step: usize,
}

impl ToolHost {
    fn meta(&self) -> EventMeta {
        EventMeta::new(&self.agent_id, &self.agent_name, self.task_id.clone())
    }

    async fn confirm(
        &self,
        tool: &Arc<dyn Tool>,
        qualified: &str,
        parameters_summary: &ParametersSummary,
    ) -> Result<(), SandboxError> {
        if !self.bus.has_observer_for("ToolConfirmationRequest") {
            return Err(SandboxError::Runtime(format!(
                "Tool {qualified} requires confirmation but no observer can respond"
            )));
        }
        let (handle, receiver) = ConfirmationHandle::channel();
        self.bus
            .emit(AgentEvent::ToolConfirmationRequest {
                meta: self.meta(),
                step_number: self.step,
                tool_name: qualified.to_string(),
                confirmation_message: tool.confirmation_message(),
                parameters_summary: parameters_summary.clone(),
                response: handle,
            })
            .await;

        let answer = receiver.await.unwrap_or_default();
        if matches!(
            answer.trim().to_lowercase().as_str(),
            "yes" | "y" | "ok" | "confirm"
        ) {
            Ok(())
        } else {
            log::debug!("User declined confirmation for {qualified}: '{answer}'");
            Err(SandboxError::Aborted(format!(
                "{CONFIRMATION_DECLINED}: {qualified}"
            )))
        }
    }
}

#[async_trait]
impl sandbox::ToolCaller for ToolHost {
    async fn call_tool(
        &self,
        toolbox: &str,
        name: &str,
        kwargs: Vec<(String, Json)>,
    ) -> Result<Json, SandboxError> {
        let key = (toolbox.to_string(), name.to_string());
        let tool = self.tools.get(&key).ok_or_else(|| {
            SandboxError::Runtime(format!(
                "AttributeError: toolbox '{toolbox}' has no tool '{name}'"
            ))
        })?;
        let qualified = format!("{toolbox}.{name}");
        let parameters_summary: ParametersSummary = kwargs
            .iter()
            .map(|(k, v)| (k.clone(), summarize_json(v)))
            .collect();

        if tool.requires_confirmation() {
            self.confirm(tool, &qualified, &parameters_summary).await?;
        }

        self.bus
            .emit(AgentEvent::ToolExecutionStarted {
                meta: self.meta(),
                step_number: self.step,
                tool_name: qualified.clone(),
                parameters_summary: parameters_summary.clone(),
            })
            .await;

        let kwargs_map: ToolKwargs = kwargs.into_iter().collect();
        match tool.async_execute(kwargs_map).await {
            Ok(result) => {
                self.bus
                    .emit(AgentEvent::ToolExecutionCompleted {
                        meta: self.meta(),
                        step_number: self.step,
                        tool_name: qualified,
                        result_summary: summarize_json(&result),
                    })
                    .await;
                Ok(result)
            }
            Err(e) => {
                self.bus
                    .emit(AgentEvent::ToolExecutionError {
                        meta: self.meta(),
                        step_number: self.step,
                        tool_name: qualified.clone(),
                        error: e.to_string(),
                    })
                    .await;
                Err(SandboxError::Runtime(format!(
                    "Tool {qualified} failed: {e}"
                )))
            }
        }
    }

    fn has_tool(&self, toolbox: &str, name: &str) -> bool {
        self.tools
            .contains_key(&(toolbox.to_string(), name.to_string()))
    }
}

/// Render a JSON value as `str(v)` truncated to the summary budget.
fn summarize_json(value: &Json) -> String {
    let rendered = match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    };
    summarize_str(&rendered)
}

fn summarize_str(rendered: &str) -> String {
    if rendered.chars().count() > SUMMARY_CHARS {
        let mut out: String = rendered.chars().take(SUMMARY_CHARS).collect();
        out.push_str("...");
        out
    } else {
        rendered.to_string()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs action programs against the tool namespace.
pub struct Executor {
    tools: RwLock<HashMap<(String, String), Arc<dyn Tool>>>,
    bus: Arc<EventBus>,
    agent_id: String,
    agent_name: String,
    allowed_modules: Vec<String>,
}

impl Executor {
    /// Build an executor over a snapshot of the registry.
    pub fn new(
        registry: &ToolRegistry,
        bus: Arc<EventBus>,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        allowed_modules: Vec<String>,
    ) -> Self {
        let tools = registry
            .get_tools()
            .into_iter()
            .map(|tool| {
                (
                    (tool.toolbox_name().to_string(), tool.name().to_string()),
                    tool,
                )
            })
            .collect();
        Self {
            tools: RwLock::new(tools),
            bus,
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            allowed_modules,
        }
    }

    /// Register an additional tool at runtime.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        let key = (tool.toolbox_name().to_string(), tool.name().to_string());
        self.tools.write().insert(key, tool);
    }

    /// Modules the sandbox allows the program to import.
    pub fn allowed_modules(&self) -> &[String] {
        &self.allowed_modules
    }

    /// Execute an action program.
    ///
    /// `context_vars` is read into the namespace before the run and
    /// updated in place with any writes the guest made to it.
    pub async fn execute_action(
        &self,
        code: &str,
        context_vars: &mut ContextVars,
        step: usize,
        timeout: Duration,
        task_id: Option<String>,
    ) -> ExecutionResult {
        if !sandbox::has_async_main(code) {
            log::error!("Invalid code at step {step}: lacks async main()");
            return ExecutionResult::error("Code lacks async main()", 0.0);
        }
        if timeout.is_zero() {
            return ExecutionResult::error("Execution timed out after 0 seconds", 0.0);
        }

        let host = Arc::new(ToolHost {
            tools: self.tools.read().clone(),
            bus: Arc::clone(&self.bus),
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            task_id,
            step,
        });

        // Namespace: toolboxes, context_vars, current step, asyncio.
        let context_cell = Value::dict(
            context_vars
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        );
        let mut namespace: HashMap<String, Value> = HashMap::new();
        for (toolbox, _) in self.tools.read().keys() {
            namespace
                .entry(toolbox.clone())
                .or_insert_with(|| Value::Toolbox(toolbox.clone()));
        }
        namespace.insert("context_vars".to_string(), context_cell.clone());
        namespace.insert("current_step".to_string(), Value::Int(step as i64));
        namespace.insert("asyncio".to_string(), Value::Module("asyncio".to_string()));

        let started = Instant::now();
        let run = sandbox::run_program(
            code,
            namespace,
            &self.allowed_modules,
            Some(host as Arc<dyn sandbox::ToolCaller>),
            "main",
        );
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::error!("Execution timed out at step {step}");
                return ExecutionResult::error(
                    format!("Execution timed out after {} seconds", timeout.as_secs()),
                    timeout.as_secs_f64(),
                );
            }
        };
        let execution_time = started.elapsed().as_secs_f64();

        // Persist guest writes to context_vars.
        if let Value::Dict(entries) = &context_cell {
            let snapshot = entries.lock().clone();
            context_vars.clear();
            for (key, value) in snapshot {
                context_vars.insert(key, value.to_json());
            }
        }

        match outcome {
            Ok(run_output) => self.validate_return(run_output, step, execution_time),
            Err(e) => {
                if matches!(e, SandboxError::Aborted(_)) {
                    log::debug!("Task aborted during step {step}: {e}");
                } else {
                    log::error!("Execution error at step {step}: {e}");
                }
                ExecutionResult::error(e.to_string(), execution_time)
            }
        }
    }

    fn validate_return(
        &self,
        run_output: sandbox::RunOutput,
        step: usize,
        execution_time: f64,
    ) -> ExecutionResult {
        let Value::Dict(entries) = &run_output.result else {
            log::error!("Invalid return format at step {step}: expected dict");
            return ExecutionResult::error(
                "main() did not return a valid dictionary with 'status' and 'result'",
                execution_time,
            );
        };
        let entries = entries.lock().clone();
        let field =
            |name: &str| entries.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
        let (Some(status), Some(result)) = (field("status"), field("result")) else {
            log::error!("Invalid return format at step {step}: missing 'status'/'result'");
            return ExecutionResult::error(
                "main() did not return a valid dictionary with 'status' and 'result'",
                execution_time,
            );
        };

        let local_variables: BTreeMap<String, String> = run_output
            .locals
            .iter()
            .filter(|(name, value)| !name.starts_with("__") && !value.is_callable())
            .map(|(name, value)| (name.clone(), value.display()))
            .collect();

        log::info!(
            "Execution successful at step {step}, task status: {}",
            status.display()
        );
        ExecutionResult::success(
            status.display(),
            result.display(),
            field("next_step")
                .filter(|v| !matches!(v, Value::None))
                .map(|v| v.display()),
            execution_time,
            local_variables,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FunctionTool, ToolArgument};
    use serde_json::json;

    fn executor_with_math() -> Executor {
        let registry = ToolRegistry::new();
        registry.register_module(crate::tools::math_tools::get_tools(), "math_tools");
        Executor::new(
            &registry,
            Arc::new(EventBus::new()),
            "agent-id",
            "agent-name",
            sandbox::DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_successful_run_with_tool() {
        let executor = executor_with_math();
        let mut context_vars = ContextVars::new();
        let code = "async def main():\n    product = await math_tools.multiply(x=6, y=7)\n    return {\"status\": \"completed\", \"result\": str(product)}\n";
        let result = executor
            .execute_action(code, &mut context_vars, 1, Duration::from_secs(30), None)
            .await;
        assert!(result.is_success());
        assert_eq!(result.result.as_deref(), Some("42"));
        assert_eq!(result.task_status.as_deref(), Some("completed"));
        assert_eq!(result.local_variables.get("product").unwrap(), "42");
    }

    #[tokio::test]
    async fn test_missing_main_is_error() {
        let executor = executor_with_math();
        let mut context_vars = ContextVars::new();
        let result = executor
            .execute_action("x = 1\n", &mut context_vars, 1, Duration::from_secs(5), None)
            .await;
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("Code lacks async main()"));
    }

    #[tokio::test]
    async fn test_zero_timeout_is_error_without_partial_locals() {
        let executor = executor_with_math();
        let mut context_vars = ContextVars::new();
        let code = "async def main():\n    return {\"status\": \"completed\", \"result\": \"x\"}\n";
        let result = executor
            .execute_action(code, &mut context_vars, 1, Duration::ZERO, None)
            .await;
        assert!(!result.is_success());
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        assert!(result.local_variables.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_interrupts_long_run() {
        let executor = executor_with_math();
        let mut context_vars = ContextVars::new();
        let code = "import asyncio\nasync def main():\n    await asyncio.sleep(30)\n    return {\"status\": \"completed\", \"result\": \"late\"}\n";
        let result = executor
            .execute_action(code, &mut context_vars, 1, Duration::from_millis(50), None)
            .await;
        assert!(!result.is_success());
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_return_shape() {
        let executor = executor_with_math();
        let mut context_vars = ContextVars::new();
        let code = "async def main():\n    return \"just a string\"\n";
        let result = executor
            .execute_action(code, &mut context_vars, 1, Duration::from_secs(5), None)
            .await;
        assert!(!result.is_success());
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("did not return a valid dictionary"));
    }

    #[tokio::test]
    async fn test_import_violation_reported() {
        let executor = executor_with_math();
        let mut context_vars = ContextVars::new();
        let code = "import subprocess\nasync def main():\n    return {\"status\": \"completed\", \"result\": \"x\"}\n";
        let result = executor
            .execute_action(code, &mut context_vars, 1, Duration::from_secs(5), None)
            .await;
        assert!(!result.is_success());
        assert!(result.error.as_deref().unwrap().contains("subprocess"));
    }

    #[tokio::test]
    async fn test_context_vars_flow_both_ways() {
        let executor = executor_with_math();
        let mut context_vars = ContextVars::new();
        context_vars.insert("seed".to_string(), json!("carried"));
        let code = "async def main():\n    v = context_vars[\"seed\"]\n    context_vars[\"written\"] = \"by-guest\"\n    return {\"status\": \"inprogress\", \"result\": v, \"next_step\": \"more\"}\n";
        let result = executor
            .execute_action(code, &mut context_vars, 2, Duration::from_secs(5), None)
            .await;
        assert!(result.is_success());
        assert_eq!(result.result.as_deref(), Some("carried"));
        assert_eq!(result.next_step.as_deref(), Some("more"));
        assert_eq!(context_vars.get("written").unwrap(), &json!("by-guest"));
    }

    #[tokio::test]
    async fn test_confirmation_without_observer_is_error() {
        let registry = ToolRegistry::new();
        registry.register(
            FunctionTool::builder("wipe", |_k| async { Ok(json!("done")) })
                .description("Dangerous.")
                .argument(ToolArgument::required("path", "string", "target"))
                .requires_confirmation(true)
                .build(),
        );
        let executor = Executor::new(
            &registry,
            Arc::new(EventBus::new()),
            "agent-id",
            "agent-name",
            vec!["asyncio".to_string()],
        );
        let mut context_vars = ContextVars::new();
        let code = "async def main():\n    r = await default.wipe(path=\"/tmp/x\")\n    return {\"status\": \"completed\", \"result\": str(r)}\n";
        let result = executor
            .execute_action(code, &mut context_vars, 1, Duration::from_secs(5), None)
            .await;
        assert!(!result.is_success());
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("no observer can respond"));
    }

    #[tokio::test]
    async fn test_tool_error_stays_in_result() {
        let registry = ToolRegistry::new();
        registry.register(
            FunctionTool::builder("boom", |_k| async {
                anyhow::bail!("exploded")
            })
            .description("Always fails.")
            .build(),
        );
        let executor = Executor::new(
            &registry,
            Arc::new(EventBus::new()),
            "agent-id",
            "agent-name",
            vec!["asyncio".to_string()],
        );
        let mut context_vars = ContextVars::new();
        let code = "async def main():\n    r = await default.boom()\n    return {\"status\": \"completed\", \"result\": str(r)}\n";
        let result = executor
            .execute_action(code, &mut context_vars, 1, Duration::from_secs(5), None)
            .await;
        assert!(!result.is_success());
        assert!(result.error.as_deref().unwrap().contains("exploded"));
    }
}
