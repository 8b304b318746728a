//! End-to-end `solve`/`chat` scenarios driven by a scripted LLM client.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;

use codeact::agent::{Agent, SolveOptions};
use codeact::config::AgentConfig;
use codeact::events::{AgentEvent, ChannelObserver, Observer};
use codeact::llm::{
    CompletionRequest, LlmClient, LlmError, TokenStream, STREAM_FALLBACK_NOTICE,
};
use codeact::tools::{FunctionTool, ToolArgument, ToolKwargs};

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

/// Plays back a queue of action programs; answers judge prompts with a
/// fixed verdict. When the queue runs dry it keeps the task in progress.
struct ScriptedLlm {
    programs: Mutex<VecDeque<String>>,
    judge: String,
    stream_fails: bool,
}

impl ScriptedLlm {
    fn new(programs: Vec<&str>, judge: &str) -> Self {
        Self {
            programs: Mutex::new(programs.into_iter().map(String::from).collect()),
            judge: judge.to_string(),
            stream_fails: false,
        }
    }

    fn failing_stream(mut self) -> Self {
        self.stream_fails = true;
        self
    }
}

const INPROGRESS_PROGRAM: &str = "async def main():\n    return {\"status\": \"inprogress\", \"result\": \"thinking\", \"next_step\": \"keep going\"}";

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if last.contains("Reply with exactly one word") {
            return Ok(self.judge.clone());
        }
        Ok(self
            .programs
            .lock()
            .pop_front()
            .unwrap_or_else(|| INPROGRESS_PROGRAM.to_string()))
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<TokenStream, LlmError> {
        if self.stream_fails {
            return Err(LlmError::Api("streaming rejected by provider".into()));
        }
        let text = self.complete(request).await?;
        let tokens: Vec<Result<String, LlmError>> =
            text.chars().map(|c| Ok(c.to_string())).collect();
        Ok(futures::stream::iter(tokens).boxed())
    }
}

/// Observer answering every confirmation request with a fixed response.
struct AutoConfirm(&'static str);

#[async_trait]
impl Observer for AutoConfirm {
    async fn on_event(&self, event: AgentEvent) {
        if let AgentEvent::ToolConfirmationRequest { response, .. } = event {
            response.respond(self.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn agent_with(client: ScriptedLlm) -> Agent {
    init_logs();
    Agent::with_client(AgentConfig::default(), Arc::new(client)).unwrap()
}

fn capture_events(agent: &Agent) -> tokio::sync::mpsc::UnboundedReceiver<AgentEvent> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    agent.add_observer(
        Arc::new(ChannelObserver::new(tx)),
        AgentEvent::all_event_types(),
    );
    rx
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn event_names(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

fn solve_options(task: &str, max_iterations: usize) -> SolveOptions {
    SolveOptions {
        task: task.to_string(),
        max_iterations: Some(max_iterations),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// S1: single-step success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_single_step_success() {
    let client = ScriptedLlm::new(
        vec!["async def main():\n    return {\"status\": \"completed\", \"result\": \"4\"}"],
        "yes",
    );
    let mut agent = agent_with(client);
    let mut rx = capture_events(&agent);

    let records = agent
        .solve(solve_options("What is 2+2? Reply just the number.", 1))
        .await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["step_number"], 1);
    assert_eq!(records[0]["result"]["result"], "4");

    let events = drain(&mut rx);
    let completed = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::TaskCompleted {
                final_answer,
                reason,
                ..
            } => Some((final_answer.clone(), *reason)),
            _ => None,
        })
        .expect("TaskCompleted fired");
    assert_eq!(completed.0.as_deref(), Some("4"));
    assert_eq!(completed.1, codeact::events::CompletionReason::Success);
}

// ---------------------------------------------------------------------------
// S2: tool invocation with ordered events
// ---------------------------------------------------------------------------

fn multiply_tool() -> Arc<dyn codeact::tools::Tool> {
    FunctionTool::builder("multiply", |kwargs: ToolKwargs| async move {
        let x = codeact::tools::kwarg_i64(&kwargs, "x")?;
        let y = codeact::tools::kwarg_i64(&kwargs, "y")?;
        Ok(json!(x * y))
    })
    .description("Multiplies two integers.")
    .argument(ToolArgument::required("x", "int", "First factor"))
    .argument(ToolArgument::required("y", "int", "Second factor"))
    .return_type("int")
    .build()
}

#[tokio::test]
async fn s2_tool_invocation_event_order() {
    let client = ScriptedLlm::new(
        vec![
            "async def main():\n    product = await default.multiply(x=6, y=7)\n    return {\"status\": \"completed\", \"result\": str(product)}",
        ],
        "yes",
    );
    let mut agent = agent_with(client);
    agent.register_tool(multiply_tool()).unwrap();
    let mut rx = capture_events(&agent);

    let records = agent
        .solve(solve_options("Use `math.multiply` to compute 6 × 7.", 2))
        .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["result"]["result"], "42");

    let events = drain(&mut rx);
    let names = event_names(&events);
    let expected = [
        "TaskStarted",
        "StepStarted",
        "PromptGenerated",
        "ThoughtGenerated",
        "ActionGenerated",
        "ToolExecutionStarted",
        "ToolExecutionCompleted",
        "ActionExecuted",
        "StepCompleted",
        "TaskCompleted",
    ];
    assert_eq!(names, expected);

    for event in &events {
        match event {
            AgentEvent::ToolExecutionStarted {
                tool_name,
                parameters_summary,
                ..
            } => {
                assert_eq!(tool_name, "default.multiply");
                assert_eq!(parameters_summary.get("x").unwrap(), "6");
                assert_eq!(parameters_summary.get("y").unwrap(), "7");
            }
            AgentEvent::ToolExecutionCompleted { result_summary, .. } => {
                assert_eq!(result_summary, "42");
            }
            AgentEvent::StepCompleted {
                is_complete,
                final_answer,
                ..
            } => {
                assert!(is_complete);
                assert_eq!(final_answer.as_deref(), Some("42"));
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// S3: abort on confirmation decline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_abort_on_confirmation_decline() {
    let client = ScriptedLlm::new(
        vec![
            "async def main():\n    r = await default.delete_file(path=\"/tmp/scratch\")\n    return {\"status\": \"completed\", \"result\": str(r)}",
        ],
        "yes",
    );
    let mut agent = agent_with(client);
    agent
        .register_tool(
            FunctionTool::builder("delete_file", |_k: ToolKwargs| async {
                Ok(json!("deleted"))
            })
            .description("Deletes a file.")
            .argument(ToolArgument::required("path", "string", "File to delete"))
            .requires_confirmation(true)
            .confirmation_message("Really delete?")
            .build(),
        )
        .unwrap();
    agent.add_observer(
        Arc::new(AutoConfirm("no")),
        vec!["ToolConfirmationRequest".to_string()],
    );
    let mut rx = capture_events(&agent);

    let records = agent.solve(solve_options("Clean up the scratch file.", 3)).await;

    // One recorded step plus the trailing abort record.
    assert_eq!(records.len(), 2);
    let step = &records[0];
    assert_eq!(step["aborted"], true);
    assert!(step["result"]["error"]
        .as_str()
        .unwrap()
        .contains("User declined to execute tool"));
    let tail = &records[1];
    assert_eq!(tail["aborted"], true);
    assert_eq!(tail["task_status"], "aborted");
    assert!(tail["error"].as_str().unwrap().contains("aborted by user"));

    let events = drain(&mut rx);
    let names = event_names(&events);
    assert!(names.contains(&"ToolConfirmationRequest"));
    assert!(!names.contains(&"ToolExecutionStarted"));
    assert!(!names.contains(&"TaskCompleted"));
}

#[tokio::test]
async fn confirmation_accept_runs_tool() {
    let client = ScriptedLlm::new(
        vec![
            "async def main():\n    r = await default.delete_file(path=\"/tmp/scratch\")\n    return {\"status\": \"completed\", \"result\": str(r)}",
        ],
        "yes",
    );
    let mut agent = agent_with(client);
    agent
        .register_tool(
            FunctionTool::builder("delete_file", |_k: ToolKwargs| async {
                Ok(json!("deleted"))
            })
            .description("Deletes a file.")
            .argument(ToolArgument::required("path", "string", "File to delete"))
            .requires_confirmation(true)
            .build(),
        )
        .unwrap();
    agent.add_observer(
        Arc::new(AutoConfirm("yes")),
        vec!["ToolConfirmationRequest".to_string()],
    );
    let mut rx = capture_events(&agent);

    let records = agent.solve(solve_options("Clean up the scratch file.", 3)).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["result"]["result"], "deleted");

    let events = drain(&mut rx);
    let names = event_names(&events);
    let request_at = names
        .iter()
        .position(|n| *n == "ToolConfirmationRequest")
        .unwrap();
    let started_at = names
        .iter()
        .position(|n| *n == "ToolExecutionStarted")
        .unwrap();
    assert!(request_at < started_at);
}

// ---------------------------------------------------------------------------
// S4: max iterations reached
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_max_iterations_reached() {
    let client = ScriptedLlm::new(Vec::new(), "yes");
    let mut agent = agent_with(client);
    let mut rx = capture_events(&agent);

    let records = agent.solve(solve_options("Never finishes.", 3)).await;
    assert_eq!(records.len(), 3);
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record["step_number"], index + 1);
        assert_eq!(record["result"]["task_status"], "inprogress");
        assert_eq!(record["result"]["next_step"], "keep going");
    }

    let events = drain(&mut rx);
    let completed = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::TaskCompleted {
                final_answer,
                reason,
                ..
            } => Some((final_answer.clone(), *reason)),
            _ => None,
        })
        .expect("TaskCompleted fired");
    assert_eq!(completed.0, None);
    assert_eq!(
        completed.1,
        codeact::events::CompletionReason::MaxIterationsReached
    );
}

// ---------------------------------------------------------------------------
// S5: streaming fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_streaming_fallback() {
    let client = ScriptedLlm::new(
        vec!["async def main():\n    return {\"status\": \"completed\", \"result\": \"hi\"}"],
        "yes",
    )
    .failing_stream();
    let mut agent = agent_with(client);
    let mut rx = capture_events(&agent);

    let mut options = solve_options("Say hi.", 1);
    options.streaming = true;
    let records = agent.solve(options).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["result"]["result"], "hi");

    let events = drain(&mut rx);
    let stream_tokens: Vec<&AgentEvent> = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::StreamToken { .. }))
        .collect();
    assert_eq!(stream_tokens.len(), 1);
    match stream_tokens[0] {
        AgentEvent::StreamToken { token, .. } => assert_eq!(token, STREAM_FALLBACK_NOTICE),
        _ => unreachable!(),
    }
    let completed = events.iter().any(|e| {
        matches!(
            e,
            AgentEvent::TaskCompleted {
                reason: codeact::events::CompletionReason::Success,
                ..
            }
        )
    });
    assert!(completed);
}

// ---------------------------------------------------------------------------
// S6: history retrieval via id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_history_retrieval_via_id() {
    init_logs();
    // The program needs the real message id, so the script is filled in
    // after the messages exist.
    let client = Arc::new(ScriptedLlm::new(Vec::new(), "yes"));
    let mut agent =
        Agent::with_client(AgentConfig::default(), client.clone() as Arc<dyn LlmClient>)
            .unwrap();

    let assistant_content = "The meaning of life is 42.";
    let i2 = {
        let mut conversation = agent.conversation().write();
        conversation.add_message(
            codeact::conversation::Role::User,
            "What is the meaning of life?",
        );
        conversation.add_message(codeact::conversation::Role::Assistant, assistant_content)
    };
    client.programs.lock().push_back(format!(
        "async def main():\n    content = await default.retrieve_message(nanoid=\"{i2}\")\n    return {{\"status\": \"completed\", \"result\": content}}"
    ));

    let records = agent
        .solve(solve_options("Retrieve the assistant's last message.", 1))
        .await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["result"]["result"], assistant_content);
}

// ---------------------------------------------------------------------------
// Boundary and invariant checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_iterations_completes_with_empty_list() {
    let client = ScriptedLlm::new(Vec::new(), "yes");
    let mut agent = agent_with(client);
    let mut rx = capture_events(&agent);

    let records = agent.solve(solve_options("Anything.", 0)).await;
    assert!(records.is_empty());

    let events = drain(&mut rx);
    let completed = events.iter().any(|e| {
        matches!(
            e,
            AgentEvent::TaskCompleted {
                reason: codeact::events::CompletionReason::MaxIterationsReached,
                ..
            }
        )
    });
    assert!(completed);
}

#[tokio::test]
async fn event_metadata_is_complete_and_unique() {
    let client = ScriptedLlm::new(
        vec!["async def main():\n    return {\"status\": \"completed\", \"result\": \"done\"}"],
        "yes",
    );
    let mut agent = agent_with(client);
    let mut rx = capture_events(&agent);

    agent.solve(solve_options("Quick task.", 1)).await;

    let events = drain(&mut rx);
    assert!(!events.is_empty());
    let mut seen_ids = std::collections::HashSet::new();
    for event in &events {
        let meta = event.meta();
        assert!(!meta.agent_id.is_empty());
        assert!(!meta.agent_name.is_empty());
        assert_eq!(meta.event_id.len(), 21);
        assert!(seen_ids.insert(meta.event_id.clone()), "duplicate event id");
        assert!(meta.task_id.is_some());
    }
}

#[tokio::test]
async fn context_vars_accumulate_across_steps() {
    let client = ScriptedLlm::new(
        vec![
            "async def main():\n    first = \"alpha\"\n    return {\"status\": \"inprogress\", \"result\": \"step one\", \"next_step\": \"use first\"}",
            "async def main():\n    second = context_vars[\"first\"] + \"-beta\"\n    return {\"status\": \"completed\", \"result\": second}",
        ],
        "yes",
    );
    let mut agent = agent_with(client);

    let records = agent.solve(solve_options("Chain variables.", 3)).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["result"]["result"], "alpha-beta");

    let context_vars = agent.get_context_vars();
    assert_eq!(context_vars.get("first").unwrap(), &json!("alpha"));
    assert_eq!(context_vars.get("second").unwrap(), &json!("alpha-beta"));
    assert!(context_vars.contains_key("conversation_history"));
}

#[tokio::test]
async fn executor_error_feeds_next_step() {
    let client = ScriptedLlm::new(
        vec![
            "async def main():\n    x = 1 / 0\n    return {\"status\": \"completed\", \"result\": \"never\"}",
            "async def main():\n    return {\"status\": \"completed\", \"result\": \"recovered\"}",
        ],
        "yes",
    );
    let mut agent = agent_with(client);

    let records = agent.solve(solve_options("Divide things.", 3)).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["result"]["execution_status"], "error");
    assert!(records[0]["result"]["error"]
        .as_str()
        .unwrap()
        .contains("ZeroDivisionError"));
    assert_eq!(records[1]["result"]["result"], "recovered");
}

#[tokio::test]
async fn success_criteria_completes_without_judge() {
    let client = ScriptedLlm::new(
        vec![
            "async def main():\n    return {\"status\": \"inprogress\", \"result\": \"found DONE marker\", \"next_step\": \"n/a\"}",
        ],
        "no",
    );
    let mut agent = agent_with(client);

    let mut options = solve_options("Scan for the marker.", 2);
    options.success_criteria = Some("DONE".to_string());
    let records = agent.solve(options).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["result"]["result"], "found DONE marker");
}
