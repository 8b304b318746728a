//! Reasoner: turns task + history into the next `<Action>` document.
//!
//! Prompt assembly is template-driven; the model's raw output is cleaned
//! (fences unwrapped, dedented), wrapped into the XML envelope, and
//! validated. Up to three generation attempts are made before a
//! well-formed error Action is returned instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tera::Context;

use crate::conversation::Message;
use crate::errors::AgentError;
use crate::events::{AgentEvent, EventBus, EventMeta};
use crate::llm::{llm_completion, CallAttribution, ChatMessage, CompletionRequest, LlmClient};
use crate::templates::{TemplateEngine, ACTION_PROGRAM, RESPONSE_FORMAT};
use crate::tools::Tool;
use crate::xml;

/// Generation attempts before giving up on a step.
const MAX_GENERATION_ATTEMPTS: u32 = 3;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:[\w+-]*)\n([\s\S]*?)```").expect("static regex"));

// ---------------------------------------------------------------------------
// Prompt strategy
// ---------------------------------------------------------------------------

/// Inputs the prompt strategy renders from.
pub struct PromptInputs<'a> {
    pub task: &'a str,
    pub history_str: &'a str,
    pub step: usize,
    pub max_iterations: usize,
    pub available_vars: &'a [String],
    pub allowed_modules: &'a [String],
}

/// Pluggable prompt assembly.
pub trait PromptStrategy: Send + Sync {
    fn generate_prompt(
        &self,
        inputs: &PromptInputs<'_>,
        tools: &[Arc<dyn Tool>],
        templates: &TemplateEngine,
    ) -> Result<String, AgentError>;
}

/// Default strategy: the `action_program` template with tools grouped by
/// toolbox and rendered as docstrings.
pub struct DefaultPromptStrategy;

impl PromptStrategy for DefaultPromptStrategy {
    fn generate_prompt(
        &self,
        inputs: &PromptInputs<'_>,
        tools: &[Arc<dyn Tool>],
        templates: &TemplateEngine,
    ) -> Result<String, AgentError> {
        let mut tools_by_toolbox: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tool in tools {
            tools_by_toolbox
                .entry(tool.toolbox_name().to_string())
                .or_default()
                .push(tool.to_docstring());
        }

        let mut context = Context::new();
        context.insert("task_description", inputs.task);
        context.insert("history_str", inputs.history_str);
        context.insert("current_step", &inputs.step);
        context.insert("max_iterations", &inputs.max_iterations);
        context.insert("tools_by_toolbox", &tools_by_toolbox);
        context.insert("available_vars", inputs.available_vars);
        context.insert("allowed_modules", inputs.allowed_modules);
        templates.render(ACTION_PROGRAM, &context)
    }
}

// ---------------------------------------------------------------------------
// Reasoner
// ---------------------------------------------------------------------------

/// Arguments to one action generation.
pub struct GenerateActionRequest<'a> {
    pub task: &'a str,
    pub history_str: &'a str,
    pub step: usize,
    pub max_iterations: usize,
    pub system_prompt: Option<&'a str>,
    pub streaming: bool,
    pub available_vars: Vec<String>,
    pub allowed_modules: Vec<String>,
    pub conversation_history: &'a [Message],
    pub task_id: Option<String>,
}

/// Generates actions with the language model.
pub struct Reasoner {
    pub model: String,
    pub temperature: f64,
    client: Arc<dyn LlmClient>,
    templates: TemplateEngine,
    tools: Vec<Arc<dyn Tool>>,
    prompt_strategy: Box<dyn PromptStrategy>,
    agent_id: String,
    agent_name: String,
}

impl Reasoner {
    pub fn new(
        model: impl Into<String>,
        temperature: f64,
        client: Arc<dyn LlmClient>,
        templates: TemplateEngine,
        tools: Vec<Arc<dyn Tool>>,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            temperature,
            client,
            templates,
            tools,
            prompt_strategy: Box::new(DefaultPromptStrategy),
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
        }
    }

    /// Swap in a custom prompt strategy.
    pub fn with_prompt_strategy(mut self, strategy: Box<dyn PromptStrategy>) -> Self {
        self.prompt_strategy = strategy;
        self
    }

    /// Generate the next `<Action>` document.
    ///
    /// Always returns a well-formed document: after three failed
    /// attempts the error Action is returned instead. Only the
    /// non-recoverable completion error propagates.
    pub async fn generate_action(
        &self,
        request: GenerateActionRequest<'_>,
        bus: &EventBus,
    ) -> Result<String, AgentError> {
        let attribution = CallAttribution {
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            step: Some(request.step),
            task_id: request.task_id.clone(),
        };

        // Past messages carry their ids so the model can cite them for
        // later retrieval.
        let conversation: Vec<ChatMessage> = request
            .conversation_history
            .iter()
            .map(|message| {
                ChatMessage::new(
                    message.role.as_str(),
                    format!("nanoid:{}\n{}", message.nanoid, message.content),
                )
            })
            .collect();

        let task_for_prompt = match request.system_prompt.filter(|s| !s.is_empty()) {
            Some(system_prompt) => {
                format!(
                    "### Personality Prompt: {system_prompt}\n### Task: {}",
                    request.task
                )
            }
            None => request.task.to_string(),
        };
        let prompt = self.prompt_strategy.generate_prompt(
            &PromptInputs {
                task: &task_for_prompt,
                history_str: request.history_str,
                step: request.step,
                max_iterations: request.max_iterations,
                available_vars: &request.available_vars,
                allowed_modules: &request.allowed_modules,
            },
            &self.tools,
            &self.templates,
        )?;

        bus.emit(AgentEvent::PromptGenerated {
            meta: EventMeta::new(&self.agent_id, &self.agent_name, request.task_id.clone()),
            step_number: request.step,
            prompt: prompt.clone(),
        })
        .await;

        let mut messages =
            vec![ChatMessage::new("system", "You are a Python code generator.")];
        messages.extend(conversation);
        messages.push(ChatMessage::new("user", prompt));

        let completion = CompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: None,
        };

        let mut last_failure = String::new();
        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let response = match llm_completion(
                self.client.as_ref(),
                &completion,
                request.streaming,
                bus,
                &attribution,
            )
            .await
            {
                Ok(response) => response,
                // Non-recoverable by construction: the helper has already
                // exhausted its own retries.
                Err(e) => return Err(AgentError::Completion(e)),
            };

            match self.envelope(&response, &request) {
                Ok(action) => return Ok(action),
                Err(e) => {
                    last_failure = e.to_string();
                    log::warn!(
                        "Attempt {attempt} failed at step {}: {last_failure}. Retrying...",
                        request.step
                    );
                }
            }
        }

        log::error!(
            "Action generation failed after {MAX_GENERATION_ATTEMPTS} attempts: {last_failure}"
        );
        Ok(xml::format_error_result(&format!(
            "Code generation failed with {} after {MAX_GENERATION_ATTEMPTS} attempts: {last_failure}",
            self.model
        )))
    }

    /// Clean the raw response, wrap it in the envelope, and validate.
    fn envelope(
        &self,
        response: &str,
        request: &GenerateActionRequest<'_>,
    ) -> Result<String, AgentError> {
        let program = clean_code(response);
        if program.is_empty() {
            return Err(AgentError::Parsing(
                "no code extracted from response".into(),
            ));
        }

        let mut context = Context::new();
        context.insert("task", request.task);
        context.insert("history_str", request.history_str);
        context.insert("program", &xml::cdata_escape(&program));
        context.insert("current_step", &request.step);
        context.insert("max_iterations", &request.max_iterations);
        let action = self.templates.render(RESPONSE_FORMAT, &context)?;

        if !xml::validate_xml(&action) {
            return Err(AgentError::Parsing("invalid XML generated".into()));
        }
        let (_thought, code) = xml::parse_action_response(&action)?;
        if code.is_empty() {
            return Err(AgentError::Parsing(
                "no valid code extracted from response".into(),
            ));
        }
        Ok(action)
    }
}

/// Unwrap a fenced code block if present, strip stray backticks, and
/// dedent.
pub fn clean_code(raw: &str) -> String {
    let content = match FENCED_BLOCK.captures(raw) {
        Some(captures) => captures[1].to_string(),
        None => raw.to_string(),
    };
    let content = content.trim_matches(|c: char| c == '`' || c.is_whitespace());
    dedent(content)
}

/// Remove the common leading indentation of all non-empty lines.
fn dedent(text: &str) -> String {
    let common_indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    if common_indent == 0 {
        return text.trim_end().to_string();
    }
    text.lines()
        .map(|line| {
            if line.len() >= common_indent {
                &line[common_indent..]
            } else {
                line.trim_start()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    struct FixedModel(&'static str);

    #[async_trait]
    impl LlmClient for FixedModel {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    struct EmptyModel;

    #[async_trait]
    impl LlmClient for EmptyModel {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
            Ok("   ".to_string())
        }
    }

    fn reasoner(client: Arc<dyn LlmClient>) -> Reasoner {
        Reasoner::new(
            "test-model",
            0.3,
            client,
            TemplateEngine::new(),
            Vec::new(),
            "agent-id",
            "agent-name",
        )
    }

    fn request() -> GenerateActionRequest<'static> {
        GenerateActionRequest {
            task: "What is 2+2?",
            history_str: "No previous steps",
            step: 1,
            max_iterations: 3,
            system_prompt: None,
            streaming: false,
            available_vars: Vec::new(),
            allowed_modules: vec!["asyncio".to_string()],
            conversation_history: &[],
            task_id: None,
        }
    }

    #[test]
    fn test_clean_code_unwraps_fences() {
        let raw = "```python\nasync def main():\n    return 1\n```";
        let cleaned = clean_code(raw);
        assert!(cleaned.starts_with("async def main()"));
        assert!(!cleaned.contains("```"));
    }

    #[test]
    fn test_clean_code_dedents() {
        let raw = "    async def main():\n        return 1";
        let cleaned = clean_code(raw);
        assert!(cleaned.starts_with("async def main()"));
        assert!(cleaned.contains("\n    return 1"));
    }

    #[tokio::test]
    async fn test_generate_action_produces_envelope() {
        let program =
            "async def main():\n    return {\"status\": \"completed\", \"result\": \"4\"}";
        let reasoner = reasoner(Arc::new(FixedModel(
            "```python\nasync def main():\n    return {\"status\": \"completed\", \"result\": \"4\"}\n```",
        )));
        let bus = EventBus::new();
        let action = reasoner.generate_action(request(), &bus).await.unwrap();
        assert!(xml::validate_xml(&action));
        let (thought, code) = xml::parse_action_response(&action).unwrap();
        assert!(!thought.is_empty());
        assert_eq!(code, program);
    }

    #[tokio::test]
    async fn test_envelope_roundtrip_is_stable() {
        let reasoner = reasoner(Arc::new(FixedModel(
            "async def main():\n    return {\"status\": \"completed\", \"result\": \"ok\"}",
        )));
        let bus = EventBus::new();
        let action = reasoner.generate_action(request(), &bus).await.unwrap();
        let (thought_a, code_a) = xml::parse_action_response(&action).unwrap();

        // Re-embed through the same template and parse again.
        let mut context = Context::new();
        context.insert("task", "What is 2+2?");
        context.insert("history_str", "No previous steps");
        context.insert("program", &xml::cdata_escape(&code_a));
        context.insert("current_step", &1usize);
        context.insert("max_iterations", &3usize);
        let re_embedded = TemplateEngine::new()
            .render(RESPONSE_FORMAT, &context)
            .unwrap();
        let (thought_b, code_b) = xml::parse_action_response(&re_embedded).unwrap();
        assert_eq!(thought_a, thought_b);
        assert_eq!(code_a, code_b);
    }

    #[tokio::test]
    async fn test_empty_responses_yield_error_action() {
        let reasoner = reasoner(Arc::new(EmptyModel));
        let bus = EventBus::new();
        let action = reasoner.generate_action(request(), &bus).await.unwrap();
        let (thought, code) = xml::parse_action_response(&action).unwrap();
        assert!(thought.contains("Failed to generate valid action"));
        assert!(code.contains("Error: Action generation failed"));
    }

    #[tokio::test]
    async fn test_prompt_contains_tools_and_modules() {
        let tools = crate::tools::math_tools::get_tools();
        let prompt = DefaultPromptStrategy
            .generate_prompt(
                &PromptInputs {
                    task: "do math",
                    history_str: "No previous steps",
                    step: 1,
                    max_iterations: 5,
                    available_vars: &["prior".to_string()],
                    allowed_modules: &["math".to_string(), "asyncio".to_string()],
                },
                &tools,
                &TemplateEngine::new(),
            )
            .unwrap();
        assert!(prompt.contains("math.multiply"));
        assert!(prompt.contains("`prior`"));
        assert!(prompt.contains("math, asyncio"));
        assert!(prompt.contains("async def main()"));
    }
}
