//! Completion evaluation: decides whether a step's result finishes the
//! task.
//!
//! Decision order: failed executions are never complete; a declared
//! `completed` status is verified by an LLM judge; otherwise an optional
//! success-criteria substring check applies. Evaluation never raises;
//! any internal failure reads as "not complete yet".

use std::sync::Arc;

use async_trait::async_trait;
use tera::Context;

use crate::events::EventBus;
use crate::executor::ExecutionResult;
use crate::llm::{llm_completion, CallAttribution, ChatMessage, CompletionRequest, LlmClient};
use crate::templates::{TemplateEngine, IS_TASK_COMPLETE};

/// Token cap for the judge's one-word verdict.
const JUDGE_MAX_TOKENS: u32 = 20;

/// Inputs to one completion evaluation.
pub struct EvaluationRequest<'a> {
    pub task: &'a str,
    pub formatted_history: &'a str,
    pub result: &'a ExecutionResult,
    pub success_criteria: Option<&'a str>,
    pub model: &'a str,
    pub temperature: f64,
}

/// Strategy deciding task completion.
#[async_trait]
pub trait CompletionEvaluator: Send + Sync {
    /// Returns `(is_complete, final_answer)`.
    async fn evaluate_completion(
        &self,
        request: EvaluationRequest<'_>,
        bus: &EventBus,
        attribution: &CallAttribution,
    ) -> (bool, String);
}

/// Default evaluator backed by an LLM judge.
pub struct DefaultCompletionEvaluator {
    client: Arc<dyn LlmClient>,
    templates: TemplateEngine,
}

impl DefaultCompletionEvaluator {
    pub fn new(client: Arc<dyn LlmClient>, templates: TemplateEngine) -> Self {
        Self { client, templates }
    }

    async fn judge(
        &self,
        request: &EvaluationRequest<'_>,
        final_answer: &str,
        bus: &EventBus,
        attribution: &CallAttribution,
    ) -> Option<String> {
        let mut context = Context::new();
        context.insert("task", request.task);
        context.insert("final_answer", final_answer);
        context.insert("task_status", "completed");
        context.insert("reason", "Task marked as completed by execution result");
        context.insert("history", request.formatted_history);
        let prompt = match self.templates.render(IS_TASK_COMPLETE, &context) {
            Ok(prompt) => prompt,
            Err(e) => {
                log::error!("Error rendering completion judge prompt: {e}");
                return None;
            }
        };

        let completion = CompletionRequest {
            model: request.model.to_string(),
            messages: vec![ChatMessage::new("user", prompt)],
            temperature: request.temperature,
            max_tokens: Some(JUDGE_MAX_TOKENS),
        };
        match llm_completion(self.client.as_ref(), &completion, false, bus, attribution).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                log::error!("Error checking task completion: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl CompletionEvaluator for DefaultCompletionEvaluator {
    async fn evaluate_completion(
        &self,
        request: EvaluationRequest<'_>,
        bus: &EventBus,
        attribution: &CallAttribution,
    ) -> (bool, String) {
        if !request.result.is_success() {
            log::info!(
                "Task not complete due to execution error: {:?}",
                request.result.error
            );
            return (false, String::new());
        }

        let final_answer = request.result.result.clone().unwrap_or_default();

        if request.result.task_status.as_deref() == Some("completed") {
            let Some(verdict) = self.judge(&request, &final_answer, bus, attribution).await
            else {
                return (false, String::new());
            };
            let verdict = verdict
                .trim()
                .to_lowercase()
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                .to_string();
            return match verdict.as_str() {
                "yes" => {
                    log::info!("Task verified as complete: {final_answer}");
                    (true, final_answer)
                }
                "not_solvable" => {
                    log::info!("Task deemed unsolvable: {final_answer}");
                    (true, format!("Task is unsolvable: {final_answer}"))
                }
                "no" => (false, String::new()),
                other => {
                    log::warn!("Unexpected judge response: '{other}', treating as 'no'");
                    (false, String::new())
                }
            };
        }

        if let Some(criteria) = request.success_criteria {
            if !final_answer.is_empty() && final_answer.contains(criteria) {
                log::info!("Task completed based on success criteria: {criteria}");
                return (true, final_answer);
            }
        }

        (false, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::collections::BTreeMap;

    struct FixedJudge(&'static str);

    #[async_trait]
    impl LlmClient for FixedJudge {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    fn attribution() -> CallAttribution {
        CallAttribution {
            agent_id: "a".into(),
            agent_name: "n".into(),
            step: None,
            task_id: None,
        }
    }

    fn completed_result(answer: &str) -> ExecutionResult {
        ExecutionResult::success("completed", answer, None, 0.1, BTreeMap::new())
    }

    async fn evaluate(
        judge: &'static str,
        result: &ExecutionResult,
        success_criteria: Option<&str>,
    ) -> (bool, String) {
        let evaluator =
            DefaultCompletionEvaluator::new(Arc::new(FixedJudge(judge)), TemplateEngine::new());
        let bus = EventBus::new();
        evaluator
            .evaluate_completion(
                EvaluationRequest {
                    task: "add numbers",
                    formatted_history: "No previous steps",
                    result,
                    success_criteria,
                    model: "test-model",
                    temperature: 0.3,
                },
                &bus,
                &attribution(),
            )
            .await
    }

    #[tokio::test]
    async fn test_error_result_is_never_complete() {
        let result = ExecutionResult::error("boom", 0.1);
        assert_eq!(evaluate("yes", &result, None).await, (false, String::new()));
    }

    #[tokio::test]
    async fn test_judge_yes_completes() {
        let result = completed_result("42");
        assert_eq!(evaluate("yes", &result, None).await, (true, "42".to_string()));
    }

    #[tokio::test]
    async fn test_judge_not_solvable() {
        let result = completed_result("impossible");
        let (complete, answer) = evaluate("not_solvable", &result, None).await;
        assert!(complete);
        assert_eq!(answer, "Task is unsolvable: impossible");
    }

    #[tokio::test]
    async fn test_judge_no_keeps_going() {
        let result = completed_result("nope");
        assert_eq!(evaluate("no", &result, None).await, (false, String::new()));
    }

    #[tokio::test]
    async fn test_unexpected_verdict_treated_as_no() {
        let result = completed_result("maybe");
        assert_eq!(evaluate("perhaps", &result, None).await, (false, String::new()));
    }

    #[tokio::test]
    async fn test_success_criteria_substring() {
        let result = ExecutionResult::success("inprogress", "the answer is 42", None, 0.1, BTreeMap::new());
        let (complete, answer) = evaluate("no", &result, Some("42")).await;
        assert!(complete);
        assert_eq!(answer, "the answer is 42");
    }

    #[tokio::test]
    async fn test_no_criteria_inprogress_not_complete() {
        let result =
            ExecutionResult::success("inprogress", "thinking", None, 0.1, BTreeMap::new());
        assert_eq!(evaluate("yes", &result, None).await, (false, String::new()));
    }
}
