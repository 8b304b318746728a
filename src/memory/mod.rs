//! Working memory: the per-task bounded log of steps used to assemble
//! the next prompt.
//!
//! Steps are densely numbered from 1 and never mutated after append.
//! `clear()` resets the log for a new task but keeps the persistent
//! system prompt and task description.

use serde::{Deserialize, Serialize};
use tera::Context;

use crate::executor::ExecutionResult;
use crate::templates::{TemplateEngine, STEP};

/// One pass through the ReAct loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_number: usize,
    pub thought: String,
    /// The action program text.
    pub action: String,
    pub result: ExecutionResult,
}

/// Bounded store of steps with persistent context.
pub struct WorkingMemory {
    /// Soft token budget for rendered history.
    pub max_tokens: usize,
    pub system_prompt: String,
    pub task_description: String,
    store: Vec<Step>,
    templates: TemplateEngine,
}

impl WorkingMemory {
    pub fn new(
        max_tokens: usize,
        system_prompt: impl Into<String>,
        task_description: impl Into<String>,
        templates: TemplateEngine,
    ) -> Self {
        Self {
            max_tokens,
            system_prompt: system_prompt.into(),
            task_description: task_description.into(),
            store: Vec::new(),
            templates,
        }
    }

    /// The recorded steps, oldest first.
    pub fn store(&self) -> &[Step] {
        &self.store
    }

    /// Mutable view used by the core to write the judged final answer
    /// back into the last step.
    pub(crate) fn store_mut(&mut self) -> &mut Vec<Step> {
        &mut self.store
    }

    /// Append a step.
    pub fn add(&mut self, step: Step) {
        log::debug!("Added step {} to working memory", step.step_number);
        self.store.push(step);
    }

    /// Reset the step log for a new task.
    pub fn clear(&mut self) {
        self.store.clear();
        log::debug!("Cleared task history");
    }

    /// Render the history through the step template, truncating from the
    /// oldest step until the token budget is met.
    pub fn format_history(&self, max_iterations: usize) -> String {
        let mut included: Vec<String> = Vec::new();
        let mut total_tokens = 0usize;
        for step in self.store.iter().rev() {
            let rendered = match self.render_step(step, max_iterations) {
                Ok(rendered) => rendered,
                Err(e) => {
                    log::error!("Error formatting step {}: {e}", step.step_number);
                    continue;
                }
            };
            let step_tokens = rendered.split_whitespace().count();
            if total_tokens + step_tokens > self.max_tokens {
                break;
            }
            total_tokens += step_tokens;
            included.push(rendered);
        }
        if included.is_empty() {
            "No previous steps".to_string()
        } else {
            included.reverse();
            included.join("\n")
        }
    }

    fn render_step(
        &self,
        step: &Step,
        max_iterations: usize,
    ) -> Result<String, crate::errors::AgentError> {
        let mut context = Context::new();
        context.insert("step", step);
        context.insert("max_iterations", &max_iterations);
        context.insert("result_summary", &step.result.to_summary());
        self.templates.render(STEP, &context)
    }

    /// System prompt, task description, and formatted history joined with
    /// blank lines; empty sections are skipped.
    pub fn get_full_context(&self, max_iterations: usize) -> String {
        let mut parts = Vec::new();
        if !self.system_prompt.is_empty() {
            parts.push(format!("System Prompt:\n{}", self.system_prompt));
        }
        if !self.task_description.is_empty() {
            parts.push(format!("Task Description:\n{}", self.task_description));
        }
        let history = self.format_history(max_iterations);
        if history != "No previous steps" {
            parts.push(format!("History:\n{history}"));
        }
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn memory() -> WorkingMemory {
        WorkingMemory::new(4096, "be helpful", "compute things", TemplateEngine::new())
    }

    fn step(n: usize) -> Step {
        Step {
            step_number: n,
            thought: format!("thought {n}"),
            action: format!("action {n}"),
            result: ExecutionResult::success(
                "inprogress",
                format!("result {n}"),
                None,
                0.1,
                BTreeMap::new(),
            ),
        }
    }

    #[test]
    fn test_empty_history_placeholder() {
        assert_eq!(memory().format_history(5), "No previous steps");
    }

    #[test]
    fn test_steps_render_oldest_first() {
        let mut memory = memory();
        memory.add(step(1));
        memory.add(step(2));
        let history = memory.format_history(5);
        let first = history.find("thought 1").unwrap();
        let second = history.find("thought 2").unwrap();
        assert!(first < second);
        assert!(history.contains("Step 1 of 5"));
    }

    #[test]
    fn test_token_budget_drops_oldest() {
        let mut memory = WorkingMemory::new(40, "", "", TemplateEngine::new());
        for n in 1..=6 {
            memory.add(step(n));
        }
        let history = memory.format_history(6);
        // The newest step always fits; the oldest ones fall off.
        assert!(history.contains("thought 6"));
        assert!(!history.contains("thought 1"));
    }

    #[test]
    fn test_clear_preserves_context() {
        let mut memory = memory();
        memory.add(step(1));
        memory.clear();
        assert!(memory.store().is_empty());
        assert_eq!(memory.system_prompt, "be helpful");
        assert_eq!(memory.task_description, "compute things");
    }

    #[test]
    fn test_full_context_skips_empty_sections() {
        let memory = WorkingMemory::new(4096, "", "task only", TemplateEngine::new());
        let context = memory.get_full_context(5);
        assert!(!context.contains("System Prompt:"));
        assert!(context.starts_with("Task Description:"));
        assert!(!context.contains("History:"));
    }
}
