//! Prompt templating.
//!
//! All prompts are data-driven Tera templates (Jinja-compatible syntax).
//! The defaults are compiled into the binary; a caller-supplied template
//! directory can override any of them by file name.

use std::path::Path;

use once_cell::sync::Lazy;
use tera::{Context, Tera};

use crate::errors::AgentError;

/// Prompt that asks the model for the next action program.
pub const ACTION_PROGRAM: &str = "action_program.j2";
/// Envelope wrapping cleaned code into an `<Action>` document.
pub const RESPONSE_FORMAT: &str = "response_format.j2";
/// LLM-judge prompt for completion verification.
pub const IS_TASK_COMPLETE: &str = "is_task_complete.j2";
/// Rendering of a single working-memory step.
pub const STEP: &str = "step.j2";
/// Default system prompt built from agent name and personality.
pub const SYSTEM_PROMPT: &str = "system_prompt.j2";

const EMBEDDED: &[(&str, &str)] = &[
    (ACTION_PROGRAM, include_str!("prompts/action_program.j2")),
    (RESPONSE_FORMAT, include_str!("prompts/response_format.j2")),
    (IS_TASK_COMPLETE, include_str!("prompts/is_task_complete.j2")),
    (STEP, include_str!("prompts/step.j2")),
    (SYSTEM_PROMPT, include_str!("prompts/system_prompt.j2")),
];

static DEFAULT_TERA: Lazy<Tera> = Lazy::new(|| {
    let mut tera = Tera::default();
    tera.add_raw_templates(EMBEDDED.to_vec())
        .expect("embedded templates must parse");
    tera
});

/// Template engine handed to the reasoner, evaluator, and memory.
#[derive(Clone)]
pub struct TemplateEngine {
    tera: Tera,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self {
            tera: DEFAULT_TERA.clone(),
        }
    }
}

impl TemplateEngine {
    /// Engine with the embedded default templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that loads `*.j2` files from `dir`, overriding embedded
    /// templates with the same file name.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let pattern = format!("{}/*.j2", dir.as_ref().display());
        let mut tera = Tera::new(&pattern)?;
        // `extend` only adds names the custom set lacks, so directory
        // templates shadow the embedded defaults.
        tera.extend(&DEFAULT_TERA)?;
        Ok(Self { tera })
    }

    /// Render a template by name.
    pub fn render(&self, name: &str, context: &Context) -> Result<String, AgentError> {
        Ok(self.tera.render(name, context)?)
    }

    /// Whether a template with this name is registered.
    pub fn has_template(&self, name: &str) -> bool {
        self.tera.get_template_names().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_default_templates_registered() {
        let engine = TemplateEngine::new();
        for (name, _) in EMBEDDED {
            assert!(engine.has_template(name), "missing template {name}");
        }
    }

    #[test]
    fn test_system_prompt_renders_name_and_personality() {
        let engine = TemplateEngine::new();
        let mut context = Context::new();
        context.insert("name", "agent_12345678");
        context.insert("personality", "terse and precise");
        let prompt = engine.render(SYSTEM_PROMPT, &context).unwrap();
        assert!(prompt.contains("agent_12345678"));
        assert!(prompt.contains("terse and precise"));
    }

    #[test]
    fn test_custom_dir_overrides_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("system_prompt.j2"),
            "OVERRIDDEN {{ name }}",
        )
        .unwrap();
        let engine = TemplateEngine::with_dir(dir.path()).unwrap();
        let mut context = Context::new();
        context.insert("name", "x");
        context.insert("personality", "");
        let prompt = engine.render(SYSTEM_PROMPT, &context).unwrap();
        assert_eq!(prompt, "OVERRIDDEN x");
    }
}
