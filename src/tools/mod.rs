//! Tool abstractions: the boundary between the core and every capability
//! exposed to the sandbox.
//!
//! A [`Tool`] is a named, argument-typed async callable grouped into a
//! toolbox. The reasoner renders tools into prompt docstrings; the
//! executor binds them into the sandbox namespace as
//! `<toolbox>.<name>(...)` callables.

pub mod math_tools;
pub mod registry;
pub mod retrieve_message;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use registry::{ConfiguredTool, ToolRegistry};
pub use retrieve_message::RetrieveMessageTool;

/// Keyword arguments passed to a tool, matching its declared argument names.
pub type ToolKwargs = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// ToolArgument
// ---------------------------------------------------------------------------

/// Declaration of a single tool argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolArgument {
    /// Argument name; kwargs are matched against it.
    pub name: String,
    /// Semantic type string: "string", "int", "float", "bool", "list", ...
    pub arg_type: String,
    /// Human-readable description rendered into the prompt.
    pub description: String,
    /// Whether the argument must be provided.
    pub required: bool,
    /// Default value shown in the docstring.
    #[serde(default)]
    pub default: Option<String>,
    /// Example value shown in the docstring.
    #[serde(default)]
    pub example: Option<String>,
}

impl ToolArgument {
    /// Create a required argument.
    pub fn required(
        name: impl Into<String>,
        arg_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            arg_type: arg_type.into(),
            description: description.into(),
            required: true,
            default: None,
            example: None,
        }
    }

    /// Create an optional argument with a default.
    pub fn optional(
        name: impl Into<String>,
        arg_type: impl Into<String>,
        description: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            arg_type: arg_type.into(),
            description: description.into(),
            required: false,
            default: Some(default.into()),
            example: None,
        }
    }

    /// Attach an example value.
    pub fn with_example(mut self, example: impl Into<String>) -> Self {
        self.example = Some(example.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A capability exposed to the sandbox.
///
/// Within a toolbox, tool names are unique; `(toolbox, name)` is globally
/// unique across the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within the toolbox.
    fn name(&self) -> &str;

    /// Toolbox grouping; becomes a top-level name in the sandbox.
    fn toolbox_name(&self) -> &str {
        "default"
    }

    /// What the tool does, rendered into the prompt.
    fn description(&self) -> &str;

    /// Ordered argument declarations.
    fn arguments(&self) -> &[ToolArgument];

    /// Semantic return type shown in the docstring.
    fn return_type(&self) -> &str {
        "string"
    }

    /// Whether user confirmation is required before each call.
    fn requires_confirmation(&self) -> bool {
        false
    }

    /// The confirmation prompt shown to the user.
    fn confirmation_message(&self) -> String {
        format!("Allow tool '{}' to execute?", self.name())
    }

    /// Execute the tool with keyword arguments.
    async fn async_execute(&self, kwargs: ToolKwargs) -> anyhow::Result<Value>;

    /// Render the tool as a prompt docstring: name, description, each
    /// argument with type/default/example, and the return type.
    fn to_docstring(&self) -> String {
        let mut doc = String::new();
        let _ = writeln!(doc, "{}.{}:", self.toolbox_name(), self.name());
        let _ = writeln!(doc, "  {}", self.description().trim());
        if self.arguments().is_empty() {
            let _ = writeln!(doc, "  Arguments: none");
        } else {
            let _ = writeln!(doc, "  Arguments:");
            for arg in self.arguments() {
                let mut line = format!(
                    "    - {} ({}, {})",
                    arg.name,
                    arg.arg_type,
                    if arg.required { "required" } else { "optional" }
                );
                if let Some(default) = &arg.default {
                    let _ = write!(line, " [default: {default}]");
                }
                let _ = write!(line, ": {}", arg.description);
                if let Some(example) = &arg.example {
                    let _ = write!(line, " (e.g. {example})");
                }
                let _ = writeln!(doc, "{line}");
            }
        }
        let _ = write!(doc, "  Returns: {}", self.return_type());
        doc
    }
}

// ---------------------------------------------------------------------------
// Kwarg extraction helpers
// ---------------------------------------------------------------------------

/// Fetch a required string argument.
pub fn kwarg_str(kwargs: &ToolKwargs, name: &str) -> anyhow::Result<String> {
    match kwargs.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => anyhow::bail!("missing required argument '{name}'"),
    }
}

/// Fetch a required numeric argument as f64.
pub fn kwarg_f64(kwargs: &ToolKwargs, name: &str) -> anyhow::Result<f64> {
    match kwargs.get(name) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("argument '{name}' is not a finite number")),
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|_| anyhow::anyhow!("argument '{name}' is not numeric: {s}")),
        Some(other) => anyhow::bail!("argument '{name}' is not numeric: {other}"),
        None => anyhow::bail!("missing required argument '{name}'"),
    }
}

/// Fetch a required integer argument.
pub fn kwarg_i64(kwargs: &ToolKwargs, name: &str) -> anyhow::Result<i64> {
    match kwargs.get(name) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("argument '{name}' is not an integer")),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("argument '{name}' is not an integer: {s}")),
        Some(other) => anyhow::bail!("argument '{name}' is not an integer: {other}"),
        None => anyhow::bail!("missing required argument '{name}'"),
    }
}

// ---------------------------------------------------------------------------
// FunctionTool
// ---------------------------------------------------------------------------

type ToolFn =
    Arc<dyn Fn(ToolKwargs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A [`Tool`] built from an async closure; the bread-and-butter way to
/// declare small tools.
pub struct FunctionTool {
    name: String,
    toolbox_name: String,
    description: String,
    arguments: Vec<ToolArgument>,
    return_type: String,
    requires_confirmation: bool,
    confirmation_message: Option<String>,
    func: ToolFn,
}

impl FunctionTool {
    /// Start building a tool around `func`.
    pub fn builder<F, Fut>(name: impl Into<String>, func: F) -> FunctionToolBuilder
    where
        F: Fn(ToolKwargs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        FunctionToolBuilder {
            tool: FunctionTool {
                name: name.into(),
                toolbox_name: "default".to_string(),
                description: String::new(),
                arguments: Vec::new(),
                return_type: "string".to_string(),
                requires_confirmation: false,
                confirmation_message: None,
                func: Arc::new(move |kwargs| Box::pin(func(kwargs))),
            },
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn toolbox_name(&self) -> &str {
        &self.toolbox_name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn arguments(&self) -> &[ToolArgument] {
        &self.arguments
    }
    fn return_type(&self) -> &str {
        &self.return_type
    }
    fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }
    fn confirmation_message(&self) -> String {
        self.confirmation_message
            .clone()
            .unwrap_or_else(|| format!("Allow tool '{}' to execute?", self.name))
    }
    async fn async_execute(&self, kwargs: ToolKwargs) -> anyhow::Result<Value> {
        (self.func)(kwargs).await
    }
}

/// Builder for [`FunctionTool`].
pub struct FunctionToolBuilder {
    tool: FunctionTool,
}

impl FunctionToolBuilder {
    pub fn toolbox(mut self, toolbox: impl Into<String>) -> Self {
        self.tool.toolbox_name = toolbox.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.tool.description = description.into();
        self
    }

    pub fn argument(mut self, argument: ToolArgument) -> Self {
        self.tool.arguments.push(argument);
        self
    }

    pub fn return_type(mut self, return_type: impl Into<String>) -> Self {
        self.tool.return_type = return_type.into();
        self
    }

    pub fn requires_confirmation(mut self, required: bool) -> Self {
        self.tool.requires_confirmation = required;
        self
    }

    pub fn confirmation_message(mut self, message: impl Into<String>) -> Self {
        self.tool.confirmation_message = Some(message.into());
        self
    }

    pub fn build(self) -> Arc<dyn Tool> {
        Arc::new(self.tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn multiply_tool() -> Arc<dyn Tool> {
        FunctionTool::builder("multiply", |kwargs: ToolKwargs| async move {
            let x = kwarg_i64(&kwargs, "x")?;
            let y = kwarg_i64(&kwargs, "y")?;
            Ok(json!(x * y))
        })
        .toolbox("math")
        .description("Multiply two integers.")
        .argument(ToolArgument::required("x", "int", "First factor"))
        .argument(ToolArgument::required("y", "int", "Second factor"))
        .return_type("int")
        .build()
    }

    #[test]
    fn test_function_tool_executes_with_kwargs() {
        let tool = multiply_tool();
        let mut kwargs = ToolKwargs::new();
        kwargs.insert("x".into(), json!(6));
        kwargs.insert("y".into(), json!(7));
        let result = tokio_test::block_on(tool.async_execute(kwargs)).unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_missing_argument_is_an_error() {
        let tool = multiply_tool();
        let err = tool.async_execute(ToolKwargs::new()).await.unwrap_err();
        assert!(err.to_string().contains("missing required argument"));
    }

    #[test]
    fn test_docstring_lists_every_argument() {
        let doc = multiply_tool().to_docstring();
        assert!(doc.starts_with("math.multiply:"));
        assert!(doc.contains("- x (int, required): First factor"));
        assert!(doc.contains("- y (int, required): Second factor"));
        assert!(doc.contains("Returns: int"));
    }

    #[test]
    fn test_docstring_renders_defaults_and_examples() {
        let tool = FunctionTool::builder("greet", |_| async { Ok(json!("hi")) })
            .description("Greets someone.")
            .argument(
                ToolArgument::optional("name", "string", "Who to greet", "world")
                    .with_example("Alice"),
            )
            .build();
        let doc = tool.to_docstring();
        assert!(doc.contains("[default: world]"));
        assert!(doc.contains("(e.g. Alice)"));
    }
}
