//! Tool registry: the single source of truth for tool identity.
//!
//! Keyed by `(toolbox, name)`. Registration is idempotent; the first
//! registration wins. The executor reads the registry once per task to
//! build its sandbox namespace.

use std::sync::Arc;

use dashmap::DashMap;

use super::{Tool, ToolArgument, ToolKwargs};
use crate::config::ToolOverride;

/// Wrapper applying per-tool configuration overrides (confirmation
/// settings) without touching the wrapped implementation.
pub struct ConfiguredTool {
    inner: Arc<dyn Tool>,
    toolbox_name: Option<String>,
    requires_confirmation: Option<bool>,
    confirmation_message: Option<String>,
}

impl ConfiguredTool {
    /// Wrap a tool with an override.
    pub fn with_override(inner: Arc<dyn Tool>, config: &ToolOverride) -> Arc<dyn Tool> {
        Arc::new(Self {
            inner,
            toolbox_name: None,
            requires_confirmation: config.requires_confirmation,
            confirmation_message: config.confirmation_message.clone(),
        })
    }

    /// Wrap a tool, rebinding it into another toolbox.
    pub fn in_toolbox(inner: Arc<dyn Tool>, toolbox_name: impl Into<String>) -> Arc<dyn Tool> {
        Arc::new(Self {
            inner,
            toolbox_name: Some(toolbox_name.into()),
            requires_confirmation: None,
            confirmation_message: None,
        })
    }
}

#[async_trait::async_trait]
impl Tool for ConfiguredTool {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn toolbox_name(&self) -> &str {
        self.toolbox_name
            .as_deref()
            .unwrap_or_else(|| self.inner.toolbox_name())
    }
    fn description(&self) -> &str {
        self.inner.description()
    }
    fn arguments(&self) -> &[ToolArgument] {
        self.inner.arguments()
    }
    fn return_type(&self) -> &str {
        self.inner.return_type()
    }
    fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
            .unwrap_or_else(|| self.inner.requires_confirmation())
    }
    fn confirmation_message(&self) -> String {
        self.confirmation_message
            .clone()
            .unwrap_or_else(|| self.inner.confirmation_message())
    }
    async fn async_execute(&self, kwargs: ToolKwargs) -> anyhow::Result<serde_json::Value> {
        self.inner.async_execute(kwargs).await
    }
}

/// Mapping `(toolbox, tool_name)` → tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<(String, String), Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Idempotent: an existing `(toolbox, name)` entry
    /// is kept and the duplicate is dropped with a debug log.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let key = (
            tool.toolbox_name().to_string(),
            tool.name().to_string(),
        );
        if self.tools.contains_key(&key) {
            log::debug!(
                "Tool '{}' in toolbox '{}' already registered",
                key.1,
                key.0
            );
            return;
        }
        log::debug!("Tool registered: {} in toolbox {}", key.1, key.0);
        self.tools.insert(key, tool);
    }

    /// Register a batch of tools under a toolbox name, rebinding each
    /// tool's toolbox. The Rust rendition of module-based registration.
    pub fn register_module(
        &self,
        tools: impl IntoIterator<Item = Arc<dyn Tool>>,
        toolbox_name: &str,
    ) {
        for tool in tools {
            self.register(ConfiguredTool::in_toolbox(tool, toolbox_name));
        }
    }

    /// All registered tools, ordered by `(toolbox, name)` for stable
    /// prompt rendering.
    pub fn get_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut entries: Vec<_> = self
            .tools
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, tool)| tool).collect()
    }

    /// Look up one tool.
    pub fn get(&self, toolbox: &str, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(&(toolbox.to_string(), name.to_string()))
            .map(|e| Arc::clone(e.value()))
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Apply configuration overrides, replacing matching entries.
    pub fn apply_overrides(&self, overrides: &[ToolOverride]) {
        for config in overrides {
            let key = (config.toolbox.clone(), config.name.clone());
            if let Some(entry) = self.tools.get(&key).map(|e| Arc::clone(e.value())) {
                self.tools
                    .insert(key, ConfiguredTool::with_override(entry, config));
            } else {
                log::warn!(
                    "Tool override for unknown tool {}.{} ignored",
                    config.toolbox,
                    config.name
                );
            }
        }
    }
}
