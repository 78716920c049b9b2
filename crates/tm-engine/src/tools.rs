//! Tool handler contract and the registry mapping tools to handlers.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tm_core::config::ToolsConfig;
use tm_core::{Result, ToolId, ToolOptions};

use crate::command::CommandTool;

/// Synchronous progress callback handed to a handler.
///
/// Values are percentages of the current file, 0 to 100. Implementations
/// must not block for long: they run inline on the worker executing the
/// job.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8);
}

/// A sink that discards every report.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _percent: u8) {}
}

impl<F> ProgressSink for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        self(percent)
    }
}

/// One input file as handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolInput {
    pub name: String,
    pub data: Bytes,
}

/// The buffer a handler produced for one input.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub name: String,
    pub data: Bytes,
}

impl ToolOutput {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Capability that transforms one file.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Human-readable handler name, for logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        input: &ToolInput,
        options: &ToolOptions,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput>;
}

/// Dispatch table from tool id to handler.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<ToolId, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command-backed handlers from configuration, skipping entries
    /// that do not name a catalog tool.
    pub fn from_config(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        for (name, spec) in &config.commands {
            match name.parse::<ToolId>() {
                Ok(tool) => {
                    registry.register(tool, Arc::new(CommandTool::new(tool, spec.clone())));
                }
                Err(_) => {
                    tracing::warn!(tool = %name, "Ignoring command for unknown tool");
                }
            }
        }
        registry
    }

    /// Register (or replace) the handler for `tool`.
    pub fn register(&mut self, tool: ToolId, handler: Arc<dyn ToolHandler>) -> &mut Self {
        if self.handlers.insert(tool, handler).is_some() {
            tracing::debug!(tool = %tool, "Replaced tool handler");
        }
        self
    }

    pub fn get(&self, tool: ToolId) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(&tool).cloned()
    }

    pub fn contains(&self, tool: ToolId) -> bool {
        self.handlers.contains_key(&tool)
    }

    /// Registered tools in catalog order.
    pub fn tools(&self) -> Vec<ToolId> {
        let mut tools: Vec<_> = self.handlers.keys().copied().collect();
        tools.sort();
        tools
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools())
            .finish()
    }
}
