//! Engine tool surface
//!
//! Tools are stateless singletons; everything per-call arrives through
//! `ToolContext`. Only the control-flow tools the engine itself needs live
//! here (delegation, phase transitions, turn completion); tools that touch
//! the outside world plug into the same registry from elsewhere.

pub mod complete;
pub mod delegate;
pub mod phase;

pub use complete::CompleteTool;
pub use delegate::{
    DelegateExternalTool, DelegateFollowupTool, DelegatePhaseTool, DelegateTool,
};
pub use phase::SwitchPhaseTool;

use async_trait::async_trait;
use nostr::prelude::Event;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agents::ProjectAgent;
use crate::llm::ToolDefinition;
use crate::runtime::ProjectContext;

/// What the executor does after a tool returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolControl {
    /// Feed the result back to the model and keep streaming.
    Continue,
    /// Halt the turn; the output content is the final reply.
    Stop,
}

/// Result from tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub control: ToolControl,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            control: ToolControl::Continue,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            control: ToolControl::Continue,
        }
    }

    pub fn stop(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            control: ToolControl::Stop,
        }
    }
}

/// All context a tool invocation gets.
#[derive(Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    /// The agent whose turn is executing.
    pub agent: Arc<ProjectAgent>,
    /// Conversation root (hex).
    pub conversation_root: String,
    /// The event that woke this turn.
    pub trigger: Event,
    pub project: Arc<ProjectContext>,
}

/// Trait for tools invocable by an agent turn.
///
/// Input validation is typed deserialization against the declared schema; a
/// mismatch is a structured error output, never a panic.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> String;

    /// JSON schema for tool input.
    fn input_schema(&self) -> Value;

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Read-only after startup; shared by every agent in the project.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// The standard engine tool set.
    pub fn standard() -> Self {
        Self {
            tools: vec![
                Arc::new(DelegateTool),
                Arc::new(DelegateExternalTool),
                Arc::new(DelegateFollowupTool),
                Arc::new(DelegatePhaseTool),
                Arc::new(SwitchPhaseTool),
                Arc::new(CompleteTool),
            ],
        }
    }

    /// Register an additional tool (MCP bridges and the like).
    #[allow(dead_code)] // extension point for non-engine tools
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Definitions restricted to an agent's allow-list. An empty allow-list
    /// means the agent gets no tools, not all of them.
    pub fn definitions_for(&self, allow: &[String]) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| allow.iter().any(|a| a == t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute by name, enforcing the caller's allow-list.
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> ToolOutput {
        if !ctx.agent.definition.tools.iter().any(|a| a == name) {
            return ToolOutput::error(format!(
                "Tool {name:?} is not available to agent {:?}",
                ctx.agent.slug()
            ));
        }
        for tool in &self.tools {
            if tool.name() == name {
                return tool.run(input, ctx).await;
            }
        }
        ToolOutput::error(format!("Unknown tool: {name}"))
    }
}
