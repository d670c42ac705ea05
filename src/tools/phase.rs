//! Phase transition tool

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::conversation::Phase;

use super::{Tool, ToolContext, ToolOutput};

/// Switch the conversation's phase. PM-only; the transition is recorded on
/// the conversation and tagged on the caller's next reply so observers can
/// reconstruct phase history from the event log.
pub struct SwitchPhaseTool;

#[derive(Debug, Deserialize)]
struct SwitchPhaseInput {
    phase: String,
    reason: String,
}

#[async_trait]
impl Tool for SwitchPhaseTool {
    fn name(&self) -> &'static str {
        "switch_phase"
    }

    fn description(&self) -> String {
        format!(
            "Move this conversation to a different phase of work. Valid phases: {}.",
            Phase::ALL.map(|p| p.as_str()).join(", ")
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["phase", "reason"],
            "properties": {
                "phase": {
                    "type": "string",
                    "enum": Phase::ALL.map(|p| p.as_str()),
                    "description": "Target phase"
                },
                "reason": {
                    "type": "string",
                    "description": "Why the conversation is moving"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: SwitchPhaseInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        if !ctx.project.is_pm(&ctx.agent) {
            return ToolOutput::error(
                "Phase transitions are reserved for the project manager",
            );
        }

        let phase: Phase = match input.phase.parse() {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e.to_string()),
        };

        match ctx
            .project
            .set_phase(&ctx.conversation_root, phase, &input.reason)
        {
            Ok(Some(previous)) => {
                tracing::info!(
                    conv = %ctx.conversation_root,
                    from = %previous,
                    to = %phase,
                    reason = %input.reason,
                    "phase transition"
                );
                ToolOutput::success(format!("Phase changed: {previous} -> {phase}"))
            }
            Ok(None) => ToolOutput::error("Unknown conversation"),
            Err(e) => ToolOutput::error(format!("Failed to record phase: {e}")),
        }
    }
}
