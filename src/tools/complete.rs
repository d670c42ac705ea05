//! Turn completion tool

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolOutput};

/// Finalize the current turn with a summary. The summary becomes the reply
/// event; the executor loop halts.
pub struct CompleteTool;

#[derive(Debug, Deserialize)]
struct CompleteInput {
    summary: String,
}

#[async_trait]
impl Tool for CompleteTool {
    fn name(&self) -> &'static str {
        "complete"
    }

    fn description(&self) -> String {
        "Finish your turn. Provide a concise summary of what you did or concluded; \
         it is published as your reply and your turn ends."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["summary"],
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "Final reply content for this turn"
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        match serde_json::from_value::<CompleteInput>(input) {
            Ok(input) => ToolOutput::stop(input.summary),
            Err(e) => ToolOutput::error(format!("Invalid input: {e}")),
        }
    }
}
