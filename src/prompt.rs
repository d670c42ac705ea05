//! Prompt assembly
//!
//! Builds the system prompt (identity, role, instructions, phase guidance)
//! and converts an assembled thread into model-visible messages. Tool
//! descriptions travel separately in the request's tool definitions.

use std::collections::HashMap;

use crate::agents::AgentDefinition;
use crate::conversation::{Phase, ThreadMessage, ThreadRole};
use crate::llm::ChatMessage;

/// The system prompt for one agent turn.
pub fn system_prompt(agent: &AgentDefinition, project_title: &str, phase: Phase) -> String {
    let mut sections = vec![
        format!(
            "You are {name} (@{slug}), an agent in the {project} project.",
            name = agent.name,
            slug = agent.slug,
            project = project_title,
        ),
        format!("Role: {}", agent.role),
    ];
    if !agent.instructions.is_empty() {
        sections.push(agent.instructions.clone());
    }
    sections.push(format!(
        "The conversation is in the {phase} phase. {}",
        phase_guidance(phase)
    ));
    sections.join("\n\n")
}

fn phase_guidance(phase: Phase) -> &'static str {
    match phase {
        Phase::Chat => "Answer conversationally; no work has been committed to yet.",
        Phase::Brainstorm => {
            "Generate and weigh options. Breadth over depth; do not start implementing."
        }
        Phase::Plan => "Produce a concrete, ordered plan. Implementation has not started.",
        Phase::Execute => "Carry out the agreed plan. Report blockers instead of replanning.",
        Phase::Verification => {
            "Check the completed work against what was asked. Report findings precisely."
        }
        Phase::Chores => "Handle cleanup and follow-through tasks left over from execution.",
        Phase::Reflection => {
            "Summarize what happened and what should be learned for next time."
        }
    }
}

/// Convert a thread into chat messages.
///
/// Messages from others become user messages prefixed with authorship so
/// the model can tell participants apart; the viewer's own messages become
/// assistant messages. `notices` (delegation orphans and the like) are
/// appended as system-authored user messages.
pub fn thread_messages(
    thread: &[ThreadMessage],
    labels: &HashMap<String, String>,
    notices: &[String],
) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = thread
        .iter()
        .map(|msg| match msg.role {
            ThreadRole::Assistant => ChatMessage::assistant(msg.content.clone()),
            ThreadRole::User => ChatMessage::user(format!(
                "{}: {}",
                author_label(msg.author.as_deref(), labels),
                msg.content
            )),
            ThreadRole::System => ChatMessage::user(format!("[system] {}", msg.content)),
        })
        .collect();

    for notice in notices {
        messages.push(ChatMessage::user(format!("[system] {notice}")));
    }
    messages
}

fn author_label(author: Option<&str>, labels: &HashMap<String, String>) -> String {
    match author {
        Some(hex) => labels
            .get(hex)
            .map_or_else(|| hex.chars().take(8).collect(), |slug| format!("@{slug}")),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> AgentDefinition {
        AgentDefinition {
            pubkey: "ab".repeat(32),
            slug: "planner".to_string(),
            name: "Planner".to_string(),
            role: "breaks work into steps".to_string(),
            instructions: "Prefer small steps.".to_string(),
            tools: vec![],
            model: None,
            is_pm: false,
            secret_key: String::new(),
        }
    }

    #[test]
    fn system_prompt_carries_identity_and_phase() {
        let prompt = system_prompt(&definition(), "acme", Phase::Plan);
        assert!(prompt.contains("Planner (@planner)"));
        assert!(prompt.contains("acme"));
        assert!(prompt.contains("breaks work into steps"));
        assert!(prompt.contains("Prefer small steps."));
        assert!(prompt.contains("PLAN phase"));
    }

    #[test]
    fn thread_roles_map_to_chat_roles() {
        let author = "cd".repeat(32);
        let labels: HashMap<String, String> =
            [(author.clone(), "pm".to_string())].into_iter().collect();
        let thread = vec![
            ThreadMessage {
                role: ThreadRole::User,
                author: Some(author),
                event_id: None,
                content: "hello".to_string(),
            },
            ThreadMessage {
                role: ThreadRole::Assistant,
                author: None,
                event_id: None,
                content: "hi".to_string(),
            },
        ];

        let messages = thread_messages(&thread, &labels, &["orphan notice".to_string()]);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, crate::llm::MessageRole::User);
        assert_eq!(messages[1].role, crate::llm::MessageRole::Assistant);
        match &messages[0].content[0] {
            crate::llm::ContentBlock::Text { text } => {
                assert!(text.starts_with("@pm: "));
            }
            other => panic!("unexpected block {other:?}"),
        }
        match &messages[2].content[0] {
            crate::llm::ContentBlock::Text { text } => {
                assert!(text.contains("orphan notice"));
            }
            other => panic!("unexpected block {other:?}"),
        }
    }
}
