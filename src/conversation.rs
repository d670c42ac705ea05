//! Conversation state
//!
//! A conversation is a tree of events rooted at the first event with no
//! reply link. The coordinator owns every tree in one project, derives the
//! message sequence an agent sees when it wakes, and records phase
//! transitions so they are observable from the event log alone.

pub mod thread;
pub mod tree;

pub use thread::{ThreadMessage, ThreadOptions, ThreadRole};
pub use tree::{Conversation, ConversationCoordinator};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The mode of work a conversation is in. Transitions are explicit (PM
/// tool calls) and observable (tagged on the next outbound reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    #[default]
    Chat,
    Brainstorm,
    Plan,
    Execute,
    Verification,
    Chores,
    Reflection,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Chat,
        Phase::Brainstorm,
        Phase::Plan,
        Phase::Execute,
        Phase::Verification,
        Phase::Chores,
        Phase::Reflection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Chat => "CHAT",
            Phase::Brainstorm => "BRAINSTORM",
            Phase::Plan => "PLAN",
            Phase::Execute => "EXECUTE",
            Phase::Verification => "VERIFICATION",
            Phase::Chores => "CHORES",
            Phase::Reflection => "REFLECTION",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown phase {0:?}")]
pub struct UnknownPhase(pub String);
