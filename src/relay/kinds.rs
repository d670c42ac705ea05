//! Event kind numbers
//!
//! Deployment constants. The daemon cares about the semantics; the numbers
//! match what the TENEX relay network uses today.

use nostr::prelude::Kind;

/// Conversation message (user-to-agent and agent-to-agent prose).
pub const MESSAGE: u16 = 1;
/// Conversation metadata: title and summary for a thread root.
pub const CONVERSATION_METADATA: u16 = 513;
/// Agent definition (addressable; `d` = agent slug).
pub const AGENT_DEFINITION: u16 = 4199;
/// Boot request: a client asking the daemon to warm a project runtime.
pub const BOOT_REQUEST: u16 = 24000;
/// Project status heartbeat (ephemeral).
pub const PROJECT_STATUS: u16 = 24010;
/// Project definition (addressable; `d` = project slug, ordered `agent` tags).
pub const PROJECT: u16 = 31933;
/// Streaming status: partial agent output while a turn is in flight
/// (ephemeral, rate-limited at the publisher).
pub const STREAMING_STATUS: u16 = 21111;

/// Kinds the router drops without logging: profile metadata, contact lists,
/// reposts, reactions, and agent lessons (consumed by clients, not by the
/// daemon).
pub const IGNORED_KINDS: &[u16] = &[0, 3, 6, 7, 4129];

pub fn is_ignored(kind: Kind) -> bool {
    IGNORED_KINDS.contains(&kind.as_u16())
}

pub fn message() -> Kind {
    Kind::from(MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactions_are_ignored() {
        assert!(is_ignored(Kind::from(7)));
        assert!(!is_ignored(Kind::from(MESSAGE)));
        assert!(!is_ignored(Kind::from(PROJECT)));
    }
}
