//! Tag extraction and construction
//!
//! All tag access goes through raw slices (`tag.as_slice()`): the daemon
//! reads events produced by many clients, and positional access tolerates
//! the marker/relay-url variance NIP-10 allows in the wild.

use nostr::prelude::{
    Alphabet, Coordinate, Event, EventId, PublicKey, SingleLetterTag, Tag, TagKind,
};
use std::borrow::Cow;

use crate::conversation::Phase;

/// The direct parent this event replies to.
///
/// Preference order: `e` tag with a `reply` marker, then `e` with a `root`
/// marker (a direct reply to the root), then the last positional `e` tag.
pub fn reply_target(event: &Event) -> Option<EventId> {
    let mut root = None;
    let mut last_positional = None;
    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        if parts.first().map(String::as_str) != Some("e") {
            continue;
        }
        let Some(id) = parts.get(1).and_then(|v| EventId::parse(v).ok()) else {
            continue;
        };
        match parts.get(3).map(String::as_str) {
            Some("reply") => return Some(id),
            Some("root") => root = Some(id),
            _ => last_positional = Some(id),
        }
    }
    root.or(last_positional)
}

/// The conversation root this event belongs to, if tagged.
///
/// Uppercase `E` wins (explicit root reference), then the `root`-marked
/// lowercase `e`, then the first positional `e` tag.
pub fn root_target(event: &Event) -> Option<EventId> {
    let mut marked_root = None;
    let mut first_positional = None;
    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        let Some(id) = parts.get(1).and_then(|v| EventId::parse(v).ok()) else {
            continue;
        };
        match parts.first().map(String::as_str) {
            Some("E") => return Some(id),
            Some("e") => match parts.get(3).map(String::as_str) {
                Some("root") => marked_root = Some(id),
                _ => {
                    if first_positional.is_none() {
                        first_positional = Some(id);
                    }
                }
            },
            _ => {}
        }
    }
    marked_root.or(first_positional)
}

/// Whether this event carries any reply link at all.
pub fn is_reply(event: &Event) -> bool {
    event.tags.iter().any(|t| {
        matches!(
            t.as_slice().first().map(String::as_str),
            Some("e" | "E")
        )
    })
}

/// The project coordinate from the first `a` tag.
pub fn project_coordinate(event: &Event) -> Option<Coordinate> {
    event.tags.iter().find_map(|t| {
        let parts = t.as_slice();
        if parts.first().map(String::as_str) == Some("a") {
            parts.get(1).and_then(|v| Coordinate::parse(v).ok())
        } else {
            None
        }
    })
}

/// All `p`-tagged recipients.
pub fn recipients(event: &Event) -> Vec<PublicKey> {
    event
        .tags
        .iter()
        .filter_map(|t| {
            let parts = t.as_slice();
            if parts.first().map(String::as_str) == Some("p") {
                parts.get(1).and_then(|v| PublicKey::parse(v).ok())
            } else {
                None
            }
        })
        .collect()
}

/// Delegation correlation ids (`q` tags). Values are event ids in hex.
pub fn correlations(event: &Event) -> Vec<String> {
    event
        .tags
        .iter()
        .filter_map(|t| {
            let parts = t.as_slice();
            if parts.first().map(String::as_str) == Some("q") {
                parts.get(1).cloned()
            } else {
                None
            }
        })
        .collect()
}

/// The `phase` tag, parsed.
pub fn phase(event: &Event) -> Option<Phase> {
    custom_value(event, "phase").and_then(|v| v.parse().ok())
}

/// The addressable identifier (`d` tag).
pub fn identifier(event: &Event) -> Option<String> {
    custom_value(event, "d")
}

/// The `title` tag.
pub fn title(event: &Event) -> Option<String> {
    custom_value(event, "title")
}

/// Ordered agent references from a project definition: `["agent", <pubkey>]`
/// or `["agent", <pubkey>, <slug-override>]`.
pub fn agent_refs(event: &Event) -> Vec<(PublicKey, Option<String>)> {
    event
        .tags
        .iter()
        .filter_map(|t| {
            let parts = t.as_slice();
            if parts.first().map(String::as_str) != Some("agent") {
                return None;
            }
            let pubkey = parts.get(1).and_then(|v| PublicKey::parse(v).ok())?;
            Some((pubkey, parts.get(2).cloned()))
        })
        .collect()
}

fn custom_value(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|t| {
        let parts = t.as_slice();
        if parts.first().map(String::as_str) == Some(name) {
            parts.get(1).cloned()
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// `["e", <id>, "", "root"]`
pub fn e_root(id: EventId) -> Tag {
    Tag::custom(
        TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)),
        vec![id.to_hex(), String::new(), "root".to_string()],
    )
}

/// `["e", <id>, "", "reply"]`
pub fn e_reply(id: EventId) -> Tag {
    Tag::custom(
        TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)),
        vec![id.to_hex(), String::new(), "reply".to_string()],
    )
}

/// `["E", <id>]`: explicit conversation root.
pub fn e_root_upper(id: EventId) -> Tag {
    Tag::custom(
        TagKind::SingleLetter(SingleLetterTag::uppercase(Alphabet::E)),
        vec![id.to_hex()],
    )
}

/// `["q", <request event id>]`: delegation correlation.
pub fn q_correlation(id: EventId) -> Tag {
    Tag::custom(
        TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::Q)),
        vec![id.to_hex()],
    )
}

/// `["phase", <PHASE>]`
pub fn phase_tag(value: Phase) -> Tag {
    Tag::custom(
        TagKind::Custom(Cow::Borrowed("phase")),
        vec![value.to_string()],
    )
}

/// `["a", <kind>:<pubkey>:<d>]`
pub fn project_ref(coordinate: Coordinate) -> Tag {
    Tag::coordinate(coordinate, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::prelude::{EventBuilder, Keys, Kind};

    fn signed(tags: Vec<Tag>) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::from(1), "hi")
            .tags(tags)
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn reply_marker_beats_root_marker() {
        let root = EventId::all_zeros();
        let keys = Keys::generate();
        let parent = EventBuilder::new(Kind::from(1), "parent")
            .sign_with_keys(&keys)
            .unwrap();

        let event = signed(vec![e_root(root), e_reply(parent.id)]);
        assert_eq!(reply_target(&event), Some(parent.id));
        assert_eq!(root_target(&event), Some(root));
    }

    #[test]
    fn root_only_reply_points_at_root() {
        let root = EventId::all_zeros();
        let event = signed(vec![e_root(root)]);
        assert_eq!(reply_target(&event), Some(root));
        assert!(is_reply(&event));
    }

    #[test]
    fn no_reply_tags_means_root_event() {
        let event = signed(vec![]);
        assert_eq!(reply_target(&event), None);
        assert_eq!(root_target(&event), None);
        assert!(!is_reply(&event));
    }

    #[test]
    fn uppercase_root_wins() {
        let explicit = EventId::all_zeros();
        let keys = Keys::generate();
        let other = EventBuilder::new(Kind::from(1), "x")
            .sign_with_keys(&keys)
            .unwrap();
        let event = signed(vec![e_reply(other.id), e_root_upper(explicit)]);
        assert_eq!(root_target(&event), Some(explicit));
    }

    #[test]
    fn extracts_recipients_and_correlations() {
        let keys = Keys::generate();
        let target = EventBuilder::new(Kind::from(1), "x")
            .sign_with_keys(&keys)
            .unwrap();
        let event = signed(vec![
            Tag::public_key(keys.public_key()),
            q_correlation(target.id),
        ]);
        assert_eq!(recipients(&event), vec![keys.public_key()]);
        assert_eq!(correlations(&event), vec![target.id.to_hex()]);
    }

    #[test]
    fn phase_tag_round_trips() {
        let event = signed(vec![phase_tag(Phase::Execute)]);
        assert_eq!(phase(&event), Some(Phase::Execute));
    }
}
