//! Thread assembly
//!
//! Derives the message sequence one agent sees when it wakes on an event:
//! the ancestor chain to the root, sibling subtrees the agent is addressed
//! in, and a pruning pass that collapses old history into a summary once
//! the thread outgrows its token budget.

use nostr::prelude::PublicKey;
use std::collections::HashSet;

use crate::relay::tags;

use super::tree::{Conversation, ConversationEvent};

/// Approximate tokens per character, the usual prose heuristic.
const CHARS_PER_TOKEN: usize = 4;
/// Fixed per-message overhead in the estimate (role + metadata).
const MESSAGE_OVERHEAD_TOKENS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct ThreadOptions {
    /// Pruning threshold in approximate tokens.
    pub max_tokens: usize,
    /// Most recent turns always kept verbatim.
    pub keep_recent: usize,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            max_tokens: 64_000,
            keep_recent: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// Authored by the viewer itself.
    Assistant,
    /// Authored by a human or any other agent.
    User,
    /// Synthesized (pruning summaries, delegation notices).
    System,
}

/// One message in an assembled thread.
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    pub role: ThreadRole,
    /// Author pubkey (hex); absent for synthesized messages.
    pub author: Option<String>,
    /// Source event id (hex); absent for synthesized messages.
    pub event_id: Option<String>,
    pub content: String,
}

impl ThreadMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ThreadRole::System,
            author: None,
            event_id: None,
            content: content.into(),
        }
    }

    fn from_event(ce: &ConversationEvent, viewer: &PublicKey) -> Self {
        let role = if ce.event.pubkey == *viewer {
            ThreadRole::Assistant
        } else {
            ThreadRole::User
        };
        Self {
            role,
            author: Some(ce.event.pubkey.to_hex()),
            event_id: Some(ce.event.id.to_hex()),
            content: ce.event.content.clone(),
        }
    }

    fn estimated_tokens(&self) -> usize {
        self.content.len() / CHARS_PER_TOKEN + MESSAGE_OVERHEAD_TOKENS
    }
}

/// Assemble the thread `viewer` sees when waking on `leaf_id`.
///
/// `pinned` is the set of event ids that must survive pruning regardless of
/// age (messages holding still-pending delegations).
pub fn assemble(
    conv: &Conversation,
    leaf_id: &str,
    viewer: &PublicKey,
    pinned: &HashSet<String>,
    options: &ThreadOptions,
) -> Vec<ThreadMessage> {
    let mut chain = conv.ancestors(leaf_id);
    chain.reverse();
    let ancestor_ids: HashSet<String> =
        chain.iter().map(|ce| ce.event.id.to_hex()).collect();

    let mut messages = Vec::new();
    for ancestor in &chain {
        messages.push(ThreadMessage::from_event(ancestor, viewer));

        // Sibling subtrees the viewer is addressed in, spliced after their
        // branch point in arrival order.
        let mut branches: Vec<&ConversationEvent> = conv
            .children(&ancestor.event.id.to_hex())
            .into_iter()
            .filter(|child| !ancestor_ids.contains(&child.event.id.to_hex()))
            .collect();
        branches.sort_by_key(|ce| ce.event.created_at.as_u64());
        for branch in branches {
            if subtree_addresses(conv, branch, viewer) {
                append_subtree(conv, branch, viewer, &mut messages);
            }
        }
    }

    prune(messages, pinned, options)
}

fn subtree_addresses(conv: &Conversation, node: &ConversationEvent, viewer: &PublicKey) -> bool {
    if tags::recipients(&node.event).contains(viewer) || node.event.pubkey == *viewer {
        return true;
    }
    conv.children(&node.event.id.to_hex())
        .into_iter()
        .any(|child| subtree_addresses(conv, child, viewer))
}

fn append_subtree(
    conv: &Conversation,
    node: &ConversationEvent,
    viewer: &PublicKey,
    out: &mut Vec<ThreadMessage>,
) {
    out.push(ThreadMessage::from_event(node, viewer));
    let mut children = conv.children(&node.event.id.to_hex());
    children.sort_by_key(|ce| ce.event.created_at.as_u64());
    for child in children {
        append_subtree(conv, child, viewer, out);
    }
}

/// Collapse old history into one system summary once the thread exceeds the
/// token budget. Kept verbatim: the root, the most recent `keep_recent`
/// messages, everything the viewer authored, and pinned messages.
fn prune(
    messages: Vec<ThreadMessage>,
    pinned: &HashSet<String>,
    options: &ThreadOptions,
) -> Vec<ThreadMessage> {
    let total: usize = messages.iter().map(ThreadMessage::estimated_tokens).sum();
    if total <= options.max_tokens || messages.len() <= options.keep_recent + 1 {
        return messages;
    }

    let recent_start = messages.len() - options.keep_recent;
    let mut result = Vec::with_capacity(messages.len());
    let mut run_count = 0usize;
    let mut run_authors: Vec<String> = Vec::new();

    for (i, msg) in messages.into_iter().enumerate() {
        let protected = i == 0
            || i >= recent_start
            || msg.role == ThreadRole::Assistant
            || msg
                .event_id
                .as_ref()
                .is_some_and(|id| pinned.contains(id));

        if protected {
            if run_count > 0 {
                result.push(summary_message(run_count, &run_authors));
                run_count = 0;
                run_authors.clear();
            }
            result.push(msg);
        } else {
            run_count += 1;
            if let Some(author) = &msg.author {
                if !run_authors.contains(author) {
                    run_authors.push(author.clone());
                }
            }
        }
    }
    if run_count > 0 {
        result.push(summary_message(run_count, &run_authors));
    }
    result
}

fn summary_message(count: usize, authors: &[String]) -> ThreadMessage {
    let who = if authors.is_empty() {
        String::new()
    } else {
        let short: Vec<String> = authors
            .iter()
            .map(|a| a.chars().take(8).collect::<String>())
            .collect();
        format!(" from {}", short.join(", "))
    };
    ThreadMessage::system(format!(
        "[{count} earlier message(s){who} elided to fit the context budget]"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::tree::ConversationCoordinator;
    use crate::relay::tags::{e_reply, e_root};
    use nostr::prelude::{Event, EventBuilder, Keys, Kind, Tag, Timestamp};

    fn msg(keys: &Keys, content: &str, tags: Vec<Tag>, at: u64) -> Event {
        EventBuilder::new(Kind::from(1), content)
            .tags(tags)
            .custom_created_at(Timestamp::from(at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn build_linear(
        coord: &mut ConversationCoordinator,
        user: &Keys,
        agent: &Keys,
        turns: usize,
    ) -> (Event, Event) {
        let root = msg(user, "turn 0", vec![], 1000);
        coord.ingest(&root).unwrap();
        let mut parent = root.clone();
        let mut last = root.clone();
        for i in 1..=turns {
            let keys = if i % 2 == 0 { user } else { agent };
            let at = 1000 + u64::try_from(i).unwrap();
            let event = msg(
                keys,
                &format!("turn {i}"),
                vec![e_root(root.id), e_reply(parent.id)],
                at,
            );
            coord.ingest(&event).unwrap();
            parent = event.clone();
            last = event;
        }
        (root, last)
    }

    #[test]
    fn one_message_per_ancestor_with_alternating_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = ConversationCoordinator::open(dir.path(), ThreadOptions::default());
        let user = Keys::generate();
        let agent = Keys::generate();

        let (_root, last) = build_linear(&mut coord, &user, &agent, 3);
        let thread = coord.thread_for(&last.id, &agent.public_key(), &HashSet::new());

        assert_eq!(thread.len(), 4);
        assert_eq!(thread[0].role, ThreadRole::User);
        assert_eq!(thread[1].role, ThreadRole::Assistant);
        assert_eq!(thread[2].role, ThreadRole::User);
        assert_eq!(thread[3].role, ThreadRole::Assistant);
        assert_eq!(thread[0].content, "turn 0");
        assert_eq!(thread[3].content, "turn 3");
    }

    #[test]
    fn sibling_branch_included_only_when_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = ConversationCoordinator::open(dir.path(), ThreadOptions::default());
        let user = Keys::generate();
        let viewer = Keys::generate();
        let other = Keys::generate();

        let root = msg(&user, "root", vec![], 1000);
        coord.ingest(&root).unwrap();

        // Branch A addresses the viewer.
        let branch_a = msg(
            &user,
            "for you",
            vec![
                e_root(root.id),
                e_reply(root.id),
                Tag::public_key(viewer.public_key()),
            ],
            1001,
        );
        coord.ingest(&branch_a).unwrap();

        // Branch B addresses someone else.
        let branch_b = msg(
            &user,
            "for other",
            vec![
                e_root(root.id),
                e_reply(root.id),
                Tag::public_key(other.public_key()),
            ],
            1002,
        );
        coord.ingest(&branch_b).unwrap();

        // The viewer wakes on a third branch.
        let trigger = msg(
            &user,
            "wake up",
            vec![
                e_root(root.id),
                e_reply(root.id),
                Tag::public_key(viewer.public_key()),
            ],
            1003,
        );
        coord.ingest(&trigger).unwrap();

        let thread = coord.thread_for(&trigger.id, &viewer.public_key(), &HashSet::new());
        let contents: Vec<&str> = thread.iter().map(|m| m.content.as_str()).collect();

        assert!(contents.contains(&"for you"));
        assert!(!contents.contains(&"for other"));
        assert!(contents.contains(&"wake up"));
    }

    #[test]
    fn pruning_keeps_root_recent_and_viewer_messages() {
        let dir = tempfile::tempdir().unwrap();
        let options = ThreadOptions {
            max_tokens: 60,
            keep_recent: 2,
        };
        let mut coord = ConversationCoordinator::open(dir.path(), options);
        let user = Keys::generate();
        let agent = Keys::generate();

        let (root, last) = build_linear(&mut coord, &user, &agent, 9);
        let thread = coord.thread_for(&last.id, &agent.public_key(), &HashSet::new());

        // Root survives.
        assert_eq!(
            thread.first().unwrap().event_id.as_deref(),
            Some(root.id.to_hex().as_str())
        );
        // A summary was inserted.
        assert!(thread.iter().any(|m| m.role == ThreadRole::System));
        // Every viewer-authored message survives (odd turns).
        let assistant_count = thread
            .iter()
            .filter(|m| m.role == ThreadRole::Assistant)
            .count();
        assert_eq!(assistant_count, 5);
        // The last two messages survive verbatim.
        assert_eq!(thread.last().unwrap().content, "turn 9");
    }

    #[test]
    fn pinned_messages_survive_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let options = ThreadOptions {
            max_tokens: 60,
            keep_recent: 2,
        };
        let mut coord = ConversationCoordinator::open(dir.path(), options);
        let user = Keys::generate();
        let agent = Keys::generate();
        let viewer = Keys::generate();

        // All turns authored by user/agent; viewer authored nothing, so only
        // pinning can protect mid-history messages.
        let (_root, last) = build_linear(&mut coord, &user, &agent, 9);
        let conv = coord.get(coord.root_of(&last.id).unwrap()).unwrap();
        let pinned_id = conv.events[3].event.id.to_hex();
        let pinned: HashSet<String> = [pinned_id.clone()].into();

        let thread = coord.thread_for(&last.id, &viewer.public_key(), &pinned);
        assert!(thread
            .iter()
            .any(|m| m.event_id.as_deref() == Some(pinned_id.as_str())));
    }

    #[test]
    fn unknown_event_yields_empty_thread() {
        let dir = tempfile::tempdir().unwrap();
        let coord = ConversationCoordinator::open(dir.path(), ThreadOptions::default());
        let keys = Keys::generate();
        let stray = msg(&keys, "stray", vec![], 1);
        assert!(coord
            .thread_for(&stray.id, &keys.public_key(), &HashSet::new())
            .is_empty());
    }
}
