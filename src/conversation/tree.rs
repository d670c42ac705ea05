//! Conversation trees and the per-project coordinator

use nostr::prelude::{Event, EventId, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::relay::tags;
use crate::store::{self, StoreError};

use super::thread::{self, ThreadMessage, ThreadOptions};
use super::Phase;

pub const CONVERSATIONS_DIR: &str = "conversations";

/// One event in a tree, with its derived parent link.
///
/// The full signed event is retained so a tree file is self-contained and
/// threads can be rebuilt without the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub event: Event,
    /// Reply target, if the event carried one that resolves inside this
    /// conversation.
    pub parent: Option<String>,
}

/// A conversation tree plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub root: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub phase_reason: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Seconds since epoch of the most recent ingested event.
    pub last_activity: u64,
    pub participants: BTreeSet<String>,
    /// Arrival order.
    pub events: Vec<ConversationEvent>,
}

impl Conversation {
    fn new(root: String, created_at: u64) -> Self {
        Self {
            root,
            phase: Phase::default(),
            phase_reason: None,
            title: None,
            summary: None,
            last_activity: created_at,
            participants: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.events.iter().any(|e| e.event.id.to_hex() == id)
    }

    pub fn get(&self, id: &str) -> Option<&ConversationEvent> {
        self.events.iter().find(|e| e.event.id.to_hex() == id)
    }

    /// Children of `id` in arrival order.
    pub fn children(&self, id: &str) -> Vec<&ConversationEvent> {
        self.events
            .iter()
            .filter(|e| e.parent.as_deref() == Some(id))
            .collect()
    }

    /// Ancestor chain from `id` up to and including the root, leaf-first.
    pub fn ancestors(&self, id: &str) -> Vec<&ConversationEvent> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id);
        while let Some(node) = cursor {
            chain.push(node);
            cursor = node.parent.as_deref().and_then(|p| self.get(p));
        }
        chain
    }
}

/// Outcome of ingesting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingest {
    pub root: String,
    pub created_conversation: bool,
    pub inserted: bool,
}

/// Owns every conversation in one project. Single-writer within the
/// runtime; persisted one file per root under
/// `{project_dir}/conversations/`.
pub struct ConversationCoordinator {
    dir: PathBuf,
    conversations: HashMap<String, Conversation>,
    event_to_root: HashMap<String, String>,
    options: ThreadOptions,
}

impl ConversationCoordinator {
    pub fn open(project_dir: &Path, options: ThreadOptions) -> Self {
        let dir = project_dir.join(CONVERSATIONS_DIR);
        let mut coordinator = Self {
            dir: dir.clone(),
            conversations: HashMap::new(),
            event_to_root: HashMap::new(),
            options,
        };

        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if path.extension().map(|e| e == "json") != Some(true) {
                    continue;
                }
                if let Some(conv) = store::load_json_or_quarantine::<Conversation>(&path) {
                    for ce in &conv.events {
                        coordinator
                            .event_to_root
                            .insert(ce.event.id.to_hex(), conv.root.clone());
                    }
                    coordinator
                        .event_to_root
                        .insert(conv.root.clone(), conv.root.clone());
                    coordinator.conversations.insert(conv.root.clone(), conv);
                }
            }
        }

        coordinator
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, root: &str) -> Option<&Conversation> {
        self.conversations.get(root)
    }

    /// The conversation root an event belongs to, if we have seen it.
    pub fn root_of(&self, id: &EventId) -> Option<&str> {
        self.event_to_root.get(&id.to_hex()).map(String::as_str)
    }

    /// Insert an event into its tree, creating the conversation on first
    /// contact. Idempotent on event id.
    pub fn ingest(&mut self, event: &Event) -> Result<Ingest, StoreError> {
        let id = event.id.to_hex();
        // Idempotence is on stored events, not the root index: a
        // conversation created from replies knows its root id before the
        // root event itself arrives.
        if let Some(root) = self.event_to_root.get(&id) {
            if self
                .conversations
                .get(root)
                .is_some_and(|c| c.contains(&id))
            {
                return Ok(Ingest {
                    root: root.clone(),
                    created_conversation: false,
                    inserted: false,
                });
            }
        }

        let root = self.resolve_root(event);
        let created = !self.conversations.contains_key(&root);
        let conv = self
            .conversations
            .entry(root.clone())
            .or_insert_with(|| Conversation::new(root.clone(), event.created_at.as_u64()));

        let parent = tags::reply_target(event)
            .map(|p| p.to_hex())
            .filter(|p| *p != id && conv.contains(p));

        conv.events.push(ConversationEvent {
            event: event.clone(),
            parent: parent.or_else(|| {
                // Reply into a known conversation whose direct parent we
                // never saw: attach to the root rather than floating.
                (id != conv.root && tags::is_reply(event)).then(|| conv.root.clone())
            }),
        });
        conv.participants.insert(event.pubkey.to_hex());
        conv.last_activity = conv.last_activity.max(event.created_at.as_u64());
        if let Some(phase) = tags::phase(event) {
            conv.phase = phase;
        }

        self.event_to_root.insert(id, root.clone());
        self.event_to_root.insert(root.clone(), root.clone());
        self.persist(&root)?;

        Ok(Ingest {
            root,
            created_conversation: created,
            inserted: true,
        })
    }

    fn resolve_root(&self, event: &Event) -> String {
        // A reply target we already know wins: clients sometimes tag only
        // the direct parent.
        if let Some(parent) = tags::reply_target(event) {
            if let Some(root) = self.event_to_root.get(&parent.to_hex()) {
                return root.clone();
            }
        }
        if let Some(root) = tags::root_target(event) {
            return root.to_hex();
        }
        event.id.to_hex()
    }

    /// Apply a conversation-metadata event (title/summary for a root).
    pub fn apply_metadata(&mut self, event: &Event) -> Result<(), StoreError> {
        let Some(root) = tags::root_target(event).map(|id| id.to_hex()) else {
            return Ok(());
        };
        let Some(conv) = self.conversations.get_mut(&root) else {
            return Ok(());
        };
        if let Some(title) = tags::title(event) {
            conv.title = Some(title);
        }
        if !event.content.is_empty() {
            conv.summary = Some(event.content.clone());
        }
        self.persist(&root)
    }

    pub fn phase(&self, root: &str) -> Option<Phase> {
        self.conversations.get(root).map(|c| c.phase)
    }

    /// Record a phase transition. The mutation is persisted here; the tag
    /// on the next outbound reply is the publisher's job.
    pub fn set_phase(
        &mut self,
        root: &str,
        phase: Phase,
        reason: impl Into<String>,
    ) -> Result<Option<Phase>, StoreError> {
        let Some(conv) = self.conversations.get_mut(root) else {
            return Ok(None);
        };
        let previous = conv.phase;
        conv.phase = phase;
        conv.phase_reason = Some(reason.into());
        self.persist(root)?;
        Ok(Some(previous))
    }

    /// The message sequence `viewer` sees when waking on `event_id`.
    pub fn thread_for(
        &self,
        event_id: &EventId,
        viewer: &PublicKey,
        pinned: &std::collections::HashSet<String>,
    ) -> Vec<ThreadMessage> {
        let id = event_id.to_hex();
        let Some(root) = self.event_to_root.get(&id) else {
            return Vec::new();
        };
        let Some(conv) = self.conversations.get(root) else {
            return Vec::new();
        };
        thread::assemble(conv, &id, viewer, pinned, &self.options)
    }

    fn persist(&self, root: &str) -> Result<(), StoreError> {
        let Some(conv) = self.conversations.get(root) else {
            return Ok(());
        };
        store::write_json_atomic(&self.dir.join(format!("{root}.json")), conv)
    }
}
