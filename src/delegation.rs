//! Delegation registry
//!
//! Tracks outstanding agent-to-agent delegations, correlates inbound
//! completion events back to the waiting turn via `q` tags, and persists a
//! snapshot across restarts. Waiters are plain in-memory notifications and
//! do not survive a restart: reloaded in-flight records become `orphaned`
//! and surface as notices in the delegator's next thread.

use chrono::{DateTime, Utc};
use nostr::prelude::{Event, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::conversation::Phase;
use crate::relay::tags;
use crate::store::{self, StoreError};

pub const DELEGATIONS_FILE: &str = "delegations.json";

/// Writes are collapsed to at most one per debounce window.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("agent {0} cannot delegate to itself without a phase transition")]
    SelfDelegation(String),
    #[error("unknown delegation {0}")]
    NotFound(String),
}

/// Per-recipient terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientReply {
    pub recipient: String,
    pub content: String,
    pub status: ReplyStatus,
    /// Completion event id, when one arrived.
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    InFlight,
    Complete,
    TimedOut,
    /// Reloaded from disk with no live waiter.
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub id: String,
    pub delegator: String,
    pub recipients: Vec<String>,
    pub conversation: String,
    /// One request event per recipient; every one correlates back here.
    pub request_event_ids: Vec<String>,
    pub phase: Option<Phase>,
    pub created_at: DateTime<Utc>,
    pub pending: Vec<String>,
    pub results: Vec<RecipientReply>,
    pub status: DelegationStatus,
}

impl DelegationRecord {
    /// Complete iff nobody is pending.
    #[allow(dead_code)] // API completeness
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What a new delegation looks like at registration time.
#[derive(Debug, Clone)]
pub struct DelegationSpec {
    pub delegator: PublicKey,
    pub recipients: Vec<PublicKey>,
    pub conversation: String,
    pub request_event_ids: Vec<String>,
    pub phase: Option<Phase>,
}

/// Result handed back to the suspended turn.
#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    pub delegation_id: String,
    pub results: Vec<RecipientReply>,
    pub timed_out: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<DelegationRecord>,
}

struct Inner {
    records: HashMap<String, DelegationRecord>,
    by_request: HashMap<String, String>,
    waiters: HashMap<String, Arc<Notify>>,
    dirty: bool,
}

/// Shared by all agents within one project runtime.
pub struct DelegationRegistry {
    path: PathBuf,
    inner: Mutex<Inner>,
    persist_signal: Notify,
}

impl DelegationRegistry {
    /// Load the registry for a project directory. In-flight records from a
    /// previous run become `orphaned`.
    pub fn open(project_dir: &Path) -> Self {
        let path = project_dir.join(DELEGATIONS_FILE);
        let snapshot: Snapshot = store::load_json_or_quarantine(&path).unwrap_or_default();

        let mut records = HashMap::new();
        let mut by_request = HashMap::new();
        for mut record in snapshot.records {
            if record.status == DelegationStatus::InFlight {
                tracing::warn!(
                    delegation = %record.id,
                    delegator = %record.delegator,
                    pending = record.pending.len(),
                    "delegation orphaned by restart"
                );
                record.status = DelegationStatus::Orphaned;
            }
            for request_id in &record.request_event_ids {
                by_request.insert(request_id.clone(), record.id.clone());
            }
            records.insert(record.id.clone(), record);
        }

        Self {
            path,
            inner: Mutex::new(Inner {
                records,
                by_request,
                waiters: HashMap::new(),
                dirty: false,
            }),
            persist_signal: Notify::new(),
        }
    }

    /// Register a new delegation. Rejects self-delegation unless the spec
    /// carries a phase (phase-transition self-delegation). Returns
    /// immediately; completion is awaited separately.
    pub fn register(&self, spec: &DelegationSpec) -> Result<String, DelegationError> {
        let delegator = spec.delegator.to_hex();
        let recipients: Vec<String> = spec.recipients.iter().map(PublicKey::to_hex).collect();

        if spec.phase.is_none() && recipients.contains(&delegator) {
            return Err(DelegationError::SelfDelegation(delegator));
        }

        let record = DelegationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            delegator,
            recipients: recipients.clone(),
            conversation: spec.conversation.clone(),
            request_event_ids: spec.request_event_ids.clone(),
            phase: spec.phase,
            created_at: Utc::now(),
            pending: recipients,
            results: Vec::new(),
            status: DelegationStatus::InFlight,
        };
        let id = record.id.clone();

        {
            let mut inner = self.inner.lock().expect("delegation lock");
            for request_id in &record.request_event_ids {
                inner.by_request.insert(request_id.clone(), id.clone());
            }
            inner.records.insert(id.clone(), record);
            inner.dirty = true;
        }
        self.persist_signal.notify_one();

        Ok(id)
    }

    /// Whether `id` is the request event of an in-flight delegation. The
    /// executor uses this to `q`-tag completion replies.
    pub fn is_delegation_request(&self, id: &nostr::prelude::EventId) -> bool {
        let inner = self.inner.lock().expect("delegation lock");
        inner
            .by_request
            .get(&id.to_hex())
            .and_then(|delegation_id| inner.records.get(delegation_id))
            .is_some_and(|r| r.status == DelegationStatus::InFlight)
    }

    /// Whether this event correlates to a delegation still in flight.
    pub fn is_awaiting(&self, event: &Event) -> bool {
        let inner = self.inner.lock().expect("delegation lock");
        Self::correlated_id(&inner, event)
            .and_then(|id| inner.records.get(&id))
            .is_some_and(|r| r.status == DelegationStatus::InFlight)
    }

    fn correlated_id(inner: &Inner, event: &Event) -> Option<String> {
        for correlation in tags::correlations(event) {
            if let Some(id) = inner.by_request.get(&correlation) {
                return Some(id.clone());
            }
        }
        // Some clients reply-tag the request instead of q-tagging it. Only
        // a reply addressed back to the delegator counts; a recipient's own
        // onward delegation requests also reply-tag ours.
        let parent = tags::reply_target(event)?;
        let id = inner.by_request.get(&parent.to_hex())?;
        let record = inner.records.get(id)?;
        let delegator = PublicKey::parse(&record.delegator).ok()?;
        tags::recipients(event)
            .contains(&delegator)
            .then(|| id.clone())
    }

    /// Credit a completion event against its delegation.
    ///
    /// A recipient is removed from `pending` on its first reply; a later
    /// reply from the same recipient before the waiter wakes replaces the
    /// recorded content (last wins) without re-crediting. Replies from
    /// pubkeys that were never recipients are ignored.
    pub fn on_reply(&self, event: &Event) -> Option<String> {
        let author = event.pubkey.to_hex();
        let delegation_id;
        let complete;
        {
            let mut inner = self.inner.lock().expect("delegation lock");
            let id = Self::correlated_id(&inner, event)?;
            let record = inner.records.get_mut(&id)?;
            if record.status != DelegationStatus::InFlight
                || !record.recipients.contains(&author)
            {
                return None;
            }

            if let Some(pos) = record.pending.iter().position(|p| *p == author) {
                record.pending.remove(pos);
                record.results.push(RecipientReply {
                    recipient: author.clone(),
                    content: event.content.clone(),
                    status: ReplyStatus::Completed,
                    event_id: Some(event.id.to_hex()),
                });
            } else if let Some(existing) = record
                .results
                .iter_mut()
                .find(|r| r.recipient == author && r.status == ReplyStatus::Completed)
            {
                existing.content = event.content.clone();
                existing.event_id = Some(event.id.to_hex());
            }

            complete = record.pending.is_empty();
            if complete {
                record.status = DelegationStatus::Complete;
            }
            inner.dirty = true;
            delegation_id = id.clone();
            if complete {
                if let Some(waiter) = inner.waiters.get(&id) {
                    waiter.notify_one();
                }
            }
        }
        self.persist_signal.notify_one();

        tracing::debug!(
            delegation = %delegation_id,
            recipient = %author,
            complete,
            "delegation reply credited"
        );
        Some(delegation_id)
    }

    /// Suspend until every recipient replied, or the timeout fires. On
    /// timeout, remaining recipients are marked `timed_out`; the delegation
    /// is not cancelled remotely.
    pub async fn await_completion(
        &self,
        delegation_id: &str,
        timeout: Duration,
    ) -> Result<DelegationOutcome, DelegationError> {
        let notify = {
            let mut inner = self.inner.lock().expect("delegation lock");
            if !inner.records.contains_key(delegation_id) {
                return Err(DelegationError::NotFound(delegation_id.to_string()));
            }
            inner
                .waiters
                .entry(delegation_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.finished_outcome(delegation_id) {
                self.drop_waiter(delegation_id);
                return Ok(outcome);
            }

            let notified = notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let outcome = self.finalize_timeout(delegation_id)?;
                self.drop_waiter(delegation_id);
                self.persist_signal.notify_one();
                return Ok(outcome);
            }
        }
    }

    fn finished_outcome(&self, delegation_id: &str) -> Option<DelegationOutcome> {
        let inner = self.inner.lock().expect("delegation lock");
        let record = inner.records.get(delegation_id)?;
        match record.status {
            DelegationStatus::InFlight => None,
            DelegationStatus::Complete | DelegationStatus::Orphaned => Some(DelegationOutcome {
                delegation_id: record.id.clone(),
                results: record.results.clone(),
                timed_out: false,
            }),
            DelegationStatus::TimedOut => Some(DelegationOutcome {
                delegation_id: record.id.clone(),
                results: record.results.clone(),
                timed_out: true,
            }),
        }
    }

    fn finalize_timeout(&self, delegation_id: &str) -> Result<DelegationOutcome, DelegationError> {
        let mut inner = self.inner.lock().expect("delegation lock");
        let record = inner
            .records
            .get_mut(delegation_id)
            .ok_or_else(|| DelegationError::NotFound(delegation_id.to_string()))?;

        for recipient in std::mem::take(&mut record.pending) {
            record.results.push(RecipientReply {
                recipient,
                content: String::new(),
                status: ReplyStatus::TimedOut,
                event_id: None,
            });
        }
        if record.status == DelegationStatus::InFlight {
            record.status = DelegationStatus::TimedOut;
        }
        let outcome = DelegationOutcome {
            delegation_id: record.id.clone(),
            results: record.results.clone(),
            timed_out: record.status == DelegationStatus::TimedOut,
        };
        inner.dirty = true;

        Ok(outcome)
    }

    fn drop_waiter(&self, delegation_id: &str) {
        let mut inner = self.inner.lock().expect("delegation lock");
        inner.waiters.remove(delegation_id);
    }

    /// Number of delegations still in flight (idle-reap gate).
    pub fn in_flight(&self) -> usize {
        let inner = self.inner.lock().expect("delegation lock");
        inner
            .records
            .values()
            .filter(|r| r.status == DelegationStatus::InFlight)
            .count()
    }

    /// Request event ids of in-flight delegations; these messages must
    /// survive conversation pruning.
    pub fn pinned_event_ids(&self) -> std::collections::HashSet<String> {
        let inner = self.inner.lock().expect("delegation lock");
        inner
            .records
            .values()
            .filter(|r| r.status == DelegationStatus::InFlight)
            .flat_map(|r| r.request_event_ids.iter().cloned())
            .collect()
    }

    /// One-shot orphan notices for a delegator, marking them surfaced.
    pub fn take_orphan_notices(&self, delegator: &PublicKey) -> Vec<String> {
        let delegator = delegator.to_hex();
        let mut inner = self.inner.lock().expect("delegation lock");
        let mut notices = Vec::new();
        let ids: Vec<String> = inner
            .records
            .values()
            .filter(|r| r.status == DelegationStatus::Orphaned && r.delegator == delegator)
            .map(|r| r.id.clone())
            .collect();
        for id in ids {
            if let Some(record) = inner.records.get_mut(&id) {
                notices.push(format!(
                    "Delegation {} (requests [{}]) to [{}] was interrupted by a daemon \
                     restart; {} recipient(s) never replied. Re-delegate if the work \
                     still matters.",
                    record.id,
                    record.request_event_ids.join(", "),
                    record.recipients.join(", "),
                    record.pending.len(),
                ));
                record.status = DelegationStatus::TimedOut;
                inner.dirty = true;
            }
        }
        if !notices.is_empty() {
            drop(inner);
            self.persist_signal.notify_one();
        }
        notices
    }

    /// Background flusher: collapses bursts of mutations into one write per
    /// debounce window. Runs until the runtime's token cancels.
    pub async fn run_flusher(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                () = self.persist_signal.notified() => {
                    tokio::time::sleep(PERSIST_DEBOUNCE).await;
                    if let Err(e) = self.flush() {
                        tracing::error!(error = %e, "failed to persist delegations");
                    }
                }
                () = cancel.cancelled() => {
                    if let Err(e) = self.flush() {
                        tracing::error!(error = %e, "failed to persist delegations at shutdown");
                    }
                    return;
                }
            }
        }
    }

    /// Write the snapshot now if anything changed.
    pub fn flush(&self) -> Result<(), StoreError> {
        let snapshot = {
            let mut inner = self.inner.lock().expect("delegation lock");
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            let mut records: Vec<DelegationRecord> = inner.records.values().cloned().collect();
            records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Snapshot { records }
        };
        store::write_json_atomic(&self.path, &snapshot)
    }

    #[cfg(test)]
    pub fn record(&self, id: &str) -> Option<DelegationRecord> {
        self.inner
            .lock()
            .expect("delegation lock")
            .records
            .get(id)
            .cloned()
    }
}
