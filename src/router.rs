//! Inbound event classification
//!
//! First match wins: ignored kinds, delegation correlation, project
//! resolution, dedup, enqueue. Everything that falls through is dropped
//! with a warning; nothing in here can take the daemon down.

use nostr::prelude::Event;
use std::sync::Arc;

use crate::daemon::{DaemonInner, RuntimeSlot};
use crate::relay::{kinds, tags};
use crate::runtime::{ProjectDoc, ProjectRuntime};

pub struct EventRouter {
    state: Arc<DaemonInner>,
}

impl EventRouter {
    pub fn new(state: Arc<DaemonInner>) -> Self {
        Self { state }
    }

    pub fn route(&self, event: &Event) {
        // 1. Silent drops.
        if kinds::is_ignored(event.kind) {
            return;
        }

        // 2. Delegation completions short-circuit normal routing.
        if self.try_delegation_reply(event) {
            return;
        }

        // Project definitions are their own coordinate; track them before
        // resolution so later events can route here.
        if event.kind.as_u16() == kinds::PROJECT {
            self.track_project(event);
            return;
        }

        // 3. Resolve the target project.
        let Some(coordinate) = self.resolve_project(event) else {
            tracing::warn!(
                event = %event.id,
                kind = event.kind.as_u16(),
                "no project resolvable; dropping event"
            );
            return;
        };

        // Runtime lookup / lazy materialization.
        let Some(runtime) = self.runtime_for(&coordinate, event) else {
            return;
        };

        // 4–5. Dedup, then enqueue.
        if !runtime.dedup_insert(&event.id) {
            tracing::debug!(event = %event.id, "duplicate event dropped");
            return;
        }
        runtime.enqueue(Box::new(event.clone()));
    }

    fn try_delegation_reply(&self, event: &Event) -> bool {
        let runtimes = self.state.runtimes.read().expect("runtimes lock");
        for slot in runtimes.values() {
            if let RuntimeSlot::Ready(runtime) = slot {
                if runtime.is_awaiting_delegation(event) {
                    runtime.on_delegation_reply(event);
                    return true;
                }
            }
        }
        false
    }

    fn track_project(&self, event: &Event) {
        let Some(doc) = ProjectDoc::from_event(event) else {
            tracing::warn!(event = %event.id, "malformed project definition dropped");
            return;
        };
        let coordinate = doc.coordinate_string();

        {
            let mut agent_index = self.state.agent_index.write().expect("agent index lock");
            for (pubkey, _) in &doc.agent_refs {
                agent_index.insert(pubkey.to_hex(), coordinate.clone());
            }
        }
        self.state
            .projects
            .write()
            .expect("projects lock")
            .insert(coordinate.clone(), doc);

        // A live runtime refreshes its agent registry from the update.
        let runtimes = self.state.runtimes.read().expect("runtimes lock");
        if let Some(RuntimeSlot::Ready(runtime)) = runtimes.get(&coordinate) {
            if runtime.dedup_insert(&event.id) {
                runtime.enqueue(Box::new(event.clone()));
            }
        }
    }

    /// `a` tag first, then any `p`-tagged pubkey that maps to a known
    /// project's agent, then the author itself (agents publishing into
    /// their own project).
    fn resolve_project(&self, event: &Event) -> Option<String> {
        if let Some(coordinate) = tags::project_coordinate(event) {
            return Some(coordinate.to_string());
        }

        let agent_index = self.state.agent_index.read().expect("agent index lock");
        for pubkey in tags::recipients(event) {
            if let Some(coordinate) = agent_index.get(&pubkey.to_hex()) {
                return Some(coordinate.clone());
            }
        }
        agent_index.get(&event.pubkey.to_hex()).cloned()
    }

    fn runtime_for(&self, coordinate: &str, event: &Event) -> Option<Arc<ProjectRuntime>> {
        {
            let runtimes = self.state.runtimes.read().expect("runtimes lock");
            match runtimes.get(coordinate) {
                Some(RuntimeSlot::Ready(runtime)) => return Some(runtime.clone()),
                Some(RuntimeSlot::Failed) => {
                    tracing::warn!(project = %coordinate, event = %event.id, "runtime failed; dropping event");
                    return None;
                }
                None => {}
            }
        }

        // Only messages and boot requests materialize a runtime; metadata
        // and agent definitions wait for one to exist.
        if !matches!(
            event.kind.as_u16(),
            kinds::MESSAGE | kinds::BOOT_REQUEST
        ) {
            return None;
        }

        let doc = {
            let projects = self.state.projects.read().expect("projects lock");
            projects.get(coordinate).cloned()
        };
        let Some(doc) = doc else {
            tracing::warn!(project = %coordinate, event = %event.id, "unknown project; dropping event");
            return None;
        };

        let mut runtimes = self.state.runtimes.write().expect("runtimes lock");
        // Double-checked: another route call may have won the race.
        match runtimes.get(coordinate) {
            Some(RuntimeSlot::Ready(runtime)) => return Some(runtime.clone()),
            Some(RuntimeSlot::Failed) => return None,
            None => {}
        }

        match ProjectRuntime::start(
            doc,
            self.state.config.clone(),
            self.state.bus.clone(),
            self.state.models.clone(),
            &self.state.cancel,
        ) {
            Ok(runtime) => {
                runtimes.insert(coordinate.to_string(), RuntimeSlot::Ready(runtime.clone()));
                Some(runtime)
            }
            Err(e) => {
                tracing::error!(project = %coordinate, error = %e, "project runtime failed to start");
                runtimes.insert(coordinate.to_string(), RuntimeSlot::Failed);
                None
            }
        }
    }
}
