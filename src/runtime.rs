//! Per-project runtime
//!
//! One `ProjectRuntime` per active project: its context bundle, dedup
//! store, bounded work queue and executor tasks. Runtimes are created
//! lazily on the first routed event and torn down by the daemon's reaper
//! once idle with nothing in flight.

pub mod executor;
pub mod publisher;

pub use executor::{AgentExecutor, StopReason, TurnError, TurnOutcome};
pub use publisher::{AgentPublisher, OutboundError, OutboundMessage};

use nostr::prelude::{Coordinate, Event, EventId, PublicKey};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentError, AgentRegistry, ProjectAgent};
use crate::config::Config;
use crate::conversation::{ConversationCoordinator, Phase, ThreadMessage, ThreadOptions};
use crate::dedup::DedupStore;
use crate::delegation::DelegationRegistry;
use crate::llm::ModelRegistry;
use crate::relay::{kinds, tags, EventBus};
use crate::store::StoreError;
use crate::tools::ToolRegistry;

/// Bounded inbound queue per runtime.
pub const WORK_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Agents(#[from] AgentError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed project definition.
#[derive(Debug, Clone)]
pub struct ProjectDoc {
    pub coordinate: Coordinate,
    pub slug: String,
    pub title: Option<String>,
    pub pubkey: PublicKey,
    /// Ordered agent references; first is the PM unless a definition claims
    /// the flag.
    pub agent_refs: Vec<(PublicKey, Option<String>)>,
}

impl ProjectDoc {
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind.as_u16() != kinds::PROJECT {
            return None;
        }
        let slug = tags::identifier(event)?;
        let coordinate = Coordinate::parse(&format!(
            "{}:{}:{slug}",
            kinds::PROJECT,
            event.pubkey.to_hex()
        ))
        .ok()?;
        let agent_refs = tags::agent_refs(event);
        Some(Self {
            coordinate,
            slug,
            title: tags::title(event),
            pubkey: event.pubkey,
            agent_refs,
        })
    }

    pub fn coordinate_string(&self) -> String {
        self.coordinate.to_string()
    }
}

/// The ambient bundle every executor and tool call sees, scoped to one
/// project. Threaded explicitly as an `Arc`; never global.
pub struct ProjectContext {
    pub doc: ProjectDoc,
    pub dir: PathBuf,
    pub tools: ToolRegistry,
    pub models: Arc<ModelRegistry>,
    pub publisher: AgentPublisher,
    config: Arc<Config>,
    agents: RwLock<AgentRegistry>,
    coordinator: Mutex<ConversationCoordinator>,
    delegations: Arc<DelegationRegistry>,
}

impl ProjectContext {
    pub fn title(&self) -> &str {
        self.doc.title.as_deref().unwrap_or(&self.doc.slug)
    }

    pub fn max_steps(&self) -> u32 {
        self.config.max_steps
    }

    pub fn delegation_timeout(&self) -> Duration {
        self.config.delegation_timeout
    }

    pub fn delegations(&self) -> &Arc<DelegationRegistry> {
        &self.delegations
    }

    pub fn pm(&self) -> Arc<ProjectAgent> {
        self.agents.read().expect("agents lock").pm()
    }

    pub fn is_pm(&self, agent: &ProjectAgent) -> bool {
        self.agents
            .read()
            .expect("agents lock")
            .is_pm(&agent.pubkey())
    }

    pub fn agent(&self, pubkey: &PublicKey) -> Option<Arc<ProjectAgent>> {
        self.agents.read().expect("agents lock").get(pubkey)
    }

    pub fn agent_by_slug(&self, slug: &str) -> Option<Arc<ProjectAgent>> {
        self.agents.read().expect("agents lock").get_by_slug(slug)
    }

    pub fn resolve_recipient(&self, recipient: &str) -> Result<PublicKey, AgentError> {
        self.agents
            .read()
            .expect("agents lock")
            .resolve_recipient(recipient)
    }

    pub fn slug_of_hex(&self, pubkey_hex: &str) -> Option<String> {
        let agents = self.agents.read().expect("agents lock");
        PublicKey::parse(pubkey_hex)
            .ok()
            .and_then(|pk| agents.get(&pk))
            .map(|a| a.slug().to_string())
    }

    /// `pubkey hex -> slug` for prompt authorship labels.
    pub fn agent_labels(&self) -> HashMap<String, String> {
        let agents = self.agents.read().expect("agents lock");
        agents
            .agents()
            .map(|a| (a.pubkey().to_hex(), a.slug().to_string()))
            .collect()
    }

    pub fn ingest(&self, event: &Event) -> Option<crate::conversation::tree::Ingest> {
        let mut coordinator = self.coordinator.lock().expect("coordinator lock");
        match coordinator.ingest(event) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(event = %event.id, error = %e, "failed to persist conversation");
                None
            }
        }
    }

    pub fn apply_metadata(&self, event: &Event) {
        let mut coordinator = self.coordinator.lock().expect("coordinator lock");
        if let Err(e) = coordinator.apply_metadata(event) {
            tracing::error!(event = %event.id, error = %e, "failed to persist conversation metadata");
        }
    }

    pub fn phase(&self, root: &str) -> Option<Phase> {
        self.coordinator.lock().expect("coordinator lock").phase(root)
    }

    pub fn set_phase(
        &self,
        root: &str,
        phase: Phase,
        reason: &str,
    ) -> Result<Option<Phase>, StoreError> {
        self.coordinator
            .lock()
            .expect("coordinator lock")
            .set_phase(root, phase, reason)
    }

    pub fn thread_for(
        &self,
        event_id: &EventId,
        viewer: &PublicKey,
        pinned: &std::collections::HashSet<String>,
    ) -> Vec<ThreadMessage> {
        self.coordinator
            .lock()
            .expect("coordinator lock")
            .thread_for(event_id, viewer, pinned)
    }

    /// Publish a message as `agent` and fold it into the local tree so the
    /// next thread assembly sees it without waiting for the relay echo.
    pub async fn publish_as(
        &self,
        agent: &Arc<ProjectAgent>,
        message: OutboundMessage,
    ) -> Result<Event, OutboundError> {
        let event = self.publisher.prepare(agent, message)?;
        self.send_prepared(agent, event).await
    }

    /// Sign a message without sending it (see `AgentPublisher::prepare`).
    pub fn prepare_message(
        &self,
        agent: &Arc<ProjectAgent>,
        message: OutboundMessage,
    ) -> Result<Event, OutboundError> {
        self.publisher.prepare(agent, message)
    }

    /// Send an event prepared earlier, then fold it into the local tree.
    pub async fn send_prepared(
        &self,
        agent: &Arc<ProjectAgent>,
        event: Event,
    ) -> Result<Event, OutboundError> {
        let event = self.publisher.send_prepared(agent, event).await?;
        if event.kind.as_u16() == kinds::MESSAGE {
            self.ingest(&event);
        }
        Ok(event)
    }

    fn refresh_agents_from_project(&self, doc: &ProjectDoc) {
        match AgentRegistry::load(&self.config.agents_dir(), &doc.agent_refs) {
            Ok(registry) => {
                *self.agents.write().expect("agents lock") = registry;
                tracing::info!(project = %doc.slug, "agent registry refreshed");
            }
            Err(e) => {
                tracing::warn!(
                    project = %doc.slug,
                    error = %e,
                    "ignoring project update that fails agent load"
                );
            }
        }
    }

    fn refresh_agent_definition(&self, event: &Event) {
        self.agents
            .write()
            .expect("agents lock")
            .refresh_from_event(event);
    }
}

/// Drop-oldest-non-reply bounded queue. Replies are never dropped, so the
/// queue can exceed capacity when it holds only replies.
struct WorkQueue {
    inner: Mutex<VecDeque<Box<Event>>>,
    notify: Notify,
    capacity: usize,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, event: Box<Event>) {
        {
            let mut queue = self.inner.lock().expect("work queue lock");
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|e| !tags::is_reply(e)) {
                    let dropped = queue.remove(pos);
                    tracing::warn!(
                        dropped = ?dropped.map(|e| e.id),
                        "work queue full; dropped oldest non-reply event"
                    );
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    async fn pop(&self, cancel: &CancellationToken) -> Option<Box<Event>> {
        loop {
            if let Some(event) = self.inner.lock().expect("work queue lock").pop_front() {
                return Some(event);
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = cancel.cancelled() => return None,
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("work queue lock").len()
    }
}

pub struct ProjectRuntime {
    pub context: Arc<ProjectContext>,
    dedup: Mutex<DedupStore>,
    queue: Arc<WorkQueue>,
    active_turns: Arc<AtomicUsize>,
    last_activity: Mutex<tokio::time::Instant>,
    cancel: CancellationToken,
}

impl ProjectRuntime {
    /// Materialize the runtime: load the project, build the agent
    /// registry, open state stores, start the worker. Any failure leaves no
    /// runtime behind and the daemon must not route here.
    pub fn start(
        doc: ProjectDoc,
        config: Arc<Config>,
        bus: EventBus,
        models: Arc<ModelRegistry>,
        parent_cancel: &CancellationToken,
    ) -> Result<Arc<Self>, ProjectError> {
        let dir = config.project_dir(&doc.slug);
        std::fs::create_dir_all(&dir)?;

        let agents = AgentRegistry::load(&config.agents_dir(), &doc.agent_refs)?;
        let dedup = DedupStore::open(&dir);
        let delegations = Arc::new(DelegationRegistry::open(&dir));
        let coordinator = ConversationCoordinator::open(
            &dir,
            ThreadOptions {
                max_tokens: config.max_conversation_tokens,
                ..ThreadOptions::default()
            },
        );
        let publisher = AgentPublisher::new(bus, doc.coordinate.clone());

        let context = Arc::new(ProjectContext {
            doc,
            dir,
            tools: ToolRegistry::standard(),
            models,
            publisher,
            config,
            agents: RwLock::new(agents),
            coordinator: Mutex::new(coordinator),
            delegations: delegations.clone(),
        });

        let cancel = parent_cancel.child_token();
        tokio::spawn(delegations.run_flusher(cancel.clone()));

        let runtime = Arc::new(Self {
            context,
            dedup: Mutex::new(dedup),
            queue: Arc::new(WorkQueue::new(WORK_QUEUE_CAPACITY)),
            active_turns: Arc::new(AtomicUsize::new(0)),
            last_activity: Mutex::new(tokio::time::Instant::now()),
            cancel,
        });

        tokio::spawn(runtime.clone().run());
        tracing::info!(
            project = %runtime.context.doc.slug,
            dir = %runtime.context.dir.display(),
            "project runtime started"
        );
        Ok(runtime)
    }

    /// The atomic seen+mark pair, single-writer per project.
    pub fn dedup_insert(&self, id: &EventId) -> bool {
        self.dedup.lock().expect("dedup lock").insert(id)
    }

    pub fn enqueue(&self, event: Box<Event>) {
        self.touch();
        self.queue.push(event);
    }

    pub fn is_awaiting_delegation(&self, event: &Event) -> bool {
        self.context.delegations.is_awaiting(event)
    }

    pub fn on_delegation_reply(&self, event: &Event) {
        self.touch();
        // Completions count as processed: a relay redelivery after the
        // delegation resolves must not wake anyone as a fresh message.
        self.dedup_insert(&event.id);
        self.context.delegations.on_reply(event);
    }

    pub fn active_turns(&self) -> usize {
        self.active_turns.load(Ordering::SeqCst)
    }

    /// Idle iff quiet past the timeout with no pending delegation and no
    /// running executor.
    pub fn is_idle(&self) -> bool {
        let quiet = self
            .last_activity
            .lock()
            .expect("activity lock")
            .elapsed()
            >= self.context.config.idle_timeout;
        quiet && self.context.delegations.in_flight() == 0 && self.active_turns() == 0
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = tokio::time::Instant::now();
    }

    async fn run(self: Arc<Self>) {
        while let Some(event) = self.queue.pop(&self.cancel).await {
            self.handle_event(&event);
        }
        tracing::info!(project = %self.context.doc.slug, "project runtime stopped");
    }

    fn handle_event(&self, event: &Event) {
        self.touch();
        match event.kind.as_u16() {
            kinds::PROJECT => {
                if let Some(doc) = ProjectDoc::from_event(event) {
                    self.context.refresh_agents_from_project(&doc);
                }
            }
            kinds::AGENT_DEFINITION => self.context.refresh_agent_definition(event),
            kinds::CONVERSATION_METADATA => self.context.apply_metadata(event),
            kinds::BOOT_REQUEST => {
                tracing::debug!(project = %self.context.doc.slug, "boot request; runtime warm");
            }
            kinds::MESSAGE => self.route_message(event),
            other => {
                tracing::debug!(kind = other, event = %event.id, "unhandled kind in runtime");
            }
        }
    }

    /// New roots go to the PM unless the content opens with an `@slug`
    /// mention; replies go to every p-tagged project agent. An agent never
    /// triggers itself.
    fn route_message(&self, event: &Event) {
        let Some(ingest) = self.context.ingest(event) else {
            return;
        };
        let root = ingest.root;

        let mut targets: Vec<Arc<ProjectAgent>> = if tags::is_reply(event) {
            tags::recipients(event)
                .iter()
                .filter_map(|pk| self.context.agent(pk))
                .collect()
        } else {
            let mentioned = leading_mention(&event.content)
                .and_then(|slug| self.context.agent_by_slug(slug));
            match mentioned {
                Some(agent) => vec![agent],
                None => vec![self.context.pm()],
            }
        };
        // Agents never trigger themselves, except through a phase hand-off
        // (delegate_phase routes the conversation back to its author as a
        // fresh turn in the new phase).
        if tags::phase(event).is_none() {
            targets.retain(|agent| agent.pubkey() != event.pubkey);
        }

        for agent in targets {
            self.spawn_turn(agent, event.clone(), root.clone());
        }
    }

    fn spawn_turn(&self, agent: Arc<ProjectAgent>, event: Event, root: String) {
        let token = self.cancel.child_token();
        let context = self.context.clone();
        let active = self.active_turns.clone();
        active.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let slug = agent.slug().to_string();
            let executor = AgentExecutor::new(context, agent);
            match executor.run_turn(&event, &root, token).await {
                Ok(outcome) => {
                    tracing::info!(
                        agent = %slug,
                        steps = outcome.steps,
                        replies = outcome.replies_published,
                        stop = ?outcome.stop,
                        "agent turn finished"
                    );
                }
                Err(e) => {
                    tracing::error!(agent = %slug, error = %e, "agent turn failed");
                }
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Stop the worker and flush every store.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(e) = self.dedup.lock().expect("dedup lock").flush() {
            tracing::error!(project = %self.context.doc.slug, error = %e, "dedup flush failed");
        }
        if let Err(e) = self.context.delegations.flush() {
            tracing::error!(project = %self.context.doc.slug, error = %e, "delegation flush failed");
        }
    }
}

/// `@slug` at the very start of the content.
fn leading_mention(content: &str) -> Option<&str> {
    let rest = content.strip_prefix('@')?;
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ':' || c == ',')
        .unwrap_or(rest.len());
    let slug = rest.get(..end)?;
    (!slug.is_empty()).then_some(slug)
}
