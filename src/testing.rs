//! Test doubles and fixtures
//!
//! An in-memory relay implementing `RelayClient` (publishes loop back to
//! every matching subscriber, like a single well-behaved relay) and a
//! scripted LLM whose responses are dequeued per request. The harness wires
//! both into a real daemon over a temp state directory.

use async_trait::async_trait;
use nostr::prelude::{
    Event, EventBuilder, EventId, Filter, Keys, Kind, PublicKey, Tag,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::registry::testkit::install_agent;
use crate::config::{Config, LlmRouting};
use crate::daemon::Daemon;
use crate::llm::{
    LlmClient, LlmError, LlmRequest, LlmStream, ModelRegistry, StreamChunk, ToolCallChunk, Usage,
};
use crate::relay::{kinds, tags, EventBus, RelayClient, TransportError};

// ---------------------------------------------------------------------------
// In-memory relay
// ---------------------------------------------------------------------------

pub struct MemoryRelay {
    subscribers: Mutex<Vec<(Vec<Filter>, mpsc::Sender<Box<Event>>)>>,
    published: Mutex<Vec<Event>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Everything published so far, in publish order.
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().expect("published lock").clone()
    }

    pub fn published_of_kind(&self, kind: u16) -> Vec<Event> {
        self.published()
            .into_iter()
            .filter(|e| e.kind.as_u16() == kind)
            .collect()
    }

    /// Inject an event as if a remote client had published it.
    pub async fn inject(&self, event: Event) {
        self.deliver(&event).await;
    }

    async fn deliver(&self, event: &Event) {
        let targets: Vec<mpsc::Sender<Box<Event>>> = {
            let subscribers = self.subscribers.lock().expect("subscribers lock");
            subscribers
                .iter()
                .filter(|(filters, _)| filters.iter().any(|f| kind_matches(f, event)))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(Box::new(event.clone())).await;
        }
    }
}

fn kind_matches(filter: &Filter, event: &Event) -> bool {
    filter
        .kinds
        .as_ref()
        .is_none_or(|kinds| kinds.contains(&event.kind))
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn subscribe(
        &self,
        filters: Vec<Filter>,
    ) -> Result<mpsc::Receiver<Box<Event>>, TransportError> {
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .push((filters, tx));
        Ok(rx)
    }

    async fn publish(&self, event: Event) -> Result<EventId, TransportError> {
        self.published
            .lock()
            .expect("published lock")
            .push(event.clone());
        let id = event.id;
        self.deliver(&event).await;
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

/// Responses are scripts of chunks consumed one per `stream` call, in call
/// order. An empty queue yields a bare finish.
#[derive(Debug)]
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_script(&self, chunks: Vec<StreamChunk>) {
        self.scripts.lock().expect("scripts lock").push_back(chunks);
    }

    /// Script a plain text turn.
    pub fn push_text(&self, text: &str) {
        self.push_script(vec![
            StreamChunk::TextDelta(text.to_string()),
            StreamChunk::Finish(Usage::default()),
        ]);
    }

    /// Script a turn that calls one tool.
    pub fn push_tool_call(&self, name: &str, input: serde_json::Value) {
        self.push_script(vec![
            StreamChunk::ToolCall(ToolCallChunk {
                id: format!("call-{name}"),
                name: name.to_string(),
                input,
            }),
            StreamChunk::Finish(Usage::default()),
        ]);
    }

    pub fn requests_seen(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn stream(
        &self,
        request: LlmRequest,
        _cancel: CancellationToken,
    ) -> Result<LlmStream, LlmError> {
        self.requests.lock().expect("requests lock").push(request);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| vec![StreamChunk::Finish(Usage::default())]);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in script {
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Daemon harness
// ---------------------------------------------------------------------------

pub struct Harness {
    _dir: tempfile::TempDir,
    pub config: Config,
    pub models: Arc<ModelRegistry>,
    pub relay: Arc<MemoryRelay>,
    pub llm: Arc<ScriptedLlm>,
    pub user: Keys,
    pub pm: (Keys, PublicKey),
    pub planner: (Keys, PublicKey),
    pub executor: (Keys, PublicKey),
    pub project_event: Event,
    pub cancel: CancellationToken,
    daemon_task: tokio::task::JoinHandle<()>,
}

pub const PROJECT_SLUG: &str = "acme";

impl Harness {
    /// Start a daemon over a temp state dir with three agents (pm, planner,
    /// executor) and announce the project definition.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let agents_dir = dir.path().join("agents");
        let engine_tools = [
            "delegate",
            "delegate_external",
            "delegate_followup",
            "delegate_phase",
            "switch_phase",
            "complete",
        ];
        let pm = install_agent(&agents_dir, "pm", false, &engine_tools);
        let planner = install_agent(&agents_dir, "planner", false, &engine_tools);
        let executor = install_agent(&agents_dir, "executor", false, &engine_tools);

        let config = Config {
            relays: vec!["wss://test.invalid".to_string()],
            state_dir: dir.path().join("projects"),
            global_dir: dir.path().to_path_buf(),
            idle_timeout: Duration::from_secs(1800),
            max_steps: 20,
            delegation_timeout: Duration::from_secs(5),
            max_conversation_tokens: 64_000,
            llm: LlmRouting::default(),
            llm_api_key: None,
        };

        let relay = Arc::new(MemoryRelay::new());
        let llm = Arc::new(ScriptedLlm::new());
        let models =
            Arc::new(ModelRegistry::new(config.llm.clone()).with_client(llm.clone()));

        let owner = Keys::generate();
        let project_event = EventBuilder::new(Kind::from(kinds::PROJECT), "")
            .tags(vec![
                Tag::identifier(PROJECT_SLUG),
                agent_ref_tag(&pm.1),
                agent_ref_tag(&planner.1),
                agent_ref_tag(&executor.1),
            ])
            .sign_with_keys(&owner)
            .expect("sign project");

        let (cancel, daemon_task) =
            spawn_daemon(config.clone(), relay.clone(), models.clone()).await;

        let harness = Self {
            _dir: dir,
            config,
            models,
            relay,
            llm,
            user: Keys::generate(),
            pm,
            planner,
            executor,
            project_event: project_event.clone(),
            cancel,
            daemon_task,
        };

        harness.relay.inject(project_event).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness
    }

    /// Stop the daemon (flushing state) and boot a fresh one over the same
    /// state directory and relay. The project definition is replayed the
    /// way a real relay replays stored events to a new subscription.
    pub async fn reboot(&mut self) {
        self.cancel.cancel();
        let task = std::mem::replace(&mut self.daemon_task, tokio::spawn(async {}));
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;

        let (cancel, daemon_task) = spawn_daemon(
            self.config.clone(),
            self.relay.clone(),
            self.models.clone(),
        )
        .await;
        self.cancel = cancel;
        self.daemon_task = daemon_task;

        self.relay.inject(self.project_event.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Publish a new conversation root from the user, `a`-tagged to the
    /// project.
    pub async fn user_root(&self, content: &str, p_tags: &[PublicKey]) -> Event {
        let mut event_tags = vec![self.project_tag()];
        for pk in p_tags {
            event_tags.push(Tag::public_key(*pk));
        }
        let event = EventBuilder::new(kinds::message(), content)
            .tags(event_tags)
            .sign_with_keys(&self.user)
            .expect("sign root");
        self.relay.inject(event.clone()).await;
        event
    }

    /// Publish a reply from the user into an existing conversation.
    pub async fn user_reply(
        &self,
        root: &Event,
        content: &str,
        p_tags: &[PublicKey],
    ) -> Event {
        let mut event_tags = vec![self.project_tag(), tags::e_root(root.id)];
        for pk in p_tags {
            event_tags.push(Tag::public_key(*pk));
        }
        let event = EventBuilder::new(kinds::message(), content)
            .tags(event_tags)
            .sign_with_keys(&self.user)
            .expect("sign reply");
        self.relay.inject(event.clone()).await;
        event
    }

    pub fn project_tag(&self) -> Tag {
        let coordinate = nostr::prelude::Coordinate::parse(&format!(
            "{}:{}:{PROJECT_SLUG}",
            kinds::PROJECT,
            self.project_event.pubkey.to_hex()
        ))
        .expect("coordinate");
        tags::project_ref(coordinate)
    }

    /// Messages published by a given agent, oldest first.
    pub fn replies_from(&self, author: &PublicKey) -> Vec<Event> {
        self.relay
            .published_of_kind(kinds::MESSAGE)
            .into_iter()
            .filter(|e| e.pubkey == *author)
            .collect()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.daemon_task).await;
    }
}

fn agent_ref_tag(pubkey: &PublicKey) -> Tag {
    Tag::custom(
        nostr::prelude::TagKind::Custom(std::borrow::Cow::Borrowed("agent")),
        vec![pubkey.to_hex()],
    )
}

async fn spawn_daemon(
    config: Config,
    relay: Arc<MemoryRelay>,
    models: Arc<ModelRegistry>,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let daemon = Daemon::new(config, EventBus::new(relay), models);
    let cancel = daemon.cancel_token();
    let task = tokio::spawn(async move {
        if let Err(e) = daemon.run().await {
            panic!("daemon failed: {e}");
        }
    });
    // Let the daemon subscribe before anything is injected.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (cancel, task)
}

/// Poll until `predicate` yields `Some`, panicking after the deadline.
pub async fn wait_for<T>(what: &str, mut predicate: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = predicate() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
