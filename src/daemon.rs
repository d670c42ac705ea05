//! Daemon lifecycle
//!
//! Owns the project runtime map, the consolidated relay subscription, the
//! idle reaper and the status heartbeat. Runtime-level failures are logged
//! and contained; only subscription setup and configuration problems exit
//! the process.

use futures::StreamExt;
use nostr::prelude::{Filter, Kind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::llm::ModelRegistry;
use crate::relay::{kinds, EventBus, TransportError};
use crate::router::EventRouter;
use crate::runtime::{ProjectDoc, ProjectRuntime};

/// Idle runtimes are checked on this cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Status heartbeat cadence per active project.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Executors get this long to flush replies at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A slot in the runtime map. Failed runtimes stay failed so the router
/// stops retrying a broken project on every event.
pub enum RuntimeSlot {
    Ready(Arc<ProjectRuntime>),
    Failed,
}

/// State shared between the daemon loop and the router.
pub struct DaemonInner {
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub models: Arc<ModelRegistry>,
    pub cancel: CancellationToken,
    pub runtimes: RwLock<HashMap<String, RuntimeSlot>>,
    pub projects: RwLock<HashMap<String, ProjectDoc>>,
    /// agent pubkey hex -> project coordinate, for `p`-tag resolution.
    pub agent_index: RwLock<HashMap<String, String>>,
}

pub struct Daemon {
    inner: Arc<DaemonInner>,
    router: EventRouter,
}

impl Daemon {
    pub fn new(config: Config, bus: EventBus, models: Arc<ModelRegistry>) -> Self {
        let inner = Arc::new(DaemonInner {
            config: Arc::new(config),
            bus,
            models,
            cancel: CancellationToken::new(),
            runtimes: RwLock::new(HashMap::new()),
            projects: RwLock::new(HashMap::new()),
            agent_index: RwLock::new(HashMap::new()),
        });
        let router = EventRouter::new(inner.clone());
        Self { inner, router }
    }

    /// Handle for tests and signal wiring.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// The consolidated subscription: everything the daemon consumes, one
    /// filter set.
    fn filters() -> Vec<Filter> {
        vec![Filter::new().kinds(
            [
                kinds::MESSAGE,
                kinds::CONVERSATION_METADATA,
                kinds::AGENT_DEFINITION,
                kinds::BOOT_REQUEST,
                kinds::PROJECT,
            ]
            .into_iter()
            .map(Kind::from),
        )]
    }

    /// Run until cancelled (or SIGINT). Clean shutdown cancels in-flight
    /// executors with a grace window and flushes every store.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let mut inbound =
            ReceiverStream::new(self.inner.bus.subscribe(Self::filters()).await?);
        tracing::info!("daemon subscribed; routing events");

        let reaper = tokio::spawn(reap_loop(self.inner.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(self.inner.clone()));

        loop {
            tokio::select! {
                event = inbound.next() => match event {
                    Some(event) => self.router.route(&event),
                    None => {
                        tracing::warn!("inbound stream ended");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received; shutting down");
                    break;
                }
                () = self.inner.cancel.cancelled() => break,
            }
        }

        self.shutdown().await;
        reaper.abort();
        heartbeat.abort();
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.cancel.cancel();

        // Give in-flight turns a grace window to flush their replies.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            let active: usize = {
                let runtimes = self.inner.runtimes.read().expect("runtimes lock");
                runtimes
                    .values()
                    .map(|slot| match slot {
                        RuntimeSlot::Ready(rt) => rt.active_turns(),
                        RuntimeSlot::Failed => 0,
                    })
                    .sum()
            };
            if active == 0 || tokio::time::Instant::now() >= deadline {
                if active > 0 {
                    tracing::warn!(active, "shutdown grace expired with turns still running");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let runtimes = self.inner.runtimes.read().expect("runtimes lock");
        for slot in runtimes.values() {
            if let RuntimeSlot::Ready(runtime) = slot {
                runtime.shutdown();
            }
        }
        tracing::info!("daemon stopped");
    }
}

/// Tear down runtimes that have been idle past their timeout.
async fn reap_loop(state: Arc<DaemonInner>) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(REAP_INTERVAL) => {}
            () = state.cancel.cancelled() => return,
        }

        let idle: Vec<(String, Arc<ProjectRuntime>)> = {
            let runtimes = state.runtimes.read().expect("runtimes lock");
            runtimes
                .iter()
                .filter_map(|(coordinate, slot)| match slot {
                    RuntimeSlot::Ready(rt) if rt.is_idle() => {
                        Some((coordinate.clone(), rt.clone()))
                    }
                    _ => None,
                })
                .collect()
        };

        for (coordinate, runtime) in idle {
            tracing::info!(project = %coordinate, "reaping idle runtime");
            runtime.shutdown();
            state
                .runtimes
                .write()
                .expect("runtimes lock")
                .remove(&coordinate);
        }
    }
}

/// Ephemeral status per active project: which agents are loaded and what
/// tools they carry.
async fn heartbeat_loop(state: Arc<DaemonInner>) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            () = state.cancel.cancelled() => return,
        }

        let ready: Vec<Arc<ProjectRuntime>> = {
            let runtimes = state.runtimes.read().expect("runtimes lock");
            runtimes
                .values()
                .filter_map(|slot| match slot {
                    RuntimeSlot::Ready(rt) => Some(rt.clone()),
                    RuntimeSlot::Failed => None,
                })
                .collect()
        };

        for runtime in ready {
            let context = &runtime.context;
            let labels = context.agent_labels();
            let agents: Vec<serde_json::Value> = labels
                .iter()
                .map(|(pubkey, slug)| {
                    let tools = context
                        .agent_by_slug(slug)
                        .map(|a| a.definition.tools.clone())
                        .unwrap_or_default();
                    serde_json::json!({
                        "pubkey": pubkey,
                        "slug": slug,
                        "tools": tools,
                    })
                })
                .collect();
            let content = serde_json::json!({ "agents": agents }).to_string();

            let pm = context.pm();
            context
                .publisher
                .publish_heartbeat(&pm.keys, content)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Phase;
    use crate::llm::{ContentBlock, MessageRole, StreamChunk, ToolCallChunk, Usage};
    use crate::relay::tags;
    use crate::testing::{wait_for, Harness};
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn s1_new_conversation_routes_to_pm() {
        let h = Harness::start().await;
        h.llm.push_text("hello back");

        let root = h.user_root("hello", &[]).await;
        let reply = wait_for("pm reply", || {
            h.replies_from(&h.pm.1).into_iter().next()
        })
        .await;

        assert_eq!(reply.content, "hello back");
        assert_eq!(tags::reply_target(&reply), Some(root.id));
        assert_eq!(tags::root_target(&reply), Some(root.id));
        // Phase is still CHAT: no transition happened, so no phase tag.
        assert_eq!(tags::phase(&reply), None);

        // Exactly one agent turn fired.
        assert_eq!(h.llm.requests_seen(), 1);
        assert!(h.replies_from(&h.planner.1).is_empty());
        assert!(h.replies_from(&h.executor.1).is_empty());

        // Streaming status was published while the turn ran.
        assert!(!h
            .relay
            .published_of_kind(crate::relay::kinds::STREAMING_STATUS)
            .is_empty());

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn s2_mention_bypasses_pm() {
        let h = Harness::start().await;
        h.llm.push_text("on it");

        h.user_root("@executor fix bug", &[h.executor.1]).await;
        let reply = wait_for("executor reply", || {
            h.replies_from(&h.executor.1).into_iter().next()
        })
        .await;

        assert_eq!(reply.content, "on it");
        assert!(h.replies_from(&h.pm.1).is_empty(), "PM must not be invoked");
        assert_eq!(h.llm.requests_seen(), 1, "exactly one agent turn");

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn s3_delegation_completes_with_both_results() {
        let h = Harness::start().await;
        // PM delegates, both specialists answer, PM wraps up.
        h.llm.push_tool_call(
            "delegate",
            json!({ "recipients": ["planner", "executor"], "prompt": "do X" }),
        );
        h.llm.push_text("delegated work done");
        h.llm.push_text("delegated work done");
        h.llm.push_text("both finished; summarizing");

        h.user_root("please coordinate this", &[]).await;

        let final_reply = wait_for("pm summary", || {
            h.replies_from(&h.pm.1)
                .into_iter()
                .find(|e| e.content == "both finished; summarizing")
        })
        .await;
        assert_eq!(final_reply.pubkey, h.pm.1);

        // Two outbound request events, one per recipient.
        let requests: Vec<_> = h
            .replies_from(&h.pm.1)
            .into_iter()
            .filter(|e| e.content == "do X")
            .collect();
        assert_eq!(requests.len(), 2);
        let mut request_recipients: Vec<_> = requests
            .iter()
            .flat_map(tags::recipients)
            .collect();
        request_recipients.sort();
        let mut expected = vec![h.planner.1, h.executor.1];
        expected.sort();
        assert_eq!(request_recipients, expected);

        // The PM resumed with a result list of length 2 preserving
        // recipient identity: its final request carries both results.
        let requests_seen = h.llm.requests();
        let resume = requests_seen.last().unwrap();
        let tool_result = resume
            .messages
            .iter()
            .rev()
            .find_map(|m| {
                m.content.iter().find_map(|b| match b {
                    ContentBlock::ToolResult { content, .. } => Some(content.clone()),
                    _ => None,
                })
            })
            .expect("resume request carries the delegation results");
        assert!(tool_result.contains("2/2 replied"));
        assert!(tool_result.contains("planner"));
        assert!(tool_result.contains("executor"));

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn s4_self_delegation_rejected() {
        let h = Harness::start().await;
        h.llm.push_tool_call(
            "delegate",
            json!({ "recipients": ["executor"], "prompt": "do it yourself" }),
        );
        h.llm.push_text("understood, I cannot delegate to myself");

        h.user_root("@executor handle this", &[h.executor.1]).await;

        wait_for("executor acknowledgement", || {
            h.replies_from(&h.executor.1)
                .into_iter()
                .find(|e| e.content.contains("cannot delegate"))
        })
        .await;

        // The error surfaced to the model on the next step.
        let requests = h.llm.requests();
        let error_result = requests
            .last()
            .unwrap()
            .messages
            .iter()
            .find_map(|m| {
                m.content.iter().find_map(|b| match b {
                    ContentBlock::ToolResult {
                        content, is_error, ..
                    } if *is_error => Some(content.clone()),
                    _ => None,
                })
            })
            .expect("self-delegation error fed back to the model");
        assert!(error_result.contains("SelfDelegationError"));

        // No outbound request event was sent to itself.
        let self_addressed = h
            .replies_from(&h.executor.1)
            .into_iter()
            .filter(|e| tags::recipients(e).contains(&h.executor.1))
            .count();
        assert_eq!(self_addressed, 0);

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn s5_phase_transition_tags_next_reply() {
        let h = Harness::start().await;
        h.llm.push_tool_call(
            "switch_phase",
            json!({ "phase": "EXECUTE", "reason": "implementing" }),
        );
        h.llm.push_text("moving to execution");

        let root = h.user_root("let's build it", &[]).await;
        let reply = wait_for("pm reply after transition", || {
            h.replies_from(&h.pm.1)
                .into_iter()
                .find(|e| e.content == "moving to execution")
        })
        .await;
        assert_eq!(tags::phase(&reply), Some(Phase::Execute));

        // A later turn in the same conversation gets EXECUTE instructions.
        h.llm.push_text("ack");
        h.user_reply(&root, "status?", &[h.pm.1]).await;
        wait_for("second pm reply", || {
            h.replies_from(&h.pm.1)
                .into_iter()
                .find(|e| e.content == "ack")
        })
        .await;

        let last = h.llm.requests();
        let system = &last.last().unwrap().system;
        assert!(system.contains("EXECUTE"), "phase instructions missing: {system}");

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn s6_dedup_survives_restart() {
        let mut h = Harness::start().await;
        h.llm.push_text("first answer");

        let root = h.user_root("hello", &[]).await;
        wait_for("pm reply", || h.replies_from(&h.pm.1).into_iter().next()).await;
        let requests_before = h.llm.requests_seen();

        h.reboot().await;

        // Replay the already-processed root.
        h.relay.inject(root).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            h.llm.requests_seen(),
            requests_before,
            "replayed event must not reach any agent"
        );
        assert_eq!(h.replies_from(&h.pm.1).len(), 1);

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn text_is_published_before_tool_effects() {
        let h = Harness::start().await;
        h.llm.push_script(vec![
            StreamChunk::TextDelta("let me wrap up".to_string()),
            StreamChunk::ToolCall(ToolCallChunk {
                id: "call-1".to_string(),
                name: "complete".to_string(),
                input: json!({ "summary": "all done" }),
            }),
            StreamChunk::Finish(Usage::default()),
        ]);

        h.user_root("finish the task", &[]).await;
        wait_for("both replies", || {
            let replies = h.replies_from(&h.pm.1);
            (replies.len() == 2).then_some(())
        })
        .await;

        let replies = h.replies_from(&h.pm.1);
        assert_eq!(replies[0].content, "let me wrap up", "text flushed first");
        assert_eq!(replies[1].content, "all done", "tool effect second");

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delegate_phase_returns_conversation_to_pm() {
        let h = Harness::start().await;
        h.llm.push_tool_call(
            "delegate_phase",
            json!({ "phase": "PLAN", "prompt": "draft the plan" }),
        );
        // The hand-off routes back to the PM as a fresh turn in PLAN.
        h.llm.push_text("here is the plan");

        h.user_root("we should plan this", &[]).await;
        wait_for("plan reply", || {
            h.replies_from(&h.pm.1)
                .into_iter()
                .find(|e| e.content == "here is the plan")
        })
        .await;

        let requests = h.llm.requests();
        let system = &requests.last().unwrap().system;
        assert!(system.contains("PLAN"), "hand-off turn not in PLAN: {system}");

        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reply_roles_alternate_for_the_viewer() {
        let h = Harness::start().await;
        h.llm.push_text("first");
        h.llm.push_text("second");

        let root = h.user_root("question one", &[]).await;
        wait_for("first reply", || {
            h.replies_from(&h.pm.1).into_iter().next()
        })
        .await;

        h.user_reply(&root, "question two", &[h.pm.1]).await;
        wait_for("second reply", || {
            h.replies_from(&h.pm.1)
                .into_iter()
                .find(|e| e.content == "second")
        })
        .await;

        // The second turn saw: user root, own reply, user follow-up.
        let requests = h.llm.requests();
        let roles: Vec<MessageRole> = requests
            .last()
            .unwrap()
            .messages
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::User]
        );

        h.shutdown().await;
    }
}
