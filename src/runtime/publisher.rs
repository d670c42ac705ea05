//! Outbound event construction and publishing
//!
//! Builds reply events the way the TENEX clients expect them (NIP-10
//! markers, project `a` tag, recipient `p` tags, optional `phase` tag),
//! signs them with the acting agent's keys, and serializes publishes per
//! (agent, conversation) so one agent's replies in one thread keep source
//! order. Streaming status and heartbeats are ephemeral one-shot sends.

use nostr::prelude::{
    Coordinate, Event, EventBuilder, EventId, Keys, Kind, PublicKey, Tag,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::agents::ProjectAgent;
use crate::conversation::Phase;
use crate::relay::{kinds, tags, EventBus, PublishError};

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("failed to sign event: {0}")]
    Sign(String),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// A conversation message to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub conversation_root: Option<EventId>,
    pub reply_to: Option<EventId>,
    pub recipients: Vec<PublicKey>,
    pub content: String,
    pub phase: Option<Phase>,
    pub extra_tags: Vec<Tag>,
}

pub struct AgentPublisher {
    bus: EventBus,
    coordinate: Coordinate,
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentPublisher {
    pub fn new(bus: EventBus, coordinate: Coordinate) -> Self {
        Self {
            bus,
            coordinate,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sign and publish a conversation message as `agent`.
    ///
    /// The per-(agent, conversation) lock is held across the send including
    /// its retries, which is what preserves source order.
    pub async fn publish(
        &self,
        agent: &ProjectAgent,
        message: OutboundMessage,
    ) -> Result<Event, OutboundError> {
        let event = self.prepare(agent, message)?;
        self.send_prepared(agent, event).await
    }

    /// Build and sign without sending. Callers that must know the event id
    /// before it hits the wire (delegation registration) prepare first,
    /// record, then send.
    pub fn prepare(
        &self,
        agent: &ProjectAgent,
        message: OutboundMessage,
    ) -> Result<Event, OutboundError> {
        self.build_message(&agent.keys, message)
    }

    /// Send an already-signed message, serialized per (agent, conversation).
    pub async fn send_prepared(
        &self,
        agent: &ProjectAgent,
        event: Event,
    ) -> Result<Event, OutboundError> {
        let conversation_key = tags::root_target(&event)
            .map_or_else(|| "-".to_string(), |id| id.to_hex());
        let lock = self.lock_for(agent.pubkey().to_hex(), conversation_key);
        let _serialized = lock.lock().await;
        self.bus.publish(event.clone()).await?;
        Ok(event)
    }

    fn build_message(
        &self,
        keys: &Keys,
        message: OutboundMessage,
    ) -> Result<Event, OutboundError> {
        let mut event_tags = vec![tags::project_ref(self.coordinate.clone())];
        if let Some(root) = message.conversation_root {
            event_tags.push(tags::e_root_upper(root));
            if message.reply_to != Some(root) {
                event_tags.push(tags::e_root(root));
            }
        }
        if let Some(reply_to) = message.reply_to {
            if message.conversation_root == Some(reply_to) {
                event_tags.push(tags::e_root(reply_to));
            } else {
                event_tags.push(tags::e_reply(reply_to));
            }
        }
        for recipient in &message.recipients {
            event_tags.push(Tag::public_key(*recipient));
        }
        if let Some(phase) = message.phase {
            event_tags.push(tags::phase_tag(phase));
        }
        event_tags.extend(message.extra_tags);

        EventBuilder::new(kinds::message(), message.content)
            .tags(event_tags)
            .sign_with_keys(keys)
            .map_err(|e| OutboundError::Sign(e.to_string()))
    }

    /// Best-effort streaming status: partial output for clients to render
    /// while a turn is in flight. Never retried, never queued.
    pub async fn publish_streaming_status(
        &self,
        agent: &ProjectAgent,
        conversation_root: Option<EventId>,
        partial: &str,
    ) {
        let mut event_tags = vec![tags::project_ref(self.coordinate.clone())];
        if let Some(root) = conversation_root {
            event_tags.push(tags::e_root_upper(root));
        }
        let event = EventBuilder::new(Kind::from(kinds::STREAMING_STATUS), partial)
            .tags(event_tags)
            .sign_with_keys(&agent.keys);
        match event {
            Ok(event) => {
                if let Err(e) = self.bus.publish_ephemeral(event).await {
                    tracing::debug!(error = %e, "streaming status dropped");
                }
            }
            Err(e) => tracing::debug!(error = %e, "streaming status sign failed"),
        }
    }

    /// Project status heartbeat, signed by the PM.
    pub async fn publish_heartbeat(&self, signer: &Keys, content: String) {
        let event = EventBuilder::new(Kind::from(kinds::PROJECT_STATUS), content)
            .tags(vec![tags::project_ref(self.coordinate.clone())])
            .sign_with_keys(signer);
        match event {
            Ok(event) => {
                if let Err(e) = self.bus.publish_ephemeral(event).await {
                    tracing::debug!(error = %e, "heartbeat dropped");
                }
            }
            Err(e) => tracing::debug!(error = %e, "heartbeat sign failed"),
        }
    }

    fn lock_for(&self, agent: String, conversation: String) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("publisher lock map");
        locks
            .entry((agent, conversation))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
