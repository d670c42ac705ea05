//! Relay client seam and publish retry policy

use async_trait::async_trait;
use nostr::prelude::{Event, EventId, Filter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Base delay for publish retries.
const PUBLISH_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Ceiling for publish retry delays.
const PUBLISH_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Total publish attempts before surfacing `PublishError`.
const PUBLISH_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("relay connection closed")]
    Closed,
}

/// Publish failure after retry exhaustion.
#[derive(Debug, Error)]
#[error("publish of {event_id} failed after {attempts} attempts: {last}")]
pub struct PublishError {
    pub event_id: EventId,
    pub attempts: u32,
    #[source]
    pub last: TransportError,
}

/// The transport the daemon assumes: something that can hold a filtered
/// subscription open and publish signed events. Reconnects are handled
/// below this trait; the subscription stream only ends on shutdown.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Open a subscription; inbound events arrive on the returned channel.
    async fn subscribe(
        &self,
        filters: Vec<Filter>,
    ) -> Result<mpsc::Receiver<Box<Event>>, TransportError>;

    /// Publish one signed event.
    async fn publish(&self, event: Event) -> Result<EventId, TransportError>;
}

/// Publish-side wrapper adding retry with exponential backoff.
///
/// Shared process-wide; publishes are not serialized here (per-signer
/// ordering is the publisher's job, not the transport's).
#[derive(Clone)]
pub struct EventBus {
    client: Arc<dyn RelayClient>,
}

impl EventBus {
    pub fn new(client: Arc<dyn RelayClient>) -> Self {
        Self { client }
    }

    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
    ) -> Result<mpsc::Receiver<Box<Event>>, TransportError> {
        self.client.subscribe(filters).await
    }

    /// One-shot publish for ephemeral events (streaming status, heartbeats)
    /// where a retry would outlive the data's usefulness.
    pub async fn publish_ephemeral(&self, event: Event) -> Result<EventId, TransportError> {
        self.client.publish(event).await
    }

    /// Publish with retry: base 500 ms, doubling, capped at 30 s, at most
    /// five attempts. Permanent failure surfaces to the caller.
    pub async fn publish(&self, event: Event) -> Result<EventId, PublishError> {
        let event_id = event.id;
        let mut delay = PUBLISH_BACKOFF_BASE;
        let mut last = None;

        for attempt in 1..=PUBLISH_MAX_ATTEMPTS {
            match self.client.publish(event.clone()).await {
                Ok(id) => {
                    if attempt > 1 {
                        tracing::info!(event_id = %id, attempt, "publish succeeded after retry");
                    }
                    return Ok(id);
                }
                Err(e) => {
                    tracing::warn!(
                        event_id = %event_id,
                        attempt,
                        error = %e,
                        "publish attempt failed"
                    );
                    last = Some(e);
                }
            }

            if attempt < PUBLISH_MAX_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(PUBLISH_BACKOFF_CAP);
            }
        }

        Err(PublishError {
            event_id,
            attempts: PUBLISH_MAX_ATTEMPTS,
            last: last.unwrap_or(TransportError::Closed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::prelude::{EventBuilder, Keys, Kind};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` publishes, then succeeds.
    struct FlakyRelay {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RelayClient for FlakyRelay {
        async fn subscribe(
            &self,
            _filters: Vec<Filter>,
        ) -> Result<mpsc::Receiver<Box<Event>>, TransportError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn publish(&self, event: Event) -> Result<EventId, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(TransportError::Publish("connection reset".into()))
            } else {
                Ok(event.id)
            }
        }
    }

    fn test_event() -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::from(1), "hello")
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let relay = Arc::new(FlakyRelay {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let bus = EventBus::new(relay.clone());

        let event = test_event();
        let id = bus.publish(event.clone()).await.unwrap();
        assert_eq!(id, event.id);
        assert_eq!(relay.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_publish_error() {
        let relay = Arc::new(FlakyRelay {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let bus = EventBus::new(relay.clone());

        let err = bus.publish(test_event()).await.unwrap_err();
        assert_eq!(err.attempts, PUBLISH_MAX_ATTEMPTS);
        assert_eq!(relay.calls.load(Ordering::SeqCst), PUBLISH_MAX_ATTEMPTS);
    }
}
