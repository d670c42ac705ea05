//! Production relay adapter over the `nostr-sdk` relay pool
//!
//! The pool owns reconnection; this adapter only bridges its notification
//! stream onto the [`RelayClient`] channel contract. Events published here
//! are already signed by the acting agent, so the pool client carries no
//! signer of its own.

use async_trait::async_trait;
use nostr::prelude::{Event, EventId, Filter};
use nostr_sdk::{Client, RelayPoolNotification};
use tokio::sync::mpsc;

use super::client::{RelayClient, TransportError};

const INBOUND_BUFFER: usize = 1024;

pub struct SdkRelayClient {
    client: Client,
}

impl SdkRelayClient {
    /// Connect the pool to the configured relays.
    pub async fn connect(relays: &[String]) -> Result<Self, TransportError> {
        let client = Client::default();
        for url in relays {
            client
                .add_relay(url.as_str())
                .await
                .map_err(|e| TransportError::Subscribe(format!("add relay {url}: {e}")))?;
        }
        client.connect().await;
        Ok(Self { client })
    }
}

#[async_trait]
impl RelayClient for SdkRelayClient {
    async fn subscribe(
        &self,
        filters: Vec<Filter>,
    ) -> Result<mpsc::Receiver<Box<Event>>, TransportError> {
        for filter in filters {
            self.client
                .subscribe(filter, None)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let mut notifications = self.client.notifications();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event { event, .. }) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "relay notification stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::info!("relay notification stream closed");
        });

        Ok(rx)
    }

    async fn publish(&self, event: Event) -> Result<EventId, TransportError> {
        let output = self
            .client
            .send_event(&event)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(*output.id())
    }
}
