//! TENEX daemon
//!
//! Listens on the relay network, routes events to per-project runtimes,
//! and drives multi-agent conversations.

mod agents;
mod config;
mod conversation;
mod daemon;
mod dedup;
mod delegation;
mod llm;
mod prompt;
mod relay;
mod router;
mod runtime;
mod store;
#[cfg(test)]
mod testing;
mod tools;

use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use daemon::Daemon;
use llm::ModelRegistry;
use relay::sdk::SdkRelayClient;
use relay::EventBus;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenexd=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    tracing::info!(
        relays = ?config.relays,
        state_dir = %config.state_dir.display(),
        "starting tenex daemon"
    );

    let relay = match SdkRelayClient::connect(&config.relays).await {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to relays");
            return ExitCode::from(1);
        }
    };

    let models = Arc::new(ModelRegistry::new(config.llm.clone()));
    if !models.has_provider() {
        if config.llm_api_key.is_some() {
            tracing::warn!(
                "TENEX_LLM_API_KEY is set but no provider implementation is linked; \
                 agent turns will fail until one is wired in"
            );
        } else {
            tracing::warn!(
                "no LLM provider configured; agent turns will fail until one is wired in"
            );
        }
    }

    let daemon = Daemon::new(config, EventBus::new(Arc::new(relay)), models);
    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon failed");
            ExitCode::from(1)
        }
    }
}
