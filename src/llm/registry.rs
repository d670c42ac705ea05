//! Model routing
//!
//! Maps a routing role (`agents`, `analyze`, `orchestrator`) and an optional
//! per-agent model preference to a model string, and hands out the
//! configured provider. A registry without a provider is valid: the daemon
//! starts, and every turn fails with an auth error that surfaces as a reply
//! event instead of a crash.

use std::sync::Arc;

use crate::config::LlmRouting;

use super::{LlmClient, LlmError};

pub struct ModelRegistry {
    routing: LlmRouting,
    client: Option<Arc<dyn LlmClient>>,
}

impl ModelRegistry {
    pub fn new(routing: LlmRouting) -> Self {
        Self {
            routing,
            client: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn has_provider(&self) -> bool {
        self.client.is_some()
    }

    /// Model string for an agent turn: the agent's preference if it names
    /// one, else the routing table's model for the role.
    pub fn resolve_model(&self, role: &str, preference: Option<&str>) -> String {
        preference.map_or_else(|| self.routing.model_for(role).to_string(), String::from)
    }

    /// The configured provider, or an auth error the executor reports into
    /// the turn.
    pub fn provider(&self) -> Result<Arc<dyn LlmClient>, LlmError> {
        self.client
            .clone()
            .ok_or_else(|| LlmError::auth("no LLM provider configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_overrides_routing() {
        let registry = ModelRegistry::new(LlmRouting::default());
        assert_eq!(
            registry.resolve_model("agents", Some("custom-model")),
            "custom-model"
        );
        assert_eq!(
            registry.resolve_model("analyze", None),
            LlmRouting::default().analyze
        );
    }

    #[test]
    fn missing_provider_is_auth_error() {
        let registry = ModelRegistry::new(LlmRouting::default());
        assert!(!registry.has_provider());
        let err = registry.provider().unwrap_err();
        assert_eq!(err.kind, crate::llm::LlmErrorKind::Auth);
    }
}
