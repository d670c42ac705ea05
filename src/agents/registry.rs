//! Per-project agent registry
//!
//! Built from a project definition's ordered agent references plus the
//! global definition files. The registry owns the signing keys and the
//! slug/pubkey maps, and decides who the Project Manager is.

use nostr::prelude::{Event, Keys, PublicKey};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::definition::AgentDefinition;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("project lists no agents")]
    NoAgents,
    #[error("no agent definition on disk for {0}")]
    MissingDefinition(String),
    #[error("invalid signing key for agent {0}")]
    InvalidKeys(String),
    #[error("signing key for agent {0} does not match its pubkey")]
    KeyMismatch(String),
    #[error("duplicate agent slug {0:?}")]
    DuplicateSlug(String),
    #[error("both {0} and {1} claim project manager")]
    AmbiguousPm(String, String),
    #[error("unknown recipient {0:?}")]
    UnknownRecipient(String),
}

/// One agent as loaded into a project: its definition plus parsed keys.
#[derive(Debug)]
pub struct ProjectAgent {
    pub definition: AgentDefinition,
    pub keys: Keys,
}

impl ProjectAgent {
    pub fn pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn slug(&self) -> &str {
        &self.definition.slug
    }
}

#[derive(Debug)]
pub struct AgentRegistry {
    agents_dir: PathBuf,
    by_pubkey: HashMap<String, Arc<ProjectAgent>>,
    by_slug: HashMap<String, String>,
    /// Ordered as the project definition lists them.
    order: Vec<String>,
    pm: String,
}

impl AgentRegistry {
    /// Load the registry for one project.
    ///
    /// `agent_refs` is the project definition's ordered agent list, each an
    /// optional slug override. The first agent is the PM unless exactly one
    /// definition carries `is_pm`; two claimants fail the load.
    pub fn load(
        agents_dir: &Path,
        agent_refs: &[(PublicKey, Option<String>)],
    ) -> Result<Self, AgentError> {
        if agent_refs.is_empty() {
            return Err(AgentError::NoAgents);
        }

        let mut by_pubkey = HashMap::new();
        let mut by_slug = HashMap::new();
        let mut order = Vec::new();
        let mut pm_claim: Option<String> = None;

        for (pubkey, slug_override) in agent_refs {
            let hex = pubkey.to_hex();
            let mut definition = AgentDefinition::load(agents_dir, &hex)
                .ok_or_else(|| AgentError::MissingDefinition(hex.clone()))?;
            if let Some(slug) = slug_override {
                definition.slug = slug.clone();
            }

            let keys = Keys::parse(&definition.secret_key)
                .map_err(|_| AgentError::InvalidKeys(hex.clone()))?;
            if keys.public_key() != *pubkey {
                return Err(AgentError::KeyMismatch(hex.clone()));
            }

            if definition.is_pm {
                if let Some(existing) = &pm_claim {
                    return Err(AgentError::AmbiguousPm(existing.clone(), hex.clone()));
                }
                pm_claim = Some(hex.clone());
            }

            if by_slug
                .insert(definition.slug.clone(), hex.clone())
                .is_some()
            {
                return Err(AgentError::DuplicateSlug(definition.slug.clone()));
            }

            order.push(hex.clone());
            by_pubkey.insert(hex, Arc::new(ProjectAgent { definition, keys }));
        }

        let pm = pm_claim.unwrap_or_else(|| order[0].clone());

        Ok(Self {
            agents_dir: agents_dir.to_path_buf(),
            by_pubkey,
            by_slug,
            order,
            pm,
        })
    }

    pub fn pm(&self) -> Arc<ProjectAgent> {
        self.by_pubkey[&self.pm].clone()
    }

    pub fn is_pm(&self, pubkey: &PublicKey) -> bool {
        self.pm == pubkey.to_hex()
    }

    pub fn get(&self, pubkey: &PublicKey) -> Option<Arc<ProjectAgent>> {
        self.by_pubkey.get(&pubkey.to_hex()).cloned()
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<Arc<ProjectAgent>> {
        self.by_slug
            .get(slug)
            .and_then(|hex| self.by_pubkey.get(hex))
            .cloned()
    }

    /// Project order (PM may or may not be first; PM selection already
    /// accounted for `is_pm`).
    pub fn agents(&self) -> impl Iterator<Item = &Arc<ProjectAgent>> {
        self.order.iter().filter_map(|hex| self.by_pubkey.get(hex))
    }

    /// Resolve a recipient string: pubkey forms (`npub1…` or hex) first,
    /// then project slugs.
    pub fn resolve_recipient(&self, recipient: &str) -> Result<PublicKey, AgentError> {
        if let Ok(pubkey) = PublicKey::parse(recipient) {
            return Ok(pubkey);
        }
        self.get_by_slug(recipient)
            .map(|agent| agent.pubkey())
            .ok_or_else(|| AgentError::UnknownRecipient(recipient.to_string()))
    }

    /// Apply an agent-definition event to the matching agent, if any.
    /// Updated definitions are written back to the global directory.
    pub fn refresh_from_event(&mut self, event: &Event) {
        let hex = event.pubkey.to_hex();
        let Some(agent) = self.by_pubkey.get(&hex) else {
            return;
        };

        let mut definition = agent.definition.clone();
        let old_slug = definition.slug.clone();
        definition.refresh_from_event(event);

        if definition.slug != old_slug {
            if self.by_slug.contains_key(&definition.slug) {
                tracing::warn!(
                    agent = %hex,
                    slug = %definition.slug,
                    "ignoring slug change that would collide"
                );
                definition.slug = old_slug;
            } else {
                self.by_slug.remove(&old_slug);
                self.by_slug.insert(definition.slug.clone(), hex.clone());
            }
        }

        if let Err(e) = crate::store::write_json_atomic(
            &AgentDefinition::path_for(&self.agents_dir, &hex),
            &definition,
        ) {
            tracing::error!(agent = %hex, error = %e, "failed to persist refreshed agent definition");
        }

        let keys = agent.keys.clone();
        self.by_pubkey
            .insert(hex, Arc::new(ProjectAgent { definition, keys }));
    }
}


#[cfg(test)]
mod tests {
    use super::testkit::install_agent;
    use super::*;

    #[test]
    fn first_agent_is_pm_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (_k1, pm) = install_agent(dir.path(), "pm", false, &[]);
        let (_k2, exec) = install_agent(dir.path(), "executor", false, &[]);

        let registry =
            AgentRegistry::load(dir.path(), &[(pm, None), (exec, None)]).unwrap();
        assert_eq!(registry.pm().pubkey(), pm);
        assert!(registry.is_pm(&pm));
        assert!(!registry.is_pm(&exec));
    }

    #[test]
    fn explicit_pm_flag_wins_over_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_k1, first) = install_agent(dir.path(), "first", false, &[]);
        let (_k2, boss) = install_agent(dir.path(), "boss", true, &[]);

        let registry =
            AgentRegistry::load(dir.path(), &[(first, None), (boss, None)]).unwrap();
        assert_eq!(registry.pm().pubkey(), boss);
    }

    #[test]
    fn two_pm_claims_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        let (_k1, a) = install_agent(dir.path(), "a", true, &[]);
        let (_k2, b) = install_agent(dir.path(), "b", true, &[]);

        let err = AgentRegistry::load(dir.path(), &[(a, None), (b, None)]).unwrap_err();
        assert!(matches!(err, AgentError::AmbiguousPm(_, _)));
    }

    #[test]
    fn duplicate_slug_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let (_k1, a) = install_agent(dir.path(), "same", false, &[]);
        let (_k2, b) = install_agent(dir.path(), "same", false, &[]);

        let err = AgentRegistry::load(dir.path(), &[(a, None), (b, None)]).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateSlug(_)));
    }

    #[test]
    fn missing_definition_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = Keys::generate().public_key();
        let err = AgentRegistry::load(dir.path(), &[(ghost, None)]).unwrap_err();
        assert!(matches!(err, AgentError::MissingDefinition(_)));
    }

    #[test]
    fn resolves_hex_npub_and_slug() {
        let dir = tempfile::tempdir().unwrap();
        let (_k1, pm) = install_agent(dir.path(), "pm", false, &[]);
        let (_k2, exec) = install_agent(dir.path(), "executor", false, &[]);
        let registry =
            AgentRegistry::load(dir.path(), &[(pm, None), (exec, None)]).unwrap();

        assert_eq!(registry.resolve_recipient(&exec.to_hex()).unwrap(), exec);
        assert_eq!(registry.resolve_recipient("executor").unwrap(), exec);

        // A foreign pubkey resolves even though it is not a project agent.
        let external = Keys::generate().public_key();
        assert_eq!(
            registry.resolve_recipient(&external.to_hex()).unwrap(),
            external
        );

        assert!(matches!(
            registry.resolve_recipient("nobody"),
            Err(AgentError::UnknownRecipient(_))
        ));
    }

    #[test]
    fn slug_override_from_project_definition() {
        let dir = tempfile::tempdir().unwrap();
        let (_k1, pm) = install_agent(dir.path(), "pm", false, &[]);
        let registry =
            AgentRegistry::load(dir.path(), &[(pm, Some("boss".to_string()))]).unwrap();
        assert!(registry.get_by_slug("boss").is_some());
        assert!(registry.get_by_slug("pm").is_none());
    }
}
