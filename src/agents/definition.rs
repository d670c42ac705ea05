//! Agent definition files
//!
//! Definitions live globally at `{global_dir}/agents/{pubkey}.json`, keyed
//! by pubkey so projects can share one agent. The file carries the agent's
//! secret key: the daemon signs replies *as* the agent. Definition events
//! from the relay can refresh the prompt-facing fields but never the key.

use nostr::prelude::Event;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::relay::tags;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Hex pubkey; must match the signing key below.
    pub pubkey: String,
    /// Project-local handle used in `@slug` mentions.
    pub slug: String,
    pub name: String,
    /// One-line role description.
    pub role: String,
    /// Instruction text injected into the system prompt.
    pub instructions: String,
    /// Tool allow-list; names must exist in the tool registry.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Model preference overriding the routing table.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub is_pm: bool,
    /// Secret key (hex or nsec). Never published; never updated from events.
    pub secret_key: String,
}

impl AgentDefinition {
    pub fn path_for(agents_dir: &Path, pubkey_hex: &str) -> PathBuf {
        agents_dir.join(format!("{pubkey_hex}.json"))
    }

    /// Load one definition by pubkey.
    pub fn load(agents_dir: &Path, pubkey_hex: &str) -> Option<Self> {
        crate::store::load_json_or_quarantine(&Self::path_for(agents_dir, pubkey_hex))
    }

    /// Apply an agent-definition event: `d` = slug, `title` = display name,
    /// `role` tag, content = instructions, `tool` tags = allow-list.
    /// Key material is untouchable from the network.
    pub fn refresh_from_event(&mut self, event: &Event) {
        if event.pubkey.to_hex() != self.pubkey {
            return;
        }
        if let Some(slug) = tags::identifier(event) {
            self.slug = slug;
        }
        if let Some(name) = tags::title(event) {
            self.name = name;
        }
        if !event.content.is_empty() {
            self.instructions = event.content.clone();
        }
        let mut role = None;
        let mut tools = Vec::new();
        for tag in event.tags.iter() {
            let parts = tag.as_slice();
            match parts.first().map(String::as_str) {
                Some("role") => role = parts.get(1).cloned(),
                Some("tool") => {
                    if let Some(tool) = parts.get(1) {
                        tools.push(tool.clone());
                    }
                }
                _ => {}
            }
        }
        if let Some(role) = role {
            self.role = role;
        }
        if !tools.is_empty() {
            self.tools = tools;
        }
    }
}
