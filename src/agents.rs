//! Agent definitions and per-project registry

pub mod definition;
pub mod registry;

pub use definition::AgentDefinition;
pub use registry::{AgentError, AgentRegistry, ProjectAgent};
