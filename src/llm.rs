//! LLM provider seam
//!
//! The engine assumes a streaming text + tool-call API behind [`LlmClient`];
//! concrete providers live outside this crate. The registry resolves a
//! routing role (plus any per-agent preference) to a model string and the
//! configured provider.

pub mod error;
pub mod registry;
pub mod types;

pub use error::{LlmError, LlmErrorKind};
pub use registry::ModelRegistry;
pub use types::{
    ChatMessage, ContentBlock, LlmClient, LlmRequest, LlmStream, MessageRole, StreamChunk,
    ToolCallChunk, ToolDefinition, Usage,
};
