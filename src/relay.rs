//! Relay-facing event plumbing
//!
//! The daemon speaks to the relay network through the [`RelayClient`] trait;
//! the production adapter wraps the `nostr-sdk` relay pool, tests use an
//! in-memory implementation. Everything above this module deals in signed
//! `nostr::Event` values and never touches the wire.

pub mod client;
pub mod kinds;
pub mod sdk;
pub mod tags;

pub use client::{EventBus, PublishError, RelayClient, TransportError};
