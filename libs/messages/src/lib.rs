//! # dea-messages
//!
//! Bus topics and payloads for the droplet execution agent (DEA).
//!
//! ## Design Principles
//!
//! - Payloads are plain JSON objects; field names follow the wire format used
//!   by the cloud controller, router and health manager
//! - Optional selectors deserialize to `None` when absent, never to empty sets
//! - Nothing in this crate performs I/O
//!
//! ## Message Families
//!
//! - Commands addressed to an agent (`dea.{id}.start`, `dea.stop`, `dea.update`)
//! - Queries answered per instance (`dea.find.droplet`, `droplet.status`)
//! - Agent-level queries (`dea.status`, `dea.discover`)
//! - Events published by the agent (`dea.heartbeat`, `droplet.exited`,
//!   `router.register`, `router.unregister`, `dea.start`)

mod error;
mod types;

pub mod topics;

pub use error::MessageError;
pub use types::*;

/// Decode a JSON payload into a message type.
pub fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, MessageError> {
    serde_json::from_slice(payload).map_err(|e| MessageError::InvalidPayload(e.to_string()))
}

/// Encode a message type as a JSON payload.
pub fn encode<T: serde::Serialize>(message: &T) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(message).map_err(MessageError::from)
}
