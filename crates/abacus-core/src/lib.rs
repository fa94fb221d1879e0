//! abacus-core: replicated message model, wire format, fragmentation,
//! and the datagram cipher. All other Abacus crates depend on this one.

pub mod config;
pub mod crypto;
pub mod fragment;
pub mod message;
pub mod wire;

pub use message::{Message, MessageKey, MessageType};
