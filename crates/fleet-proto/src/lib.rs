//! Agent management protocol definitions
//!
//! This crate defines the messages exchanged between collector agents and the
//! control plane, the configuration document model pushed to agents, and the
//! frame codec used by the transports.

pub mod codec;
pub mod config;
pub mod messages;

pub use codec::{decode_frame, encode_frame, CodecError};
pub use config::{ConfigMap, ConfigValue, DocumentError, CONTENT_TYPE_JSON, CONTENT_TYPE_YAML};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
