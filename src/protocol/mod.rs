//! Wire-level building blocks of the Sendspin protocol.
//!
//! JSON control envelopes travel as WebSocket text messages, media payloads
//! as binary messages with a fixed 9-byte header. This module holds both
//! codecs plus the shared enumerations and payload contracts.

pub mod frame;
pub mod messages;
pub mod types;

pub use frame::{BinaryHeader, FrameType, HEADER_LEN};
pub use messages::{ClientMessage, ServerMessage};
pub use types::{
    Codec, ConnectionReason, Family, GoodbyeReason, Metadata, MetadataSnapshot, PlaybackState,
    PlayerFormat, Role, Undefined,
};

/// Protocol version carried in both hello payloads. Mismatches close 1008.
pub const PROTOCOL_VERSION: u32 = 1;
