//! taskd-protocol: Shared IPC definitions for driving task sessions
//!
//! This crate defines the wire message schema spoken between a taskd host
//! process and its clients: the envelope ([`IpcMessage`]), the closed command
//! union ([`Command`]), the closed event union ([`TaskEvent`]), and the
//! newline-delimited JSON framing codec ([`IpcCodec`]).
//!
//! Every message is a single JSON object on one line. Commands flow from
//! clients to the server; events flow back, either broadcast to every
//! connection or relayed to one. Decoding fails closed: a payload that does
//! not match exactly one variant is rejected with the offending raw value.

pub mod codec;
pub mod messages;
pub mod types;

// Re-export main types at crate root
pub use codec::{decode_message, encode_message, CodecError, IpcCodec, MAX_FRAME_SIZE};
pub use messages::{Command, IpcMessage, IpcOrigin, TaskCommand, TaskEvent};
pub use types::{
    Ack, CommandResponse, ConfigurationValues, MessagePayload, SendMessagePayload,
    StartNewTaskPayload, TokenUsage, ToolUsage, ToolUsageEntry,
};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;
