//! Payload types shared by commands and events

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open configuration record.
///
/// The configuration shape is owned by the host's settings collaborator, not
/// by this protocol; it travels as an open JSON object and is passed through
/// unvalidated.
pub type ConfigurationValues = serde_json::Map<String, Value>;

/// Handshake payload sent by the server immediately after accepting a
/// connection. Hands the client its assigned identity and the host process
/// identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub client_id: String,
    pub pid: u32,
    pub ppid: u32,
}

/// Token accounting summary for a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cache_writes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cache_reads: Option<u64>,
    pub total_cost: f64,
    pub context_tokens: u64,
}

/// Per-tool invocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsageEntry {
    pub attempts: u64,
    pub failures: u64,
}

/// Tool name -> invocation counters
pub type ToolUsage = BTreeMap<String, ToolUsageEntry>;

/// Payload of the `Message` event.
///
/// The message body itself is engine-owned and travels as opaque JSON;
/// `partial` marks streaming chunks that will be superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub task_id: String,
    pub message: Value,
    #[serde(default)]
    pub partial: bool,
}

/// Payload of the `CommandResponse` event.
///
/// Carries the result of a synchronous query back to the client that issued
/// it, echoing the command name and the client's correlation id (empty when
/// the client sent none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command_name: String,
    pub request_id: String,
    pub payload: Value,
}

/// Payload of the `StartNewTask` command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartNewTaskPayload {
    #[serde(default)]
    pub configuration: ConfigurationValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tab: Option<bool>,
}

/// Payload of the `SendMessage` command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}
