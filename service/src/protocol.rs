//! IPC protocol types for the card service.
//!
//! JSON-RPC-lite: one request object per line, one response object per
//! line. Errors raised by the field endpoints carry their ATT error code.

use bizcard_core::{FieldId, FieldPresence, SyncStats};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub id: RequestId,
    pub error: JsonRpcErrorBody,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// ATT error codes surfaced by the field endpoints.
pub const ERR_INVALID_OFFSET: i64 = 0x07;
pub const ERR_PREPARE_QUEUE_FULL: i64 = 0x09;
pub const ERR_UNLIKELY: i64 = 0x0E;
pub const ERR_INSUFFICIENT_ENCRYPTION: i64 = 0x0F;

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
    /// Whether the simulated link is encrypted (paired and bonded).
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub encrypted: bool,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// field.read
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldReadParams {
    pub field: FieldId,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldReadResult {
    pub field: FieldId,
    pub offset: usize,
    /// Raw bytes of the read window.
    pub data: Vec<u8>,
    /// The same window as lossy UTF-8.
    pub text: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// field.write / field.prepare
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of a write or prepared write. `data` wins over `text` when both
/// are given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldWriteParams {
    pub field: FieldId,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl FieldWriteParams {
    pub fn into_bytes(self) -> Vec<u8> {
        match (self.data, self.text) {
            (Some(data), _) => data,
            (None, Some(text)) => text.into_bytes(),
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Activated,
    EncodeFailed,
    ActivationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldWriteResult {
    pub field: FieldId,
    pub offset: usize,
    pub written: usize,
    pub persisted: bool,
    pub refresh: RefreshStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPrepareResult {
    pub queued: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// field.execute
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldExecuteParams {
    /// `false` cancels: the queue is discarded and nothing is written.
    #[serde(default = "default_commit")]
    pub commit: bool,
}

fn default_commit() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldExecuteResult {
    pub committed: bool,
    pub writes: Vec<FieldWriteResult>,
}

// ─────────────────────────────────────────────────────────────────────────────
// card.show
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldView {
    pub field: FieldId,
    pub label: String,
    pub value: String,
    pub max_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardShowResult {
    pub fields: Vec<FieldView>,
    /// Last encoded tag payload, hex.
    pub payload_hex: String,
    pub payload_len: usize,
    pub emulating: bool,
    pub emulation: EmulationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulationStatus {
    Stopped,
    Emulating,
    /// A stop failed; the previous payload may still be presented.
    Unknown,
}

// ─────────────────────────────────────────────────────────────────────────────
// tag.presence
// ─────────────────────────────────────────────────────────────────────────────

/// Reader field appeared or went away, as seen by the tag front end.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TagPresenceParams {
    pub presence: FieldPresence,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TagPresenceResult {
    pub presence: FieldPresence,
    /// Field indicator state after the event.
    pub indicator: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status / service.endpoints
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub uptime_s: u64,
    pub connections: usize,
    pub require_encryption: bool,
    pub stats: SyncStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointView {
    pub field: FieldId,
    pub uuid: String,
    pub properties: Vec<String>,
    pub permissions: Vec<String>,
    pub reliable_write: bool,
    pub max_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpointsResult {
    pub service_uuid: String,
    pub endpoints: Vec<EndpointView>,
}
