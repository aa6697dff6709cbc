use chrono::{DateTime, Utc};
use nexus_core::types::{AccountId, BranchId, ConversationId, Domain, RequestId};
use serde::{Deserialize, Serialize};

/// Persisted row for an inbound request (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub domain: Domain,
    pub account_id: AccountId,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
    pub conversation_id: ConversationId,
    pub branch_id: BranchId,
    pub parent_request_id: Option<RequestId>,
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub message_count: u32,
    pub is_subtask: bool,
    pub parent_task_request_id: Option<RequestId>,
}

/// Persisted row for the response to a request; foreign-keyed by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub request_id: RequestId,
    pub domain: Domain,
    pub account_id: AccountId,
    pub status: u16,
    pub body: serde_json::Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only streamed-event row; `(request_id, chunk_index)` is unique
/// (spec §3/§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingChunkRecord {
    pub request_id: RequestId,
    pub chunk_index: u64,
    pub timestamp: DateTime<Utc>,
    pub raw_event_text: String,
    pub token_delta: Option<u64>,
}
