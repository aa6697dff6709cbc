//! Storage-facing interface `ConversationLinker` needs. Defined here (rather
//! than depended on from `nexus-storage`) so `nexus-storage` can implement it
//! without `nexus-linker` depending back on `nexus-storage` — the same split
//! the teacher uses for its cross-crate `MessageContext` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::error::Result;
use nexus_core::types::{BranchId, ConversationId, Domain, RequestId};

#[derive(Debug, Clone)]
pub struct ParentCandidate {
    pub request_id: RequestId,
    pub conversation_id: ConversationId,
    pub branch_id: BranchId,
}

#[async_trait]
pub trait LinkerStorage: Send + Sync {
    /// Most recent RequestRecord whose `current_message_hash == parent_hash`,
    /// restricted to `timestamp < before` and (unless `system_hash` is
    /// `None`, meaning "tolerate mismatch") to the same `system_hash`.
    async fn find_by_parent_hash(
        &self,
        domain: &Domain,
        parent_hash: &str,
        system_hash: Option<&str>,
        before: DateTime<Utc>,
    ) -> Result<Option<ParentCandidate>>;

    /// Whether a child of `parent_request_id` already exists with exactly
    /// `current_message_hash`, and whether any child exists at all (used to
    /// distinguish a plain continuation from a branch fork).
    async fn child_with_hash_exists(
        &self,
        parent_request_id: &RequestId,
        current_message_hash: &str,
    ) -> Result<bool>;

    async fn any_child_exists(&self, parent_request_id: &RequestId) -> Result<bool>;

    /// `MAX(branch suffix) + 1` scanned from persisted rows for the
    /// conversation (spec §9's resolution of the branch-id open question).
    async fn next_branch_suffix(&self, conversation_id: &ConversationId) -> Result<u32>;

    async fn next_compact_suffix(&self, conversation_id: &ConversationId) -> Result<u32>;

    /// A prior RequestRecord in `domain` whose response body equals
    /// `summary_text` exactly (spec §4.3 step 4).
    async fn find_summary_continuation(
        &self,
        domain: &Domain,
        summary_text: &str,
    ) -> Result<Option<ParentCandidate>>;
}
