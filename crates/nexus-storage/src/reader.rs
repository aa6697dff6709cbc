//! Synchronous read paths C3 needs (spec §4.7's `findByParentHash` /
//! `findSummaryContinuation`), wrapped in the `LinkerStorage` trait so
//! `nexus-linker` never depends on this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::types::{BranchId, ConversationId, Domain, RequestId};
use nexus_linker::storage::{LinkerStorage, ParentCandidate};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct StorageReader {
    conn: Arc<Mutex<Connection>>,
}

impl StorageReader {
    pub fn open(db_path: &str) -> nexus_core::error::Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))?;
        crate::db::init_db(&conn).map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn current_window(
        &self,
        account_id: &str,
        window_minutes: i64,
    ) -> nexus_core::error::Result<crate::tokens::WindowUsage> {
        crate::tokens::current_window(&self.conn.lock().unwrap(), account_id, window_minutes)
            .map_err(Into::into)
    }

    pub fn daily(
        &self,
        account_id: &str,
        days: i64,
    ) -> nexus_core::error::Result<Vec<crate::tokens::DailyUsage>> {
        crate::tokens::daily(&self.conn.lock().unwrap(), account_id, days).map_err(Into::into)
    }

    pub fn coalesce_nightly(&self, window_minutes: i64) -> nexus_core::error::Result<()> {
        crate::tokens::coalesce_nightly(&self.conn.lock().unwrap(), window_minutes).map_err(Into::into)
    }
}

#[async_trait]
impl LinkerStorage for StorageReader {
    async fn find_by_parent_hash(
        &self,
        domain: &Domain,
        parent_hash: &str,
        system_hash: Option<&str>,
        before: DateTime<Utc>,
    ) -> nexus_core::error::Result<Option<ParentCandidate>> {
        let conn = self.conn.lock().unwrap();
        // `IS` (rather than `=`) makes the comparison NULL-tolerant, so a
        // request with no system prompt only matches a parent that also has
        // none, instead of matching any system_hash when ?3 binds NULL.
        let row = conn
            .query_row(
                "SELECT request_id, conversation_id, branch_id FROM api_requests
                 WHERE domain = ?1 AND current_message_hash = ?2 AND system_hash IS ?3
                   AND timestamp < ?4
                 ORDER BY timestamp DESC LIMIT 1",
                params![domain.as_str(), parent_hash, system_hash, before.to_rfc3339()],
                row_to_candidate,
            )
            .optional();

        row.map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))
    }

    async fn child_with_hash_exists(
        &self,
        parent_request_id: &RequestId,
        current_message_hash: &str,
    ) -> nexus_core::error::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM api_requests WHERE parent_request_id = ?1 AND current_message_hash = ?2",
                params![parent_request_id.as_str(), current_message_hash],
                |row| row.get(0),
            )
            .map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))?;
        Ok(count > 0)
    }

    async fn any_child_exists(&self, parent_request_id: &RequestId) -> nexus_core::error::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM api_requests WHERE parent_request_id = ?1",
                params![parent_request_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))?;
        Ok(count > 0)
    }

    async fn next_branch_suffix(&self, conversation_id: &ConversationId) -> nexus_core::error::Result<u32> {
        next_suffix(&self.conn, conversation_id, "branch_")
    }

    async fn next_compact_suffix(&self, conversation_id: &ConversationId) -> nexus_core::error::Result<u32> {
        next_suffix(&self.conn, conversation_id, "compact_")
    }

    async fn find_summary_continuation(
        &self,
        domain: &Domain,
        summary_text: &str,
    ) -> nexus_core::error::Result<Option<ParentCandidate>> {
        if summary_text.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().unwrap();
        // The prior response never echoes the client's marker-prefixed
        // message back verbatim; it matches when its own text *contains*
        // the extracted summary, so compare with LIKE rather than `=`.
        let pattern = format!("%{}%", escape_like(summary_text));
        conn.query_row(
            "SELECT r.request_id, r.conversation_id, r.branch_id
             FROM api_requests r JOIN api_responses resp ON resp.request_id = r.request_id
             WHERE r.domain = ?1 AND json_extract(resp.body, '$.content[0].text') LIKE ?2 ESCAPE '\\'
             ORDER BY r.timestamp DESC LIMIT 1",
            params![domain.as_str(), pattern],
            row_to_candidate,
        )
        .optional()
        .map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))
    }
}

fn next_suffix(
    conn: &Arc<Mutex<Connection>>,
    conversation_id: &ConversationId,
    prefix: &str,
) -> nexus_core::error::Result<u32> {
    let conn = conn.lock().unwrap();
    let mut stmt = conn
        .prepare("SELECT branch_id FROM api_requests WHERE conversation_id = ?1")
        .map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))?;
    let rows = stmt
        .query_map(params![conversation_id.as_str()], |row| row.get::<_, String>(0))
        .map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))?;

    let mut max_seen: u32 = 0;
    for row in rows {
        let branch_id = row.map_err(|e| nexus_core::error::ProxyError::Database(e.to_string()))?;
        if let Some(suffix) = branch_id.strip_prefix(prefix) {
            if let Ok(n) = suffix.parse::<u32>() {
                max_seen = max_seen.max(n);
            }
        }
    }
    Ok(max_seen + 1)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn row_to_candidate(row: &rusqlite::Row) -> rusqlite::Result<ParentCandidate> {
    Ok(ParentCandidate {
        request_id: RequestId::from(row.get::<_, String>(0)?),
        conversation_id: ConversationId::from(row.get::<_, String>(1)?),
        branch_id: BranchId::from(row.get::<_, String>(2)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestRecord;
    use nexus_core::types::AccountId;

    fn reader_with_request(record: &RequestRecord) -> StorageReader {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nexus.db");
        let reader = StorageReader::open(db_path.to_str().unwrap()).unwrap();
        {
            let conn = reader.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO api_requests
                 (request_id, domain, account_id, timestamp, body, conversation_id, branch_id,
                  parent_request_id, current_message_hash, parent_message_hash, system_hash,
                  message_count, is_subtask, parent_task_request_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                params![
                    record.request_id.as_str(),
                    record.domain.as_str(),
                    record.account_id.as_str(),
                    record.timestamp.to_rfc3339(),
                    record.body.to_string(),
                    record.conversation_id.as_str(),
                    record.branch_id.as_str(),
                    record.parent_request_id.as_ref().map(|p| p.as_str().to_string()),
                    &record.current_message_hash,
                    &record.parent_message_hash,
                    &record.system_hash,
                    record.message_count,
                    record.is_subtask,
                    record.parent_task_request_id.as_ref().map(|p| p.as_str().to_string()),
                ],
            )
            .unwrap();
        }
        // leak the tempdir so the file outlives this helper
        std::mem::forget(dir);
        reader
    }

    fn sample_record() -> RequestRecord {
        RequestRecord {
            request_id: RequestId::new(),
            domain: Domain::from("acme.example.com"),
            account_id: AccountId::from("acct-1"),
            timestamp: Utc::now() - chrono::Duration::seconds(5),
            body: serde_json::json!({}),
            conversation_id: ConversationId::new(),
            branch_id: BranchId::main(),
            parent_request_id: None,
            current_message_hash: "hash-a".to_string(),
            parent_message_hash: None,
            system_hash: Some("sys-1".to_string()),
            message_count: 1,
            is_subtask: false,
            parent_task_request_id: None,
        }
    }

    #[tokio::test]
    async fn finds_parent_by_hash_when_domain_and_hash_match() {
        let record = sample_record();
        let reader = reader_with_request(&record);

        let found = reader
            .find_by_parent_hash(&record.domain, "hash-a", Some("sys-1"), Utc::now())
            .await
            .unwrap();

        assert!(found.is_some());
        assert_eq!(found.unwrap().request_id, record.request_id);
    }

    #[tokio::test]
    async fn does_not_find_parent_in_a_different_domain() {
        let record = sample_record();
        let reader = reader_with_request(&record);

        let found = reader
            .find_by_parent_hash(&Domain::from("other.example.com"), "hash-a", Some("sys-1"), Utc::now())
            .await
            .unwrap();

        assert!(found.is_none());
    }

    #[tokio::test]
    async fn next_branch_suffix_starts_at_one_with_no_existing_branches() {
        let record = sample_record();
        let reader = reader_with_request(&record);

        let suffix = reader.next_branch_suffix(&record.conversation_id).await.unwrap();
        assert_eq!(suffix, 1);
    }
}
