//! Asynchronous, batched persistence (spec §4.7, component C7).

use crate::error::Result;
use crate::types::{RequestRecord, ResponseRecord, StreamingChunkRecord};
use nexus_core::config::StorageConfig;
use nexus_core::model::ContentBlock;
use nexus_core::types::{Domain, RequestId};
use nexus_linker::task_cache::{TaskInvocation, TaskInvocationCache};
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

enum WriteOp {
    Request(RequestRecord),
    Response { record: ResponseRecord, domain: Domain },
    Chunk(StreamingChunkRecord),
}

/// Non-blocking front for the batched writer; the actual flush runs on a
/// dedicated background task so one slow request can never stall another
/// (spec §5).
#[derive(Clone)]
pub struct StorageWriter {
    tx: mpsc::Sender<WriteOp>,
}

impl StorageWriter {
    /// Spawns the background flush task and returns a handle. `db_path` is
    /// opened twice: once here for the flush task, the caller opens a second
    /// connection for reads (WAL mode allows both concurrently).
    pub fn spawn(
        db_path: &str,
        config: StorageConfig,
        task_cache: Arc<TaskInvocationCache>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        crate::db::init_db(&conn)?;

        let (tx, rx) = mpsc::channel(config.batch_size * 4);
        tokio::spawn(run_flush_loop(rx, conn, config, task_cache, shutdown));

        Ok(Self { tx })
    }

    /// Guarantees the request row commits before any later `enqueue_response`
    /// for the same `request_id` is effective, since both land on the same
    /// single-consumer channel and a flush always inserts requests first.
    pub async fn enqueue_request(&self, record: RequestRecord) {
        if self.tx.send(WriteOp::Request(record)).await.is_err() {
            warn!("storage writer channel closed; request dropped");
        }
    }

    pub async fn enqueue_response(&self, record: ResponseRecord, domain: Domain) {
        if self
            .tx
            .send(WriteOp::Response { record, domain })
            .await
            .is_err()
        {
            warn!("storage writer channel closed; response dropped");
        }
    }

    pub async fn enqueue_chunk(&self, record: StreamingChunkRecord) {
        if self.tx.send(WriteOp::Chunk(record)).await.is_err() {
            warn!("storage writer channel closed; chunk dropped");
        }
    }
}

async fn run_flush_loop(
    mut rx: mpsc::Receiver<WriteOp>,
    conn: Connection,
    config: StorageConfig,
    task_cache: Arc<TaskInvocationCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut requests: Vec<RequestRecord> = Vec::new();
    let mut responses: Vec<(ResponseRecord, Domain)> = Vec::new();
    let mut chunks: Vec<StreamingChunkRecord> = Vec::new();
    let mut interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));

    loop {
        tokio::select! {
            maybe_op = rx.recv() => {
                match maybe_op {
                    Some(WriteOp::Request(r)) => requests.push(r),
                    Some(WriteOp::Response { record, domain }) => responses.push((record, domain)),
                    Some(WriteOp::Chunk(c)) => chunks.push(c),
                    None => {
                        flush(&conn, &mut requests, &mut responses, &mut chunks, &task_cache, &config).await;
                        break;
                    }
                }
                if requests.len() + responses.len() + chunks.len() >= config.batch_size {
                    flush(&conn, &mut requests, &mut responses, &mut chunks, &task_cache, &config).await;
                }
            }
            _ = interval.tick() => {
                if !requests.is_empty() || !responses.is_empty() || !chunks.is_empty() {
                    flush(&conn, &mut requests, &mut responses, &mut chunks, &task_cache, &config).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    flush(&conn, &mut requests, &mut responses, &mut chunks, &task_cache, &config).await;
                    break;
                }
            }
        }
    }
}

async fn flush(
    conn: &Connection,
    requests: &mut Vec<RequestRecord>,
    responses: &mut Vec<(ResponseRecord, Domain)>,
    chunks: &mut Vec<StreamingChunkRecord>,
    task_cache: &TaskInvocationCache,
    config: &StorageConfig,
) {
    if requests.is_empty() && responses.is_empty() && chunks.is_empty() {
        return;
    }

    let mut backoff_ms = config.retry_initial_ms;
    for attempt in 1..=config.retry_max_attempts {
        match commit_batch(conn, requests, responses, chunks, task_cache) {
            Ok(()) => {
                requests.clear();
                responses.clear();
                chunks.clear();
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "storage flush failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(config.retry_cap_ms);
            }
        }
    }

    error!(
        requests = requests.len(),
        responses = responses.len(),
        chunks = chunks.len(),
        "storage flush exhausted retries; batch dropped"
    );
    requests.clear();
    responses.clear();
    chunks.clear();
}

fn commit_batch(
    conn: &Connection,
    requests: &[RequestRecord],
    responses: &[(ResponseRecord, Domain)],
    chunks: &[StreamingChunkRecord],
    task_cache: &TaskInvocationCache,
) -> Result<()> {
    // rusqlite::Connection isn't `Sync`-shareable across threads without a
    // guard, but this function always runs on the single flush task, so a
    // plain transaction is safe here.
    let tx = conn.unchecked_transaction()?;

    for r in requests {
        tx.execute(
            "INSERT OR IGNORE INTO api_requests
             (request_id, domain, account_id, timestamp, body, conversation_id, branch_id,
              parent_request_id, current_message_hash, parent_message_hash, system_hash,
              message_count, is_subtask, parent_task_request_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                r.request_id.as_str(),
                r.domain.as_str(),
                r.account_id.as_str(),
                r.timestamp.to_rfc3339(),
                serde_json::to_string(&r.body)?,
                r.conversation_id.as_str(),
                r.branch_id.as_str(),
                r.parent_request_id.as_ref().map(|p| p.as_str().to_string()),
                r.current_message_hash,
                r.parent_message_hash,
                r.system_hash,
                r.message_count,
                r.is_subtask,
                r.parent_task_request_id.as_ref().map(|p| p.as_str().to_string()),
            ],
        )?;
    }

    for c in chunks {
        tx.execute(
            "INSERT OR IGNORE INTO streaming_chunks
             (request_id, chunk_index, timestamp, data, token_count)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                c.request_id.as_str(),
                c.chunk_index as i64,
                c.timestamp.to_rfc3339(),
                c.raw_event_text,
                c.token_delta.map(|v| v as i64),
            ],
        )?;
    }

    for (resp, domain) in responses {
        tx.execute(
            "INSERT OR IGNORE INTO api_responses
             (request_id, status, body, input_tokens, output_tokens,
              cache_creation_input_tokens, cache_read_input_tokens, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                resp.request_id.as_str(),
                resp.status,
                serde_json::to_string(&resp.body)?,
                resp.input_tokens as i64,
                resp.output_tokens as i64,
                resp.cache_creation_input_tokens as i64,
                resp.cache_read_input_tokens as i64,
                resp.timestamp.to_rfc3339(),
            ],
        )?;

        bump_token_usage(&tx, resp.account_id.as_str(), resp.timestamp, resp.input_tokens, resp.output_tokens)?;
        scan_task_tool_invocations(&tx, resp, domain, task_cache)?;
    }

    tx.commit()?;
    Ok(())
}

fn bump_token_usage(
    tx: &rusqlite::Transaction,
    account_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
    input_tokens: u64,
    output_tokens: u64,
) -> Result<()> {
    let minute_bucket = timestamp.timestamp() / 60;
    tx.execute(
        "INSERT INTO token_usage_minute (account_id, minute_bucket, input_tokens, output_tokens)
         VALUES (?1,?2,?3,?4)
         ON CONFLICT(account_id, minute_bucket) DO UPDATE SET
           input_tokens = input_tokens + excluded.input_tokens,
           output_tokens = output_tokens + excluded.output_tokens",
        params![account_id, minute_bucket, input_tokens as i64, output_tokens as i64],
    )?;
    Ok(())
}

/// Walks the response's content for `tool_use` blocks named `Task`, records
/// them on the parent request row, and feeds C4 so sub-task detection can
/// find them (spec §4.7).
fn scan_task_tool_invocations(
    tx: &rusqlite::Transaction,
    resp: &ResponseRecord,
    domain: &Domain,
    task_cache: &TaskInvocationCache,
) -> Result<()> {
    let blocks: Vec<ContentBlock> = match resp.body.get("content") {
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_default(),
        None => Vec::new(),
    };

    let mut invocations = Vec::new();
    for block in &blocks {
        if let ContentBlock::ToolUse { id, name, input } = block {
            if name == "Task" {
                let prompt = input
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let description = input.get("description").and_then(|v| v.as_str());
                invocations.push(serde_json::json!({
                    "id": id,
                    "prompt": prompt,
                    "description": description,
                }));
            }
        }
    }

    if invocations.is_empty() {
        return Ok(());
    }

    tx.execute(
        "UPDATE api_requests SET task_tool_invocation = ?1 WHERE request_id = ?2",
        params![
            serde_json::to_string(&invocations)?,
            resp.request_id.as_str()
        ],
    )?;

    for inv in &invocations {
        let prompt = inv["prompt"].as_str().unwrap_or_default().to_string();
        let tool_use_id = inv["id"].as_str().unwrap_or_default().to_string();
        task_cache.add(
            domain,
            TaskInvocation {
                parent_request_id: RequestId::from(resp.request_id.as_str().to_string()),
                tool_use_id,
                prompt,
                timestamp: resp.timestamp,
            },
        );
    }

    Ok(())
}
