use rusqlite::{Connection, Result};

/// Initialise storage tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    create_api_requests_table(conn)?;
    create_api_responses_table(conn)?;
    create_streaming_chunks_table(conn)?;
    create_token_usage_tables(conn)?;
    Ok(())
}

fn create_api_requests_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_requests (
            request_id               TEXT PRIMARY KEY,
            domain                   TEXT NOT NULL,
            account_id               TEXT NOT NULL,
            timestamp                TEXT NOT NULL,
            body                     TEXT NOT NULL,
            conversation_id          TEXT NOT NULL,
            branch_id                TEXT NOT NULL,
            parent_request_id        TEXT REFERENCES api_requests(request_id),
            current_message_hash    TEXT NOT NULL,
            parent_message_hash     TEXT,
            system_hash              TEXT,
            message_count            INTEGER NOT NULL,
            is_subtask               INTEGER NOT NULL DEFAULT 0,
            parent_task_request_id  TEXT REFERENCES api_requests(request_id),
            task_tool_invocation     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_requests_parent_hash
            ON api_requests(domain, current_message_hash, timestamp);
        CREATE INDEX IF NOT EXISTS idx_requests_parent_id
            ON api_requests(parent_request_id);
        CREATE INDEX IF NOT EXISTS idx_requests_conversation
            ON api_requests(conversation_id, branch_id);",
    )
}

fn create_api_responses_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_responses (
            request_id            TEXT PRIMARY KEY REFERENCES api_requests(request_id),
            status                 INTEGER NOT NULL,
            body                   TEXT NOT NULL,
            input_tokens           INTEGER NOT NULL DEFAULT 0,
            output_tokens          INTEGER NOT NULL DEFAULT 0,
            cache_creation_input_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_input_tokens     INTEGER NOT NULL DEFAULT 0,
            timestamp              TEXT NOT NULL
        );",
    )
}

fn create_streaming_chunks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS streaming_chunks (
            request_id   TEXT NOT NULL REFERENCES api_requests(request_id),
            chunk_index  INTEGER NOT NULL,
            timestamp    TEXT NOT NULL,
            data         TEXT NOT NULL,
            token_count  INTEGER,
            UNIQUE(request_id, chunk_index)
        );",
    )
}

fn create_token_usage_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS token_usage_minute (
            account_id     TEXT NOT NULL,
            minute_bucket  INTEGER NOT NULL,
            input_tokens   INTEGER NOT NULL DEFAULT 0,
            output_tokens  INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, minute_bucket)
        );
        CREATE TABLE IF NOT EXISTS token_usage_daily (
            account_id     TEXT NOT NULL,
            day            TEXT NOT NULL,
            input_tokens   INTEGER NOT NULL DEFAULT 0,
            output_tokens  INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, day)
        );",
    )
}
