//! C8 TokenUsageTracker: rolling-window and daily token accounting, plus the
//! nightly job that coalesces matured minute buckets into daily totals
//! (spec §4.8).

use crate::error::Result;
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WindowUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl WindowUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyUsage {
    pub day: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Sums `token_usage_minute` buckets from the last `window_minutes`. The
/// nightly coalesce job only ever retires buckets older than its own window,
/// so anything still inside `window_minutes` is guaranteed to still be here.
pub fn current_window(conn: &Connection, account_id: &str, window_minutes: i64) -> Result<WindowUsage> {
    let cutoff = (Utc::now() - Duration::minutes(window_minutes)).timestamp() / 60;

    let (input_minute, output_minute): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0)
         FROM token_usage_minute WHERE account_id = ?1 AND minute_bucket >= ?2",
        params![account_id, cutoff],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(WindowUsage {
        input_tokens: input_minute as u64,
        output_tokens: output_minute as u64,
    })
}

pub fn daily(conn: &Connection, account_id: &str, days: i64) -> Result<Vec<DailyUsage>> {
    let since = (Utc::now().date_naive() - Duration::days(days)).to_string();
    let mut stmt = conn.prepare(
        "SELECT day, input_tokens, output_tokens FROM token_usage_daily
         WHERE account_id = ?1 AND day >= ?2 ORDER BY day ASC",
    )?;
    let rows = stmt.query_map(params![account_id, since], |row| {
        Ok(DailyUsage {
            day: row.get(0)?,
            input_tokens: row.get::<_, i64>(1)? as u64,
            output_tokens: row.get::<_, i64>(2)? as u64,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Moves minute buckets older than `window_minutes` into `token_usage_daily`
/// and deletes them, keeping `token_usage_minute` bounded regardless of how
/// long the process has been running.
pub fn coalesce_nightly(conn: &Connection, window_minutes: i64) -> Result<()> {
    let cutoff = (Utc::now() - Duration::minutes(window_minutes)).timestamp() / 60;

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "SELECT account_id, minute_bucket, input_tokens, output_tokens
             FROM token_usage_minute WHERE minute_bucket < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut matured = Vec::new();
        for row in rows {
            matured.push(row?);
        }

        for (account_id, minute_bucket, input_tokens, output_tokens) in matured {
            let day = bucket_to_day(minute_bucket);
            tx.execute(
                "INSERT INTO token_usage_daily (account_id, day, input_tokens, output_tokens)
                 VALUES (?1,?2,?3,?4)
                 ON CONFLICT(account_id, day) DO UPDATE SET
                   input_tokens = input_tokens + excluded.input_tokens,
                   output_tokens = output_tokens + excluded.output_tokens",
                params![account_id, day, input_tokens, output_tokens],
            )?;
        }
    }

    tx.execute(
        "DELETE FROM token_usage_minute WHERE minute_bucket < ?1",
        params![cutoff],
    )?;

    tx.commit()?;
    Ok(())
}

fn bucket_to_day(minute_bucket: i64) -> String {
    let secs = minute_bucket * 60;
    let days_since_epoch = secs / 86_400;
    let date = NaiveDate::from_ymd_opt(1970, 1, 1)
        .unwrap()
        .checked_add_signed(Duration::days(days_since_epoch))
        .unwrap();
    date.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        conn
    }

    #[test]
    fn window_sums_recent_minute_buckets() {
        let conn = setup();
        let now_bucket = Utc::now().timestamp() / 60;
        conn.execute(
            "INSERT INTO token_usage_minute (account_id, minute_bucket, input_tokens, output_tokens)
             VALUES ('acct', ?1, 100, 50)",
            params![now_bucket],
        )
        .unwrap();

        let usage = current_window(&conn, "acct", 5).unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn window_ignores_buckets_outside_range() {
        let conn = setup();
        let old_bucket = Utc::now().timestamp() / 60 - 1_000_000;
        conn.execute(
            "INSERT INTO token_usage_minute (account_id, minute_bucket, input_tokens, output_tokens)
             VALUES ('acct', ?1, 100, 50)",
            params![old_bucket],
        )
        .unwrap();

        let usage = current_window(&conn, "acct", 5).unwrap();
        assert_eq!(usage.total(), 0);
    }

    #[test]
    fn coalesce_moves_matured_buckets_into_daily_and_deletes_them() {
        let conn = setup();
        let old_bucket = Utc::now().timestamp() / 60 - 1_000_000;
        conn.execute(
            "INSERT INTO token_usage_minute (account_id, minute_bucket, input_tokens, output_tokens)
             VALUES ('acct', ?1, 100, 50)",
            params![old_bucket],
        )
        .unwrap();

        coalesce_nightly(&conn, 300).unwrap();

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM token_usage_minute", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);

        let daily_total: i64 = conn
            .query_row(
                "SELECT SUM(input_tokens) FROM token_usage_daily WHERE account_id = 'acct'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(daily_total, 100);
    }
}
