use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};

use super::log_batcher::{LogStore, RequestLog, INSERT_CHUNK_SIZE};
use super::GatewayError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    token_name TEXT NOT NULL,
    model_name TEXT NOT NULL,
    channel_id INTEGER NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    quota INTEGER NOT NULL,
    elapsed_ms INTEGER NOT NULL,
    is_stream INTEGER NOT NULL,
    cached INTEGER NOT NULL,
    selection_reason TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_logs_user ON request_logs(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_request_logs_channel ON request_logs(channel_id, created_at);
";

/// SQLite-backed log store. One transaction per batch, chunked inserts.
pub struct SqliteLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLogStore").finish()
    }
}

impl SqliteLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let conn = Connection::open(path).map_err(sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn row_count(&self) -> Result<u64, GatewayError> {
        let conn = lock_conn(&self.conn);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM request_logs", [], |row| row.get(0))
            .map_err(sqlite_error)?;
        Ok(count.max(0) as u64)
    }
}

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> std::sync::MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(conn) => conn,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn sqlite_error(err: rusqlite::Error) -> GatewayError {
    GatewayError::Internal {
        message: format!("sqlite error: {err}"),
    }
}

fn insert_rows(conn: &Arc<Mutex<Connection>>, rows: &[RequestLog]) -> Result<(), GatewayError> {
    let mut conn = lock_conn(conn);
    let tx = conn.transaction().map_err(sqlite_error)?;
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO request_logs (
                    request_id, user_id, token_name, model_name, channel_id,
                    prompt_tokens, completion_tokens, quota, elapsed_ms,
                    is_stream, cached, selection_reason, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .map_err(sqlite_error)?;

        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            for row in chunk {
                stmt.execute(params![
                    row.request_id,
                    row.user_id,
                    row.token_name,
                    row.model_name,
                    row.channel_id,
                    row.prompt_tokens as i64,
                    row.completion_tokens as i64,
                    row.quota,
                    row.elapsed_ms as i64,
                    row.is_stream as i64,
                    row.cached as i64,
                    row.selection_reason,
                    row.created_at as i64,
                ])
                .map_err(sqlite_error)?;
            }
        }
    }
    tx.commit().map_err(sqlite_error)
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn insert_batch(&self, rows: &[RequestLog]) -> Result<(), GatewayError> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = self.conn.clone();
        let rows = rows.to_vec();
        tokio::task::spawn_blocking(move || insert_rows(&conn, &rows))
            .await
            .map_err(|err| GatewayError::Internal {
                message: format!("log writer task failed: {err}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::log_batcher::test_log;

    #[tokio::test]
    async fn batch_insert_round_trips() {
        let store = SqliteLogStore::open_in_memory().expect("open");
        let rows: Vec<RequestLog> = (0..250).map(|i| test_log(&format!("req-{i}"))).collect();

        store.insert_batch(&rows).await.expect("insert");
        assert_eq!(store.row_count().expect("count"), 250);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = SqliteLogStore::open_in_memory().expect("open");
        store.insert_batch(&[]).await.expect("insert");
        assert_eq!(store.row_count().expect("count"), 0);
    }
}
