use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::GatewayError;

pub const DEFAULT_BUFFER_SIZE: usize = 1000;
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(5);
/// Rows per INSERT inside one flush transaction.
pub const INSERT_CHUNK_SIZE: usize = 100;

/// One billed request, as recorded after the response is fully delivered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: String,
    pub user_id: i64,
    pub token_name: String,
    pub model_name: String,
    pub channel_id: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub quota: i64,
    pub elapsed_ms: u64,
    pub is_stream: bool,
    pub cached: bool,
    pub selection_reason: String,
    pub created_at: u64,
}

/// Sink for batched log writes. Implementations chunk rows at
/// [`INSERT_CHUNK_SIZE`] inside a single transaction.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn insert_batch(&self, rows: &[RequestLog]) -> Result<(), GatewayError>;
}

struct BatcherInner {
    buffer: Mutex<Vec<RequestLog>>,
    store: Arc<dyn LogStore>,
    max_size: usize,
}

impl BatcherInner {
    /// Swaps the buffer out under the lock and writes the drained rows.
    /// Failures drop the batch: at-most-once, callers never depend on log
    /// persistence for correctness.
    async fn flush(&self) {
        let drained = {
            let mut buffer = match self.buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            if buffer.is_empty() {
                return;
            }
            std::mem::replace(&mut *buffer, Vec::with_capacity(self.max_size))
        };

        let count = drained.len();
        if let Err(err) = self.store.insert_batch(&drained).await {
            tracing::warn!(error = %err, rows = count, "log batch dropped");
        } else {
            tracing::debug!(rows = count, "log batch flushed");
        }
    }
}

/// Buffered, periodic bulk writer that keeps billing/observability rows off
/// the request path.
pub struct LogBatcher {
    inner: Arc<BatcherInner>,
    done: Arc<Notify>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for LogBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBatcher")
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl LogBatcher {
    pub fn start(store: Arc<dyn LogStore>) -> Self {
        Self::with_options(store, DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_PERIOD)
    }

    pub fn with_options(store: Arc<dyn LogStore>, max_size: usize, flush_period: Duration) -> Self {
        let inner = Arc::new(BatcherInner {
            buffer: Mutex::new(Vec::with_capacity(max_size.max(1))),
            store,
            max_size: max_size.max(1),
        });
        let done = Arc::new(Notify::new());

        let flusher_inner = inner.clone();
        let flusher_done = done.clone();
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_period.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => flusher_inner.flush().await,
                    _ = flusher_done.notified() => return,
                }
            }
        });

        Self {
            inner,
            done,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Appends a row; a full buffer schedules an immediate async flush.
    pub fn add(&self, log: RequestLog) {
        let should_flush = {
            let mut buffer = match self.inner.buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.push(log);
            buffer.len() >= self.inner.max_size
        };

        if should_flush {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.flush().await;
            });
        }
    }

    pub fn buffered(&self) -> usize {
        match self.inner.buffer.lock() {
            Ok(buffer) => buffer.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Stops the ticker, joins it, and drains the buffer one last time.
    pub async fn stop(&self) {
        // notify_one stores a permit, so shutdown is not lost when the
        // flusher is mid-flush rather than parked in select.
        self.done.notify_one();
        let handle = {
            let mut flusher = match self.flusher.lock() {
                Ok(flusher) => flusher,
                Err(poisoned) => poisoned.into_inner(),
            };
            flusher.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.flush().await;
    }
}

#[cfg(test)]
pub(crate) struct MemoryLogStore {
    pub rows: Mutex<Vec<RequestLog>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryLogStore {
    pub(crate) fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_batch(&self, rows: &[RequestLog]) -> Result<(), GatewayError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(GatewayError::Internal {
                message: "store unavailable".to_string(),
            });
        }
        self.rows.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_log(request_id: &str) -> RequestLog {
    RequestLog {
        request_id: request_id.to_string(),
        user_id: 1,
        token_name: "token".to_string(),
        model_name: "gpt-4o-mini".to_string(),
        channel_id: 1,
        prompt_tokens: 1,
        completion_tokens: 1,
        quota: 2,
        elapsed_ms: 10,
        is_stream: false,
        cached: false,
        selection_reason: "Health-based selection".to_string(),
        created_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_drains_every_row_exactly_once() {
        let store = Arc::new(MemoryLogStore::new());
        let batcher = LogBatcher::with_options(store.clone(), 1000, Duration::from_secs(60));

        for i in 0..25 {
            batcher.add(test_log(&format!("req-{i}")));
        }
        batcher.stop().await;

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 25);
        let mut ids: Vec<&str> = rows.iter().map(|row| row.request_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 25, "no duplicates");
    }

    #[tokio::test]
    async fn full_buffer_triggers_async_flush() {
        let store = Arc::new(MemoryLogStore::new());
        let batcher = LogBatcher::with_options(store.clone(), 5, Duration::from_secs(60));

        for i in 0..5 {
            batcher.add(test_log(&format!("req-{i}")));
        }
        // The flush was spawned; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.rows.lock().unwrap().len(), 5);
        assert_eq!(batcher.buffered(), 0);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn failed_batches_are_dropped_not_retried() {
        let store = Arc::new(MemoryLogStore::new());
        store.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let batcher = LogBatcher::with_options(store.clone(), 1000, Duration::from_secs(60));

        batcher.add(test_log("req-1"));
        batcher.flush().await;
        assert_eq!(batcher.buffered(), 0);

        store
            .fail
            .store(false, std::sync::atomic::Ordering::Relaxed);
        batcher.add(test_log("req-2"));
        batcher.stop().await;

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "req-2");
    }

    #[tokio::test]
    async fn ticker_flushes_periodically() {
        let store = Arc::new(MemoryLogStore::new());
        let batcher = LogBatcher::with_options(store.clone(), 1000, Duration::from_millis(20));

        batcher.add(test_log("req-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        batcher.stop().await;
    }
}
