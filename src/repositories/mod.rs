//! Message log: the shared, append-only store every client reads and writes.
//!
//! The log is an external collaborator; [`MessageLog`] is the contract the
//! engine needs from it. [`MemoryLog`] keeps everything in-process,
//! [`SharedLog`] stores messages in Postgres and fans out changes over Redis.

pub mod memory_log;
pub mod redis_repo;
pub mod shared_log;

pub use memory_log::MemoryLog;
pub use redis_repo::RedisRepository;
pub use shared_log::SharedLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::AppResult;
use crate::geo::SpatialCell;
use crate::models::message::{MessageId, MessageRecord, NewMessage};

/// A batch of upserted records, internally consistent in time.
pub type Batch = Vec<MessageRecord>;

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

/// Live query: `cell IN cells ORDER BY created_at DESC LIMIT limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFilter {
    pub cells: Vec<SpatialCell>,
    pub limit: usize,
}

impl CellFilter {
    pub fn matches(&self, cell: &SpatialCell) -> bool {
        self.cells.contains(cell)
    }
}

#[async_trait]
pub trait MessageLog: Send + Sync + 'static {
    /// Durably append one message; all-or-nothing.
    async fn append(&self, message: NewMessage) -> AppResult<AppendReceipt>;

    /// Ids of every entry created strictly before `cutoff`.
    async fn query_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<MessageId>>;

    /// Delete a set of ids atomically. Unknown ids are ignored; returns how
    /// many entries were actually removed.
    async fn delete_batch(&self, ids: &[MessageId]) -> AppResult<u64>;

    /// Open a live query. The first batch is the current window (newest
    /// first); later batches carry newly appended matches.
    async fn subscribe(&self, filter: CellFilter) -> AppResult<LiveFeed>;
}

/// Receiving half of a live subscription.
pub struct LiveFeed {
    batches: mpsc::Receiver<Batch>,
    guard: SubscriptionGuard,
}

impl LiveFeed {
    pub fn new(batches: mpsc::Receiver<Batch>, guard: SubscriptionGuard) -> Self {
        Self { batches, guard }
    }

    /// Split into the batch stream and the guard that keeps it open.
    pub fn into_parts(self) -> (mpsc::Receiver<Batch>, SubscriptionGuard) {
        (self.batches, self.guard)
    }

    pub async fn recv(&mut self) -> Option<Batch> {
        self.batches.recv().await
    }
}

/// Keeps a live subscription open; dropping it stops the producer at once.
pub struct SubscriptionGuard {
    producer: Option<JoinHandle<()>>,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(producer: JoinHandle<()>) -> Self {
        Self {
            producer: Some(producer),
            on_close: None,
        }
    }

    /// Run `f` exactly once when the subscription closes.
    pub fn on_close(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}
