//! In-process message log: a vector behind a lock plus a broadcast of appends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AppendReceipt, Batch, CellFilter, LiveFeed, MessageLog, SubscriptionGuard};
use crate::error::AppResult;
use crate::models::message::{Message, MessageId, MessageRecord, NewMessage};

/// Shared in-memory log. Cloning yields another handle to the same log.
#[derive(Clone)]
pub struct MemoryLog {
    entries: Arc<RwLock<Vec<Message>>>,
    appended: broadcast::Sender<Message>,
    live: Arc<AtomicUsize>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let (appended, _rx) = broadcast::channel(256);
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            appended,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot of every stored message, oldest first.
    pub async fn all(&self) -> Vec<Message> {
        let mut all = self.entries.read().await.clone();
        all.sort_by_key(|m| m.created_at);
        all
    }

    /// Live subscriptions currently open against this log.
    pub fn active_subscriptions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    async fn window(&self, filter: &CellFilter) -> Batch {
        let entries = self.entries.read().await;
        let mut matching: Vec<&Message> = entries
            .iter()
            .filter(|m| filter.matches(&m.cell))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching
            .into_iter()
            .take(filter.limit)
            .map(MessageRecord::from)
            .collect()
    }
}

#[async_trait]
impl MessageLog for MemoryLog {
    async fn append(&self, message: NewMessage) -> AppResult<AppendReceipt> {
        let message = message.into_message(Uuid::new_v4().to_string());
        let receipt = AppendReceipt {
            id: message.id.clone(),
            created_at: message.created_at,
        };
        self.entries.write().await.push(message.clone());
        // No receivers just means nobody is subscribed.
        let _ = self.appended.send(message);
        debug!(id = %receipt.id, "appended");
        Ok(receipt)
    }

    async fn query_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<MessageId>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|m| m.created_at < cutoff)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn delete_batch(&self, ids: &[MessageId]) -> AppResult<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|m| !ids.contains(&m.id));
        Ok((before - entries.len()) as u64)
    }

    async fn subscribe(&self, filter: CellFilter) -> AppResult<LiveFeed> {
        // Listen before reading the window so nothing appended in between is
        // lost; a duplicate is harmless because batches are upserts.
        let mut appended_rx = self.appended.subscribe();
        let window = self.window(&filter).await;

        let (tx, rx) = mpsc::channel::<Batch>(64);
        let producer = tokio::spawn(async move {
            if tx.send(window).await.is_err() {
                return;
            }
            loop {
                match appended_rx.recv().await {
                    Ok(message) => {
                        if !filter.matches(&message.cell) {
                            continue;
                        }
                        if tx.send(vec![MessageRecord::from(&message)]).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "live subscription lagged behind appends");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.live.fetch_add(1, Ordering::SeqCst);
        let live = self.live.clone();
        let guard = SubscriptionGuard::new(producer).on_close(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(LiveFeed::new(rx, guard))
    }
}
