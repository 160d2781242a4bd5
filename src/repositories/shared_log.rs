//! Message log shared by many clients: Postgres stores, Redis announces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AppendReceipt, Batch, CellFilter, LiveFeed, MessageLog, RedisRepository, SubscriptionGuard,
};
use crate::db::{self, DbPool};
use crate::error::{AppError, AppResult};
use crate::geo::SpatialCell;
use crate::models::message::{MessageId, MessageRecord, NewMessage};

/// Postgres-backed log with a Redis pub/sub change feed per cell.
#[derive(Clone)]
pub struct SharedLog {
    db: DbPool,
    redis: Arc<RedisRepository>,
}

impl SharedLog {
    pub fn new(db: DbPool, redis: Arc<RedisRepository>) -> Self {
        Self { db, redis }
    }

    /// Connect both backends and make sure the message table exists.
    pub async fn connect(database_url: &str, redis_url: &str) -> AppResult<Self> {
        let db = db::create_pool(database_url)
            .await
            .map_err(AppError::log_unavailable)?;
        db::ensure_schema(&db)
            .await
            .map_err(AppError::log_unavailable)?;
        let redis = Arc::new(RedisRepository::new(redis_url).map_err(AppError::log_unavailable)?);
        info!("shared message log connected");
        Ok(Self::new(db, redis))
    }
}

#[async_trait]
impl MessageLog for SharedLog {
    async fn append(&self, message: NewMessage) -> AppResult<AppendReceipt> {
        let cell = message.cell.clone();
        let row = db::message_insert(&self.db, &message)
            .await
            .map_err(AppError::log_unavailable)?;
        let receipt = AppendReceipt {
            id: row.id.to_string(),
            created_at: row.created_at,
        };

        // The row is already durable; a lost notification only delays
        // live readers until they resubscribe.
        if let Err(e) = announce(&self.redis, &cell, MessageRecord::from(row)).await {
            warn!(id = %receipt.id, error = %e, "append stored but not announced");
        }
        Ok(receipt)
    }

    async fn query_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<MessageId>> {
        let ids = db::message_ids_older_than(&self.db, cutoff)
            .await
            .map_err(AppError::log_unavailable)?;
        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    async fn delete_batch(&self, ids: &[MessageId]) -> AppResult<u64> {
        // Ids this log never issued cannot match a row.
        let ids: Vec<Uuid> = ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        db::messages_delete(&self.db, &ids)
            .await
            .map_err(AppError::log_unavailable)
    }

    async fn subscribe(&self, filter: CellFilter) -> AppResult<LiveFeed> {
        let pubsub = self
            .redis
            .subscribe_to_cells(&filter.cells)
            .await
            .map_err(AppError::log_unavailable)?;
        let cells: Vec<String> = filter.cells.iter().map(|c| c.to_string()).collect();
        let rows = db::messages_window(&self.db, &cells, filter.limit as i64)
            .await
            .map_err(AppError::log_unavailable)?;
        let window: Batch = rows.into_iter().map(MessageRecord::from).collect();

        let (tx, rx) = mpsc::channel::<Batch>(64);
        let producer = tokio::spawn(async move {
            if tx.send(window).await.is_err() {
                return;
            }
            let mut stream = Box::pin(pubsub.into_on_message());
            while let Some(msg) = stream.next().await {
                let payload = match msg.get_payload::<String>() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "unreadable notification payload");
                        continue;
                    }
                };
                match serde_json::from_str::<MessageRecord>(&payload) {
                    Ok(record) => {
                        if tx.send(vec![record]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping malformed notification"),
                }
            }
            debug!("redis change feed ended");
        });

        Ok(LiveFeed::new(rx, SubscriptionGuard::new(producer)))
    }
}

/// Publish a stored row on its cell's channel.
async fn announce(
    redis: &RedisRepository,
    cell: &SpatialCell,
    record: MessageRecord,
) -> AppResult<u64> {
    let payload = serde_json::to_string(&record)?;
    redis.publish(cell, &payload).await
}
