//! Redis pub/sub for per-cell change notifications.

use crate::error::AppError;
use crate::geo::SpatialCell;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

const CELL_CHANNEL_PREFIX: &str = "fugumap:cell:";

fn cell_channel(cell: &SpatialCell) -> String {
    format!("{}{}", CELL_CHANNEL_PREFIX, cell)
}

/// Redis-backed repository: one pub/sub channel per spatial cell.
#[derive(Clone)]
pub struct RedisRepository {
    client: Arc<redis::Client>,
}

impl RedisRepository {
    /// Create repository from Redis URL.
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get a multiplexed connection for commands.
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Publish a serialized record on its cell's channel.
    pub async fn publish(&self, cell: &SpatialCell, payload: &str) -> Result<u64, AppError> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.publish(cell_channel(cell), payload).await?;
        debug!(cell = %cell, count, "published");
        Ok(count)
    }

    /// Open a dedicated pub/sub connection listening on every given cell.
    pub async fn subscribe_to_cells(
        &self,
        cells: &[SpatialCell],
    ) -> Result<redis::aio::PubSub, AppError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        for cell in cells {
            pubsub.subscribe(cell_channel(cell)).await?;
        }
        info!(cells = cells.len(), "subscribed to redis cell channels");
        Ok(pubsub)
    }
}
