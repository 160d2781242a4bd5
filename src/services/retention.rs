//! Retention sweep: delete log entries older than the message TTL.
//!
//! Runs once per session start. Many clients may sweep the same log at
//! once; deleting an id twice is a no-op, so no coordination is needed.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::repositories::MessageLog;

#[derive(Clone)]
pub struct RetentionService {
    log: Arc<dyn MessageLog>,
    ttl: Duration,
}

impl RetentionService {
    pub fn new(log: Arc<dyn MessageLog>, ttl: Duration) -> Self {
        Self { log, ttl }
    }

    /// Delete every entry created before `now - ttl`; returns how many went.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AppError::Config(format!("message ttl: {}", e)))?;
        let cutoff = now - ttl;
        let ids = self.log.query_older_than(cutoff).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.log.delete_batch(&ids).await?;
        info!(expired = ids.len(), deleted, "retention sweep");
        Ok(deleted)
    }

    /// Fire-and-forget sweep; failures are logged and dropped.
    pub fn spawn_sweep(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.sweep(Utc::now()).await {
                warn!(error = %e, "retention sweep failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::NewMessage;
    use crate::models::position::Position;
    use crate::repositories::MemoryLog;
    use chrono::Duration as ChronoDuration;

    fn here() -> Position {
        Position::new(35.6809591, 139.7673068).unwrap()
    }

    #[tokio::test]
    async fn expired_messages_are_deleted_and_stay_gone() {
        let log = MemoryLog::new();
        let now = Utc::now();
        let old = log
            .append(NewMessage::chat("old", "u1", "A", here(), 6).at(now - ChronoDuration::minutes(6)))
            .await
            .unwrap();
        let fresh = log
            .append(NewMessage::chat("new", "u1", "A", here(), 6).at(now - ChronoDuration::minutes(1)))
            .await
            .unwrap();

        let retention = RetentionService::new(Arc::new(log.clone()), Duration::from_secs(300));
        let cutoff = now - ChronoDuration::minutes(5);
        assert_eq!(log.query_older_than(cutoff).await.unwrap(), vec![old.id.clone()]);

        tokio_test::assert_ok!(retention.sweep(now).await);
        assert!(log.query_older_than(cutoff).await.unwrap().is_empty());
        let remaining: Vec<_> = log.all().await.into_iter().map(|m| m.id).collect();
        assert_eq!(remaining, vec![fresh.id]);
    }

    #[tokio::test]
    async fn concurrent_sweeps_do_not_fail() {
        let log = MemoryLog::new();
        let now = Utc::now();
        for i in 0..10 {
            log.append(
                NewMessage::chat(format!("m{}", i), "u1", "A", here(), 6)
                    .at(now - ChronoDuration::minutes(10)),
            )
            .await
            .unwrap();
        }
        let a = RetentionService::new(Arc::new(log.clone()), Duration::from_secs(300));
        let b = a.clone();
        let (ra, rb) = tokio::join!(a.sweep(now), b.sweep(now));
        assert_eq!(ra.unwrap() + rb.unwrap(), 10);
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn nothing_to_sweep_is_zero() {
        let retention = RetentionService::new(Arc::new(MemoryLog::new()), Duration::from_secs(300));
        assert_eq!(retention.sweep(Utc::now()).await.unwrap(), 0);
    }
}
