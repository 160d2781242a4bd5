//! Proximity subscription: one live query over the 3x3 cells around the user.
//!
//! At most one subscription is open per service. Opening always closes the
//! previous one first, and no batch is applied once `close` has returned.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::SyncSettings;
use crate::error::AppResult;
use crate::geo::Neighborhood;
use crate::models::message::{decode_batch, Message};
use crate::models::position::Position;
use crate::models::presence::PresenceEntry;
use crate::repositories::{Batch, CellFilter, MessageLog, SubscriptionGuard};
use crate::services::presence::PresenceReconstructor;

/// Derived view fed by the live subscription.
#[derive(Debug, Default)]
struct NearbyState {
    /// Bumped on every open and close; batches from older subscriptions are dropped.
    generation: u64,
    login_epoch: Option<DateTime<Utc>>,
    /// Visible window, oldest first.
    messages: Vec<Message>,
    presence: PresenceReconstructor,
}

struct LiveSubscription {
    neighborhood: Neighborhood,
    applier: JoinHandle<()>,
    _guard: SubscriptionGuard,
}

/// Owns the live subscription of one session.
#[derive(Clone)]
pub struct ProximityService {
    log: Arc<dyn MessageLog>,
    settings: SyncSettings,
    state: Arc<RwLock<NearbyState>>,
    live: Arc<Mutex<Option<LiveSubscription>>>,
    revision: Arc<watch::Sender<u64>>,
}

impl ProximityService {
    pub fn new(log: Arc<dyn MessageLog>, settings: SyncSettings) -> Self {
        let (revision, _rx) = watch::channel(0);
        Self {
            log,
            settings,
            state: Arc::new(RwLock::new(NearbyState::default())),
            live: Arc::new(Mutex::new(None)),
            revision: Arc::new(revision),
        }
    }

    /// (Re)open the subscription around `position`, showing only messages
    /// created at or after `login_epoch`.
    #[instrument(skip(self))]
    pub async fn open(
        &self,
        position: Position,
        login_epoch: DateTime<Utc>,
    ) -> AppResult<Neighborhood> {
        let mut live = self.live.lock().await;
        self.close_locked(&mut live).await;

        let neighborhood = Neighborhood::around(position, self.settings.cell_precision);
        let feed = self
            .log
            .subscribe(CellFilter {
                cells: neighborhood.cells.clone(),
                limit: self.settings.window_size,
            })
            .await?;

        let generation = {
            let mut state = self.state.write().await;
            state.generation += 1;
            state.login_epoch = Some(login_epoch);
            state.messages.clear();
            state.presence = PresenceReconstructor::new();
            state.generation
        };
        self.bump();

        let (batches, guard) = feed.into_parts();
        let applier = tokio::spawn(apply_loop(
            batches,
            generation,
            self.state.clone(),
            self.revision.clone(),
            self.settings,
        ));

        info!(center = %neighborhood.center, cells = neighborhood.cells.len(), "proximity subscription opened");
        *live = Some(LiveSubscription {
            neighborhood: neighborhood.clone(),
            applier,
            _guard: guard,
        });
        Ok(neighborhood)
    }

    /// Close the live subscription, if any. Displayed state is kept.
    pub async fn close(&self) {
        let mut live = self.live.lock().await;
        self.close_locked(&mut live).await;
        self.bump();
    }

    async fn close_locked(&self, live: &mut Option<LiveSubscription>) {
        let Some(sub) = live.take() else {
            return;
        };
        // Taking the write lock waits out a batch that is mid-apply.
        self.state.write().await.generation += 1;
        sub.applier.abort();
        info!(center = %sub.neighborhood.center, "proximity subscription closed");
    }

    /// Close and forget everything derived so far.
    pub async fn reset(&self) {
        let mut live = self.live.lock().await;
        self.close_locked(&mut live).await;
        {
            let mut state = self.state.write().await;
            state.login_epoch = None;
            state.messages.clear();
            state.presence = PresenceReconstructor::new();
        }
        self.bump();
    }

    pub async fn is_active(&self) -> bool {
        self.live.lock().await.is_some()
    }

    pub async fn neighborhood(&self) -> Option<Neighborhood> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|sub| sub.neighborhood.clone())
    }

    /// Current window, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Presence entries still active at `now`.
    pub async fn presence(&self, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        self.state
            .read()
            .await
            .presence
            .active(now, self.settings.inactivity_timeout)
    }

    /// Revision counter bumped whenever the derived view changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

async fn apply_loop(
    mut batches: mpsc::Receiver<Batch>,
    generation: u64,
    state: Arc<RwLock<NearbyState>>,
    revision: Arc<watch::Sender<u64>>,
    settings: SyncSettings,
) {
    while let Some(batch) = batches.recv().await {
        let incoming = decode_batch(batch);
        let mut guard = state.write().await;
        if guard.generation != generation {
            debug!(generation, "dropping batch from closed subscription");
            return;
        }
        apply_batch(&mut guard, incoming, &settings, Utc::now());
        drop(guard);
        revision.send_modify(|r| *r += 1);
    }
}

/// Merge one decoded batch into the window and refold presence.
fn apply_batch(
    state: &mut NearbyState,
    incoming: Vec<Message>,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) {
    let epoch = state.login_epoch;
    let mut merged = 0usize;
    for message in incoming {
        if epoch.is_some_and(|e| message.created_at < e) {
            continue;
        }
        match state.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => state.messages.push(message),
        }
        merged += 1;
    }

    state
        .messages
        .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let overflow = state.messages.len().saturating_sub(settings.window_size);
    if overflow > 0 {
        state.messages.drain(..overflow);
    }

    state.presence =
        PresenceReconstructor::rebuild(&state.messages, now, settings.inactivity_timeout);
    debug!(merged, window = state.messages.len(), presence = state.presence.len(), "batch applied");
}
