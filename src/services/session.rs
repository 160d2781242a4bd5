//! Session lifecycle: sign-in, activity tracking and dormancy.
//!
//! ```text
//! SignedOut -> Authenticating -> Active <-> Dormant
//!      ^                           |          |
//!      +-------- reset ------------+----------+
//! ```
//!
//! Sending, moving, renaming and marking read count as activity. Each one
//! re-arms a single inactivity timer; when it fires the live subscription is
//! closed and the session goes dormant until the next activity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::auth::IdentityProvider;
use crate::config::SyncSettings;
use crate::error::{AppError, AppResult};
use crate::geo;
use crate::models::message::{log_timestamp, Message, MessageId, NewMessage};
use crate::models::position::{Position, DEFAULT_POSITION};
use crate::models::presence::PresenceEntry;
use crate::prefs::{Preferences, DISPLAY_NAME_KEY, TUTORIAL_SHOWN_KEY};
use crate::repositories::{AppendReceipt, MessageLog};
use crate::services::proximity::ProximityService;
use crate::services::read_state::{self, ReadSet};
use crate::services::retention::RetentionService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    SignedOut,
    Authenticating,
    Active,
    Dormant,
}

/// Identity and timing of the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
    /// Messages created before this instant are never shown.
    pub login_epoch: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub position: Position,
    #[serde(skip)]
    pub token: String,
}

struct SessionInner {
    phase: SessionPhase,
    session: Option<Session>,
    read: ReadSet,
    timer: Option<JoinHandle<()>>,
    /// Identifies the armed timer; a timer only fires if it is still current.
    timer_epoch: u64,
}

impl SessionInner {
    fn signed_out() -> Self {
        Self {
            phase: SessionPhase::SignedOut,
            session: None,
            read: ReadSet::new(),
            timer: None,
            timer_epoch: 0,
        }
    }

    fn cancel_timer(&mut self) {
        self.timer_epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// One client's session over a shared message log.
#[derive(Clone)]
pub struct SessionService {
    inner: Arc<Mutex<SessionInner>>,
    proximity: ProximityService,
    retention: RetentionService,
    log: Arc<dyn MessageLog>,
    identity: Arc<dyn IdentityProvider>,
    prefs: Arc<dyn Preferences>,
    settings: SyncSettings,
}

impl SessionService {
    pub fn new(
        log: Arc<dyn MessageLog>,
        identity: Arc<dyn IdentityProvider>,
        prefs: Arc<dyn Preferences>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner::signed_out())),
            proximity: ProximityService::new(log.clone(), settings),
            retention: RetentionService::new(log.clone(), settings.message_ttl),
            log,
            identity,
            prefs,
            settings,
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.lock().await.session.clone()
    }

    /// Display name remembered from an earlier session, if any.
    pub fn saved_display_name(&self) -> Option<String> {
        self.prefs.get(DISPLAY_NAME_KEY).filter(|n| !n.is_empty())
    }

    pub fn tutorial_shown(&self) -> bool {
        self.prefs.get(TUTORIAL_SHOWN_KEY).as_deref() == Some("true")
    }

    pub fn mark_tutorial_shown(&self) -> AppResult<()> {
        self.prefs.set(TUTORIAL_SHOWN_KEY, "true")
    }

    /// Sign in with a fresh identity at `position`.
    ///
    /// Any previous session is reset first. On success one movement marker
    /// is appended at the position and the proximity subscription is open.
    #[instrument(skip(self))]
    pub async fn sign_in(&self, display_name: &str, position: Position) -> AppResult<Session> {
        self.start(display_name, position, None).await
    }

    /// Sign in again under the identity behind `token`.
    ///
    /// Behaves like [`sign_in`](Self::sign_in) with a new login epoch; only
    /// the user id carries over. A token the provider rejects leaves the
    /// session signed out.
    #[instrument(skip(self, token))]
    pub async fn resume(
        &self,
        display_name: &str,
        position: Position,
        token: &str,
    ) -> AppResult<Session> {
        self.start(display_name, position, Some(token)).await
    }

    async fn start(
        &self,
        display_name: &str,
        position: Position,
        token: Option<&str>,
    ) -> AppResult<Session> {
        let display_name = self.validate_display_name(display_name)?;
        let position = if position.is_valid() {
            position
        } else {
            warn!(?position, "invalid initial position; using default");
            DEFAULT_POSITION
        };

        self.reset().await;
        let mut inner = self.inner.lock().await;
        inner.phase = SessionPhase::Authenticating;

        let attempt = match token {
            Some(token) => self.identity.resume(token).await,
            None => self.identity.sign_in().await,
        };
        let identity = match attempt {
            Ok(identity) => identity,
            Err(e) => {
                inner.phase = SessionPhase::SignedOut;
                warn!(error = %e, "sign-in rejected");
                return Err(if matches!(e, AppError::AuthFailure(_)) {
                    e
                } else {
                    AppError::AuthFailure(e.to_string())
                });
            }
        };

        self.retention.spawn_sweep();

        let login_epoch = log_timestamp();
        if let Err(e) = self.prefs.set(DISPLAY_NAME_KEY, &display_name) {
            warn!(error = %e, "could not persist display name");
        }

        let marker = NewMessage::movement(
            identity.user_id.clone(),
            display_name.clone(),
            position,
            self.settings.cell_precision,
        )
        .at(login_epoch);
        if let Err(e) = self.log.append(marker).await {
            inner.phase = SessionPhase::SignedOut;
            return Err(e);
        }

        if let Err(e) = self.proximity.open(position, login_epoch).await {
            inner.phase = SessionPhase::SignedOut;
            return Err(e);
        }

        let session = Session {
            user_id: identity.user_id,
            display_name,
            login_epoch,
            last_activity_at: login_epoch,
            position,
            token: identity.token,
        };
        inner.session = Some(session.clone());
        inner.read.clear();
        inner.phase = SessionPhase::Active;
        self.arm_timer(&mut inner);

        info!(user_id = %session.user_id, "signed in");
        Ok(session)
    }

    /// Append a chat message at the current position.
    ///
    /// On failure nothing local changes apart from the activity timestamp.
    #[instrument(skip(self))]
    pub async fn send(&self, text: &str) -> AppResult<AppendReceipt> {
        let text = self.validate_text(text)?;
        let mut inner = self.inner.lock().await;
        self.touch(&mut inner).await?;
        let session = inner.session.as_ref().ok_or(AppError::NotSignedIn)?;

        let message = NewMessage::chat(
            text,
            session.user_id.clone(),
            session.display_name.clone(),
            session.position,
            self.settings.cell_precision,
        );
        self.log.append(message).await
    }

    /// Move the user's marker. Out-of-range coordinates are ignored.
    ///
    /// Appends a movement marker and, when the center cell changes, reopens
    /// the subscription around the new position.
    #[instrument(skip(self))]
    pub async fn move_to(&self, position: Position) -> AppResult<Option<AppendReceipt>> {
        if !position.is_valid() {
            warn!(?position, "ignoring move to invalid position");
            return Ok(None);
        }
        let mut inner = self.inner.lock().await;
        self.touch(&mut inner).await?;
        let phase = inner.phase;
        let session = inner.session.as_mut().ok_or(AppError::NotSignedIn)?;

        let marker = NewMessage::movement(
            session.user_id.clone(),
            session.display_name.clone(),
            position,
            self.settings.cell_precision,
        );
        let new_cell = marker.cell.clone();
        let receipt = self.log.append(marker).await?;

        let old_cell = geo::encode(session.position, self.settings.cell_precision);
        session.position = position;
        let login_epoch = session.login_epoch;

        if new_cell != old_cell && phase == SessionPhase::Active {
            info!(from = %old_cell, to = %new_cell, "neighborhood changed");
            if let Err(e) = self.proximity.open(position, login_epoch).await {
                // The old subscription is already gone; the next action retries.
                inner.phase = SessionPhase::Dormant;
                inner.cancel_timer();
                warn!(error = %e, "could not reopen proximity subscription");
                return Err(e);
            }
        }
        Ok(Some(receipt))
    }

    /// Hide a message for the rest of the session. Local only.
    pub async fn mark_read(&self, id: &str) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_none() {
            return Err(AppError::NotSignedIn);
        }
        self.touch(&mut inner).await?;
        inner.read.mark_read(id.to_string());
        Ok(())
    }

    pub async fn is_read(&self, id: &MessageId) -> bool {
        self.inner.lock().await.read.contains(id)
    }

    /// Rename the user; persisted for future sessions.
    pub async fn set_display_name(&self, display_name: &str) -> AppResult<()> {
        let display_name = self.validate_display_name(display_name)?;
        self.prefs.set(DISPLAY_NAME_KEY, &display_name)?;
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            self.touch(&mut inner).await?;
            if let Some(session) = inner.session.as_mut() {
                session.display_name = display_name;
            }
        }
        Ok(())
    }

    /// Chat messages in the window that are not yet read, oldest first.
    pub async fn visible_messages(&self) -> Vec<Message> {
        let messages = self.proximity.messages().await;
        let inner = self.inner.lock().await;
        read_state::visible_messages(&messages, &inner.read)
    }

    pub async fn unread_count(&self) -> usize {
        self.visible_messages().await.len()
    }

    /// Every chat message in the window, newest first.
    pub async fn message_log(&self) -> Vec<Message> {
        read_state::message_log(&self.proximity.messages().await)
    }

    /// Nearby users active within the inactivity threshold.
    pub async fn presence(&self) -> Vec<PresenceEntry> {
        self.proximity.presence(Utc::now()).await
    }

    /// Whether the user's own cell is inside the open neighborhood.
    ///
    /// Sending is never gated on this; it is reported for display only.
    pub async fn is_in_range(&self) -> bool {
        let Some(position) = self.inner.lock().await.session.as_ref().map(|s| s.position) else {
            return false;
        };
        match self.proximity.neighborhood().await {
            Some(hood) => hood.contains(&geo::encode(position, self.settings.cell_precision)),
            None => false,
        }
    }

    pub async fn live_subscription_open(&self) -> bool {
        self.proximity.is_active().await
    }

    /// Fires whenever the window or presence changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.proximity.changes()
    }

    /// Sign out: close the subscription, cancel the timer, forget everything.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.cancel_timer();
        self.proximity.reset().await;
        if let Some(session) = inner.session.take() {
            info!(user_id = %session.user_id, "signed out");
        }
        inner.read.clear();
        inner.phase = SessionPhase::SignedOut;
    }

    /// Record activity: resume a dormant session and re-arm the timer.
    ///
    /// Also reopens the subscription if it was lost while active.
    async fn touch(&self, inner: &mut SessionInner) -> AppResult<()> {
        let Some(session) = inner.session.as_mut() else {
            return Ok(());
        };
        session.last_activity_at = Utc::now();
        let (position, login_epoch) = (session.position, session.login_epoch);
        if inner.phase == SessionPhase::Dormant || !self.proximity.is_active().await {
            if let Err(e) = self.proximity.open(position, login_epoch).await {
                inner.phase = SessionPhase::Dormant;
                return Err(e);
            }
            inner.phase = SessionPhase::Active;
            info!("session resumed");
        }
        self.arm_timer(inner);
        Ok(())
    }

    fn arm_timer(&self, inner: &mut SessionInner) {
        inner.cancel_timer();
        let epoch = inner.timer_epoch;
        let timeout = self.settings.inactivity_timeout;
        let shared = self.inner.clone();
        let proximity = self.proximity.clone();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = shared.lock().await;
            if inner.timer_epoch != epoch || inner.phase != SessionPhase::Active {
                return;
            }
            proximity.close().await;
            inner.phase = SessionPhase::Dormant;
            inner.timer = None;
            info!(idle_secs = timeout.as_secs(), "session dormant");
        }));
    }

    fn validate_display_name(&self, display_name: &str) -> AppResult<String> {
        let name = display_name.trim();
        let len = name.chars().count();
        if len == 0 || len > self.settings.max_display_name_len {
            return Err(AppError::Validation(format!(
                "display name must be 1 to {} characters",
                self.settings.max_display_name_len
            )));
        }
        Ok(name.to_string())
    }

    fn validate_text(&self, text: &str) -> AppResult<String> {
        let text = text.trim();
        let len = text.chars().count();
        if len == 0 || len > self.settings.max_text_len {
            return Err(AppError::Validation(format!(
                "message must be 1 to {} characters",
                self.settings.max_text_len
            )));
        }
        Ok(text.to_string())
    }
}
