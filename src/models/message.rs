//! Log messages: chat lines and movement markers sharing one record shape.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::geo::{self, SpatialCell};
use crate::models::position::Position;

/// Text carried by movement records, kept so older readers that only look
/// at `text` still recognise them.
pub const MOVEMENT_MARKER: &str = "(移動)";

/// Current time at the precision the log stores (microseconds), so a
/// timestamp read back from storage compares equal to the one written.
pub fn log_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Log-assigned message identifier.
pub type MessageId = String;

/// What a record means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Visible chat text.
    Chat,
    /// "The author is now at `position`"; never shown as chat.
    Movement,
}

/// A message about to be appended. `cell` is always `encode(position)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub text: String,
    pub author_id: String,
    pub author_name: String,
    pub position: Position,
    pub cell: SpatialCell,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn chat(
        text: impl Into<String>,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
        position: Position,
        precision: usize,
    ) -> Self {
        Self::build(
            MessageKind::Chat,
            text.into(),
            author_id.into(),
            author_name.into(),
            position,
            precision,
        )
    }

    pub fn movement(
        author_id: impl Into<String>,
        author_name: impl Into<String>,
        position: Position,
        precision: usize,
    ) -> Self {
        Self::build(
            MessageKind::Movement,
            MOVEMENT_MARKER.to_string(),
            author_id.into(),
            author_name.into(),
            position,
            precision,
        )
    }

    fn build(
        kind: MessageKind,
        text: String,
        author_id: String,
        author_name: String,
        position: Position,
        precision: usize,
    ) -> Self {
        Self {
            kind,
            text,
            author_id,
            author_name,
            cell: geo::encode(position, precision),
            position,
            created_at: log_timestamp(),
        }
    }

    /// Override the client-assigned timestamp.
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            kind: self.kind,
            text: self.text,
            author_id: self.author_id,
            author_name: self.author_name,
            position: self.position,
            cell: self.cell,
            created_at: self.created_at,
        }
    }
}

/// A message as stored in the log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub text: String,
    pub author_id: String,
    pub author_name: String,
    pub position: Position,
    pub cell: SpatialCell,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_movement(&self) -> bool {
        self.kind == MessageKind::Movement
    }
}

/// Wire shape of a log record. Every field is optional so one bad record
/// can be rejected on its own instead of failing a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub position: Option<serde_json::Value>,
    #[serde(default)]
    pub geohash: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Message> for MessageRecord {
    fn from(m: &Message) -> Self {
        Self {
            id: Some(m.id.clone()),
            kind: Some(m.kind),
            text: Some(m.text.clone()),
            user_id: Some(m.author_id.clone()),
            username: Some(m.author_name.clone()),
            position: Some(serde_json::json!({ "lat": m.position.lat, "lng": m.position.lng })),
            geohash: Some(m.cell.to_string()),
            created_at: Some(m.created_at),
        }
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = AppError;

    fn try_from(record: MessageRecord) -> AppResult<Self> {
        let id = required(record.id, "id")?;
        let text = required(record.text, "text")?;
        let author_id = required(record.user_id, "user_id")?;
        let author_name = record.username.unwrap_or_default();
        let created_at = record
            .created_at
            .ok_or_else(|| missing(&id, "created_at"))?;

        let raw_position = record.position.ok_or_else(|| missing(&id, "position"))?;
        let lat = raw_position.get("lat").and_then(|v| v.as_f64());
        let lng = raw_position.get("lng").and_then(|v| v.as_f64());
        let position = match (lat, lng) {
            (Some(lat), Some(lng)) => Position::new(lat, lng).map_err(|e| {
                AppError::MalformedRecord(format!("{}: {}", id, e))
            })?,
            _ => {
                return Err(AppError::MalformedRecord(format!(
                    "{}: position is not numeric",
                    id
                )))
            }
        };

        let cell = SpatialCell::parse(&required(record.geohash, "geohash")?)?;
        if geo::encode(position, cell.precision()) != cell {
            return Err(AppError::MalformedRecord(format!(
                "{}: geohash {} does not match position",
                id, cell
            )));
        }

        let kind = record.kind.unwrap_or(if text == MOVEMENT_MARKER {
            MessageKind::Movement
        } else {
            MessageKind::Chat
        });

        Ok(Self {
            id,
            kind,
            text,
            author_id,
            author_name,
            position,
            cell,
            created_at,
        })
    }
}

fn required(value: Option<String>, field: &str) -> AppResult<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::MalformedRecord(format!("missing {}", field)))
}

fn missing(id: &str, field: &str) -> AppError {
    AppError::MalformedRecord(format!("{}: missing {}", id, field))
}

/// Decode a delivered batch, dropping (and logging) malformed records.
pub fn decode_batch(records: Vec<MessageRecord>) -> Vec<Message> {
    records
        .into_iter()
        .filter_map(|record| match Message::try_from(record) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}
