//! Message table: append, cell-window query, expiry lookup and batch delete.

use crate::error::AppResult;
use crate::models::message::{MessageKind, MessageRecord, NewMessage};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::DbPool;

#[derive(Debug, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub kind: String,
    pub text: String,
    pub user_id: String,
    pub username: String,
    pub lat: f64,
    pub lng: f64,
    pub geohash: String,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for MessageRecord {
    fn from(row: MessageRow) -> Self {
        let kind = match row.kind.as_str() {
            "movement" => Some(MessageKind::Movement),
            "chat" => Some(MessageKind::Chat),
            _ => None,
        };
        Self {
            id: Some(row.id.to_string()),
            kind,
            text: Some(row.text),
            user_id: Some(row.user_id),
            username: Some(row.username),
            position: Some(serde_json::json!({ "lat": row.lat, "lng": row.lng })),
            geohash: Some(row.geohash),
            created_at: Some(row.created_at),
        }
    }
}

fn kind_column(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Chat => "chat",
        MessageKind::Movement => "movement",
    }
}

const COLUMNS: &str = "id, kind, text, user_id, username, lat, lng, geohash, created_at";

pub async fn message_insert(pool: &DbPool, message: &NewMessage) -> AppResult<MessageRow> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        r#"
        INSERT INTO messages ({COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(kind_column(message.kind))
    .bind(&message.text)
    .bind(&message.author_id)
    .bind(&message.author_name)
    .bind(message.position.lat)
    .bind(message.position.lng)
    .bind(message.cell.as_str())
    .bind(message.created_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Newest `limit` messages whose cell is one of `cells`.
pub async fn messages_window(
    pool: &DbPool,
    cells: &[String],
    limit: i64,
) -> AppResult<Vec<MessageRow>> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {COLUMNS} FROM messages WHERE geohash = ANY($1) ORDER BY created_at DESC LIMIT $2"
    ))
    .bind(cells)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn message_ids_older_than(pool: &DbPool, cutoff: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM messages WHERE created_at < $1")
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Single-statement delete, so a batch is removed entirely or not at all.
/// Ids that are already gone simply do not match.
pub async fn messages_delete(pool: &DbPool, ids: &[Uuid]) -> AppResult<u64> {
    let r = sqlx::query("DELETE FROM messages WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(r.rows_affected())
}
