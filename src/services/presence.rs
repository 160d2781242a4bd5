//! Presence reconstruction: who is nearby and where, replayed from messages.
//!
//! Positions move only on movement markers or on the first message seen
//! from an author; ordinary chat just keeps the entry alive.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

use crate::models::message::Message;
use crate::models::presence::PresenceEntry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceReconstructor {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a window from scratch and drop authors idle longer than `inactivity`.
    pub fn rebuild(window: &[Message], now: DateTime<Utc>, inactivity: Duration) -> Self {
        let mut presence = Self::new();
        presence.fold(window);
        presence.evict_inactive(now, inactivity);
        presence
    }

    /// Apply messages in ascending `created_at` order (ties broken by id).
    pub fn fold<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) {
        let mut ordered: Vec<&Message> = messages.into_iter().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for message in ordered {
            self.apply(message);
        }
    }

    /// Apply one message. Applying the same message again changes nothing.
    pub fn apply(&mut self, message: &Message) {
        match self.entries.get_mut(&message.author_id) {
            Some(entry) if !message.is_movement() => {
                if message.created_at > entry.last_update_at {
                    entry.last_update_at = message.created_at;
                }
                entry.display_name = message.author_name.clone();
            }
            _ => {
                trace!(user_id = %message.author_id, cell = %message.cell, "presence moved");
                self.entries.insert(
                    message.author_id.clone(),
                    PresenceEntry {
                        user_id: message.author_id.clone(),
                        display_name: message.author_name.clone(),
                        position: message.position,
                        last_update_at: message.created_at,
                    },
                );
            }
        }
    }

    /// Drop entries whose last update is more than `inactivity` before `now`.
    pub fn evict_inactive(&mut self, now: DateTime<Utc>, inactivity: Duration) {
        self.entries
            .retain(|_, entry| is_recent(entry.last_update_at, now, inactivity));
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    /// Entries still active at `now`, ordered by user id.
    pub fn active(&self, now: DateTime<Utc>, inactivity: Duration) -> Vec<PresenceEntry> {
        let mut out: Vec<PresenceEntry> = self
            .entries
            .values()
            .filter(|e| is_recent(e.last_update_at, now, inactivity))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_recent(last: DateTime<Utc>, now: DateTime<Utc>, inactivity: Duration) -> bool {
    match (now - last).to_std() {
        Ok(age) => age <= inactivity,
        // Timestamps slightly ahead of the local clock count as fresh.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::NewMessage;
    use crate::models::position::Position;
    use chrono::Duration as ChronoDuration;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn pos(lat: f64, lng: f64) -> Position {
        Position::new(lat, lng).unwrap()
    }

    fn chat(id: &str, user: &str, p: Position, at: DateTime<Utc>) -> Message {
        NewMessage::chat("hi", user, user.to_uppercase(), p, 6)
            .at(at)
            .into_message(id.to_string())
    }

    fn movement(id: &str, user: &str, p: Position, at: DateTime<Utc>) -> Message {
        NewMessage::movement(user, user.to_uppercase(), p, 6)
            .at(at)
            .into_message(id.to_string())
    }

    #[test]
    fn first_contact_sets_position_even_for_chat() {
        let t0 = Utc::now();
        let mut presence = PresenceReconstructor::new();
        presence.apply(&chat("m1", "alice", pos(35.0, 139.0), t0));
        assert_eq!(presence.get("alice").unwrap().position, pos(35.0, 139.0));
    }

    #[test]
    fn later_chat_never_moves_a_marker() {
        let t0 = Utc::now();
        let marker = movement("m1", "alice", pos(35.0, 139.0), t0);
        let later_chat = chat("m2", "alice", pos(36.0, 140.0), t0 + ChronoDuration::seconds(5));
        let mut presence = PresenceReconstructor::new();
        presence.fold([&later_chat, &marker]);
        let entry = presence.get("alice").unwrap();
        assert_eq!(entry.position, pos(35.0, 139.0));
        assert_eq!(entry.last_update_at, later_chat.created_at);
    }

    #[test]
    fn later_marker_always_overrides() {
        let t0 = Utc::now();
        let mut presence = PresenceReconstructor::new();
        presence.fold([
            &movement("m1", "alice", pos(35.0, 139.0), t0),
            &chat("m2", "alice", pos(35.0, 139.0), t0 + ChronoDuration::seconds(1)),
            &movement("m3", "alice", pos(35.1, 139.1), t0 + ChronoDuration::seconds(2)),
        ]);
        assert_eq!(presence.get("alice").unwrap().position, pos(35.1, 139.1));
    }

    #[test]
    fn folding_twice_is_idempotent() {
        let t0 = Utc::now();
        let window = vec![
            movement("m1", "alice", pos(35.0, 139.0), t0),
            chat("m2", "alice", pos(35.5, 139.5), t0 + ChronoDuration::seconds(1)),
            chat("m3", "bob", pos(35.2, 139.2), t0 + ChronoDuration::seconds(2)),
        ];
        let mut once = PresenceReconstructor::new();
        once.fold(&window);
        let mut twice = once.clone();
        twice.fold(&window);
        assert_eq!(once, twice);

        let mut single = PresenceReconstructor::new();
        single.apply(&window[1]);
        let snapshot = single.clone();
        single.apply(&window[1]);
        assert_eq!(single, snapshot);
    }

    #[test]
    fn display_name_follows_latest_message() {
        let t0 = Utc::now();
        let mut renamed = chat("m2", "alice", pos(35.0, 139.0), t0 + ChronoDuration::seconds(1));
        renamed.author_name = "Ally".to_string();
        let mut presence = PresenceReconstructor::new();
        presence.fold([&movement("m1", "alice", pos(35.0, 139.0), t0), &renamed]);
        assert_eq!(presence.get("alice").unwrap().display_name, "Ally");
    }

    #[test]
    fn rebuild_evicts_idle_authors() {
        let now = Utc::now();
        let window = vec![
            movement("m1", "stale", pos(35.0, 139.0), now - ChronoDuration::minutes(6)),
            movement("m2", "fresh", pos(35.0, 139.0), now - ChronoDuration::minutes(1)),
        ];
        let presence = PresenceReconstructor::rebuild(&window, now, FIVE_MINUTES);
        assert!(presence.get("stale").is_none());
        assert!(presence.get("fresh").is_some());
        assert_eq!(presence.len(), 1);
    }

    #[test]
    fn active_filters_relative_to_now() {
        let t0 = Utc::now();
        let mut presence = PresenceReconstructor::new();
        presence.apply(&movement("m1", "alice", pos(35.0, 139.0), t0));
        assert_eq!(presence.active(t0, FIVE_MINUTES).len(), 1);
        assert!(presence
            .active(t0 + ChronoDuration::minutes(6), FIVE_MINUTES)
            .is_empty());
    }
}
