//! Client-local read bookkeeping and the display filter.

use std::collections::HashSet;

use crate::models::message::{Message, MessageId};

/// Ids the user has already seen or dismissed. Only grows during a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSet {
    ids: HashSet<MessageId>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the id was not marked before.
    pub fn mark_read(&mut self, id: impl Into<MessageId>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Only a session reset may forget read ids.
    pub(crate) fn clear(&mut self) {
        self.ids.clear();
    }
}

/// A message is shown iff it is chat and has not been read.
pub fn is_displayable(message: &Message, read: &ReadSet) -> bool {
    !message.is_movement() && !read.contains(&message.id)
}

/// Displayable messages, keeping the input order.
pub fn visible_messages(messages: &[Message], read: &ReadSet) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| is_displayable(m, read))
        .cloned()
        .collect()
}

/// Every chat message, read or not, newest first.
pub fn message_log(messages: &[Message]) -> Vec<Message> {
    let mut log: Vec<Message> = messages.iter().filter(|m| !m.is_movement()).cloned().collect();
    log.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::NewMessage;
    use crate::models::position::Position;
    use chrono::{Duration, Utc};

    fn window() -> Vec<Message> {
        let p = Position::new(35.0, 139.0).unwrap();
        let t0 = Utc::now();
        vec![
            NewMessage::movement("u1", "A", p, 6).at(t0).into_message("m0".into()),
            NewMessage::chat("one", "u1", "A", p, 6)
                .at(t0 + Duration::seconds(1))
                .into_message("m1".into()),
            NewMessage::chat("two", "u2", "B", p, 6)
                .at(t0 + Duration::seconds(2))
                .into_message("m2".into()),
        ]
    }

    #[test]
    fn movement_markers_are_never_displayed() {
        let ids: Vec<_> = visible_messages(&window(), &ReadSet::new())
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn read_messages_stay_hidden_across_batches() {
        let mut read = ReadSet::new();
        assert!(read.mark_read("m1"));
        assert!(!read.mark_read("m1"));

        for _ in 0..3 {
            let visible = visible_messages(&window(), &read);
            assert!(visible.iter().all(|m| m.id != "m1"));
            assert_eq!(visible.len(), 1);
        }
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn message_log_is_newest_first_and_ignores_read_state() {
        let log: Vec<_> = message_log(&window()).into_iter().map(|m| m.id).collect();
        assert_eq!(log, vec!["m2", "m1"]);
    }
}
