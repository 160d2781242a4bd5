//! Data models: positions, log messages, presence and gateway events.

pub mod event;
pub mod message;
pub mod position;
pub mod presence;

pub use event::*;
pub use message::{Message, MessageId, MessageKind, MessageRecord, NewMessage};
pub use position::Position;
pub use presence::PresenceEntry;
