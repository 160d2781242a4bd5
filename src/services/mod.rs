//! Sync engine: proximity subscription, presence, retention and sessions.

pub mod presence;
pub mod proximity;
pub mod read_state;
pub mod retention;
pub mod session;

pub use presence::PresenceReconstructor;
pub use proximity::ProximityService;
pub use read_state::ReadSet;
pub use retention::RetentionService;
pub use session::{Session, SessionPhase, SessionService};
