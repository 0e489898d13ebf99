//! In-memory state shared by all sessions.
//!
//! - Alarm state per device for notification deduplication
//! - Single-slot command mailbox per device
//! - Per-key locks serialising work on one device
//!
//! Everything here is keyed by device id and locked per key, so sessions for
//! unrelated devices never wait on each other.

pub mod alarms;
mod locks;
pub mod mailbox;

pub use alarms::{AlarmEntry, AlarmTracker, AlarmTransition};
pub use locks::{KeyGuard, KeyedLocks};
pub use mailbox::{CommandMailbox, PendingCommand};

/// Statistics about the in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStats {
    pub active_alarms: usize,
    pub pending_commands: usize,
}
