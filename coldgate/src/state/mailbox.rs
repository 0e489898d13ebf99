//! Single-slot outgoing command per device.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command: String,
    pub queued_at: DateTime<Utc>,
}

/// Holds at most one pending command per device. Queueing again replaces
/// the previous command; delivery removes it.
#[derive(Debug, Default)]
pub struct CommandMailbox {
    slots: DashMap<String, PendingCommand>,
}

impl CommandMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `command` for the device's next report. Returns the command it
    /// replaced, if any.
    pub fn queue(&self, device_id: &str, command: impl Into<String>) -> Option<String> {
        self.slots
            .insert(
                device_id.to_string(),
                PendingCommand {
                    command: command.into(),
                    queued_at: Utc::now(),
                },
            )
            .map(|prev| prev.command)
    }

    /// Read and clear the device's pending command in one step.
    pub fn take_if_present(&self, device_id: &str) -> Option<String> {
        self.slots.remove(device_id).map(|(_, pending)| pending.command)
    }

    pub fn peek(&self, device_id: &str) -> Option<PendingCommand> {
        self.slots.get(device_id).map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
