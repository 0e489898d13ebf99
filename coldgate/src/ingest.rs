//! Per-report orchestration and the operator-facing interface.
//!
//! [`IngestEngine`] owns every piece of shared state a session touches: the
//! device store, alarm tracker and command mailbox. Sessions and the admin
//! API get it through an `Arc`; nothing here is global.

use crate::error::{PersistenceError, ProtocolError, QueryError};
use crate::metrics::{
    COMMANDS_DELIVERED, NOTIFICATIONS_FAILED, NOTIFICATIONS_SENT, PERSISTENCE_FAILURES,
};
use crate::notify::Notifier;
use crate::report::{validate_device_id, AlarmSet, DeviceReport};
use crate::state::{AlarmEntry, AlarmTracker, AlarmTransition, CommandMailbox, StateStats};
use crate::store::{DeviceStore, Record, SweepReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Report was appended to the device store
    pub persisted: bool,
    pub transition: AlarmTransition,
    /// `Some(delivered)` when a notification was attempted
    pub notified: Option<bool>,
}

pub struct IngestEngine {
    store: DeviceStore,
    alarms: AlarmTracker,
    mailbox: CommandMailbox,
    notifier: Arc<dyn Notifier>,
    sweeping: AtomicBool,
}

impl IngestEngine {
    pub fn new(store: DeviceStore, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            alarms: AlarmTracker::new(),
            mailbox: CommandMailbox::new(),
            notifier,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Persist the report, update alarm state and notify if the alarm set is
    /// new. Failures are logged here and never returned to the session.
    pub async fn ingest(&self, report: &DeviceReport) -> IngestOutcome {
        let device_id = report.device_id.as_str();

        if report.parsed_timestamp().is_none() {
            warn!(
                device_id,
                timestamp = report.timestamp.as_deref().unwrap_or(""),
                "Report timestamp missing or unparseable; storing as received"
            );
        }

        let persisted = match self.store.append_today(device_id, report.raw()).await {
            Ok(count) => {
                debug!(device_id, records_today = count, "Report stored");
                true
            }
            Err(e) => {
                PERSISTENCE_FAILURES.inc();
                error!(device_id, "Failed to store report: {}", e);
                false
            }
        };

        let transition = self.alarms.evaluate(device_id, &report.alarm_codes);
        match &transition {
            AlarmTransition::Raised => {
                info!(device_id, codes = ?report.alarm_codes, "Alarm raised")
            }
            AlarmTransition::Changed { previous } => {
                info!(device_id, codes = ?report.alarm_codes, previous = ?previous, "Alarm set changed")
            }
            AlarmTransition::Unchanged => {
                debug!(device_id, codes = ?report.alarm_codes, "Alarm already notified")
            }
            AlarmTransition::Cleared { previous } => {
                info!(device_id, previous = ?previous, "Alarm cleared")
            }
            AlarmTransition::Idle => {}
        }

        let notified = if transition.should_notify() {
            Some(self.notify(report).await)
        } else {
            None
        };

        IngestOutcome {
            persisted,
            transition,
            notified,
        }
    }

    async fn notify(&self, report: &DeviceReport) -> bool {
        match self.notifier.notify(report).await {
            Ok(()) => {
                NOTIFICATIONS_SENT.inc();
                true
            }
            Err(e) => {
                NOTIFICATIONS_FAILED.inc();
                warn!(device_id = %report.device_id, "Alarm notification failed: {}", e);
                false
            }
        }
    }

    /// Take the device's pending command for delivery in this response.
    pub fn take_command(&self, device_id: &str) -> Option<String> {
        let command = self.mailbox.take_if_present(device_id);
        if let Some(ref c) = command {
            COMMANDS_DELIVERED.inc();
            info!(device_id, command = %c, "Delivering queued command");
        }
        command
    }

    /// Run a retention sweep unless one is already in progress.
    pub async fn sweep_retention(&self) -> Option<SweepReport> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return None;
        }
        let result = self.store.sweep().await;
        self.sweeping.store(false, Ordering::Release);

        match result {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Retention sweep failed: {}", e);
                None
            }
        }
    }

    // Admin interface

    /// Queue `command` for the device's next report, replacing any pending
    /// one. Returns the replaced command.
    pub fn queue_command(&self, device_id: &str, command: &str) -> Result<Option<String>, ProtocolError> {
        validate_device_id(device_id)?;
        let replaced = self.mailbox.queue(device_id, command);
        match &replaced {
            Some(prev) => info!(device_id, command, replaced = %prev, "Command queued, replacing pending command"),
            None => info!(device_id, command, "Command queued"),
        }
        Ok(replaced)
    }

    pub async fn list_devices(&self) -> Result<Vec<String>, PersistenceError> {
        self.store.list_devices().await
    }

    /// Stored records for the device in report-time order.
    pub async fn get_records(&self, device_id: &str) -> Result<Vec<Record>, QueryError> {
        validate_device_id(device_id)?;
        Ok(self.store.records(device_id).await?)
    }

    pub fn current_alarm_state(&self, device_id: &str) -> Option<AlarmSet> {
        self.alarms.current(device_id)
    }

    pub fn alarm_entry(&self, device_id: &str) -> Option<AlarmEntry> {
        self.alarms.entry(device_id)
    }

    pub fn pending_command(&self, device_id: &str) -> Option<String> {
        self.mailbox.peek(device_id).map(|p| p.command)
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            active_alarms: self.alarms.len(),
            pending_commands: self.mailbox.len(),
        }
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }
}
