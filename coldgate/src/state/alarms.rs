//! Per-device alarm state for notification deduplication.

use crate::report::AlarmSet;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Last notified alarm set for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEntry {
    /// Codes included in the last notification
    pub codes: AlarmSet,
    /// When this set was first reported
    pub first_seen: DateTime<Utc>,
    /// When this set was last reported
    pub last_seen: DateTime<Utc>,
    /// Reports carrying this exact set, including the first
    pub count: u64,
}

impl AlarmEntry {
    fn new(codes: AlarmSet) -> Self {
        let now = Utc::now();
        Self {
            codes,
            first_seen: now,
            last_seen: now,
            count: 1,
        }
    }

    fn record_occurrence(&mut self) {
        self.last_seen = Utc::now();
        self.count += 1;
    }
}

/// Outcome of evaluating one report's alarm set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmTransition {
    /// No prior alarms; notify.
    Raised,
    /// Prior set differs from this one; notify.
    Changed { previous: AlarmSet },
    /// Same set as already notified; suppress.
    Unchanged,
    /// Empty set cleared an active alarm; no notification.
    Cleared { previous: AlarmSet },
    /// Empty set, nothing active.
    Idle,
}

impl AlarmTransition {
    pub fn should_notify(&self) -> bool {
        matches!(self, AlarmTransition::Raised | AlarmTransition::Changed { .. })
    }
}

/// Tracks the most recently notified alarm set per device.
///
/// Each evaluation holds only that device's map entry, so devices never
/// serialise against one another.
#[derive(Debug, Default)]
pub struct AlarmTracker {
    active: DashMap<String, AlarmEntry>,
}

impl AlarmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `incoming` to the device's state and report what changed.
    pub fn evaluate(&self, device_id: &str, incoming: &AlarmSet) -> AlarmTransition {
        if incoming.is_empty() {
            return match self.active.remove(device_id) {
                Some((_, prior)) => AlarmTransition::Cleared {
                    previous: prior.codes,
                },
                None => AlarmTransition::Idle,
            };
        }

        match self.active.entry(device_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(AlarmEntry::new(incoming.clone()));
                AlarmTransition::Raised
            }
            Entry::Occupied(mut slot) => {
                if slot.get().codes == *incoming {
                    slot.get_mut().record_occurrence();
                    AlarmTransition::Unchanged
                } else {
                    let prior = slot.insert(AlarmEntry::new(incoming.clone()));
                    AlarmTransition::Changed {
                        previous: prior.codes,
                    }
                }
            }
        }
    }

    /// Currently active (notified) alarm set, if any.
    pub fn current(&self, device_id: &str) -> Option<AlarmSet> {
        self.active.get(device_id).map(|e| e.codes.clone())
    }

    pub fn entry(&self, device_id: &str) -> Option<AlarmEntry> {
        self.active.get(device_id).map(|e| e.value().clone())
    }

    /// Number of devices with an active alarm.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
