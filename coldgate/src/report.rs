//! Device report model and normalisation.
//!
//! A report is kept twice: the JSON object exactly as the device sent it
//! (what gets persisted) and the handful of fields the gateway acts on.

use crate::error::ProtocolError;
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

/// Field carrying the device identifier.
pub const DEVICE_ID_FIELD: &str = "unit";
/// Older controllers identify themselves with this field instead.
pub const LEGACY_DEVICE_ID_FIELD: &str = "trl";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const ALARM_CODES_FIELD: &str = "alarm_codes";

/// `HH:MM:SS  MM:DD:YYYY` (two spaces between the halves).
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S  %m:%d:%Y";

/// Set of active alarm codes in a report.
pub type AlarmSet = BTreeSet<i64>;

/// A telemetry report from one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub device_id: String,
    pub timestamp: Option<String>,
    pub alarm_codes: AlarmSet,
    raw: Map<String, Value>,
}

impl DeviceReport {
    /// Build a report from a decoded JSON object.
    ///
    /// Returns `Ok(None)` when the object carries no device identifier; such
    /// traffic is not telemetry and gets no response.
    pub fn from_object(raw: Map<String, Value>) -> Result<Option<Self>, ProtocolError> {
        let id_value = match raw
            .get(DEVICE_ID_FIELD)
            .or_else(|| raw.get(LEGACY_DEVICE_ID_FIELD))
        {
            Some(v) => v,
            None => return Ok(None),
        };

        let device_id = match id_value {
            Value::String(s) => s.clone(),
            other => return Err(ProtocolError::InvalidDeviceId(other.to_string())),
        };
        validate_device_id(&device_id)?;

        let timestamp = raw
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        let alarm_codes = raw
            .get(ALARM_CODES_FIELD)
            .map(normalize_alarm_codes)
            .unwrap_or_default();

        Ok(Some(Self {
            device_id,
            timestamp,
            alarm_codes,
            raw,
        }))
    }

    /// The object as received, which is what the device store persists.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// Look up any telemetry field, known or not.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }

    /// Telemetry fields the gateway does not interpret.
    pub fn telemetry(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.raw.iter().filter(|(k, _)| {
            !matches!(
                k.as_str(),
                DEVICE_ID_FIELD | LEGACY_DEVICE_ID_FIELD | TIMESTAMP_FIELD | ALARM_CODES_FIELD
            )
        })
    }

    /// Parsed report time, if the device sent one in the expected format.
    pub fn parsed_timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    pub fn has_alarms(&self) -> bool {
        !self.alarm_codes.is_empty()
    }
}

/// Normalise an `alarm_codes` value into a set.
///
/// A comma-joined string keeps only the all-digit tokens. A list keeps its
/// integer entries. Anything else is treated as no alarms.
pub fn normalize_alarm_codes(value: &Value) -> AlarmSet {
    match value {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()))
            .filter_map(|t| t.parse::<i64>().ok())
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| {
                let code = v.as_i64();
                if code.is_none() {
                    debug!(entry = %v, "Ignoring non-integer alarm code");
                }
                code
            })
            .collect(),
        Value::Null => AlarmSet::new(),
        other => {
            debug!(value = %other, "Unrecognised alarm_codes shape");
            AlarmSet::new()
        }
    }
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()
}

/// Device ids name files on disk, so anything that could leave the data
/// directory or collide with the date separator parsing is refused.
pub fn validate_device_id(id: &str) -> Result<(), ProtocolError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if bad {
        Err(ProtocolError::InvalidDeviceId(id.to_string()))
    } else {
        Ok(())
    }
}

/// Reply sent to the device. `status` is `"Received"` or a queued command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct DeviceResponse {
    pub status: String,
}

impl DeviceResponse {
    pub const RECEIVED: &'static str = "Received";

    pub fn received() -> Self {
        Self {
            status: Self::RECEIVED.to_string(),
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            status: command.into(),
        }
    }
}
