//! Alarm notification delivery.
//!
//! The ingestion engine calls a [`Notifier`] once per new or changed alarm
//! set. Failures come back as [`NotifyError`] and are logged by the caller;
//! they never reach the device.

use crate::config::LogFormat;
use crate::error::NotifyError;
use crate::report::DeviceReport;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::warn;

const MISSING: &str = "N/A";

/// Something that can deliver an alarm alert.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert for `report`, whose alarm set is non-empty.
    async fn notify(&self, report: &DeviceReport) -> Result<(), NotifyError>;
}

/// Rendered alert, transport independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
    pub device_id: String,
    pub timestamp: Option<String>,
    pub alarm_codes: Vec<i64>,
}

impl AlertMessage {
    pub fn from_report(report: &DeviceReport) -> Self {
        let codes: Vec<i64> = report.alarm_codes.iter().copied().collect();
        let joined = codes
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        let mut body = String::new();
        let _ = writeln!(body, "**ALARM ALERT**");
        let _ = writeln!(body, "Timestamp: {}", report.timestamp.as_deref().unwrap_or(MISSING));
        let _ = writeln!(body, "Unit Number: {}", report.device_id);
        let _ = writeln!(body, "Alarm Codes: {}", joined);
        let _ = writeln!(body);
        let _ = writeln!(body, "System Status:");
        let _ = writeln!(body, "- Setpoint: {}", display_field(report, "setpoint"));
        let _ = writeln!(body, "- Status: {}", display_field(report, "status"));
        let _ = writeln!(body, "- Return Temp: {}", temperature(report, "return_temp"));
        let _ = writeln!(body, "- Supply Temp: {}", temperature(report, "supply_temp"));
        let _ = writeln!(body, "- Coil Temp: {}", temperature(report, "coil_temp"));

        Self {
            subject: format!("ALARM: Unit {} Detected!", report.device_id),
            body,
            device_id: report.device_id.clone(),
            timestamp: report.timestamp.clone(),
            alarm_codes: codes,
        }
    }
}

fn display_field(report: &DeviceReport, name: &str) -> String {
    match report.field(name) {
        None | Some(Value::Null) => MISSING.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn temperature(report: &DeviceReport, name: &str) -> String {
    match report.field(name) {
        None | Some(Value::Null) => MISSING.to_string(),
        Some(_) => format!("{}°F", display_field(report, name)),
    }
}

/// Writes alerts to stdout in the configured log format.
#[derive(Debug, Clone, Copy)]
pub struct LogNotifier {
    format: LogFormat,
}

impl LogNotifier {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }

    fn render(&self, alert: &AlertMessage) -> String {
        match self.format {
            LogFormat::Json => serde_json::to_string(alert).unwrap_or_else(|_| alert.subject.clone()),
            LogFormat::Text => format!("{}\n{}", alert.subject, alert.body),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &DeviceReport) -> Result<(), NotifyError> {
        let alert = AlertMessage::from_report(report);
        println!("{}", self.render(&alert));
        Ok(())
    }
}

/// POSTs the rendered alert as JSON.
#[cfg(feature = "webhooks")]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "webhooks")]
impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[cfg(feature = "webhooks")]
#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, report: &DeviceReport) -> Result<(), NotifyError> {
        let alert = AlertMessage::from_report(report);
        let resp = self
            .client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(format!("{}: {}", self.url, e)))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(format!("{} returned {}", self.url, resp.status())))
        }
    }
}

/// Delivers through every inner notifier. One failing does not stop the
/// others; the first error is returned.
#[derive(Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: Arc<dyn Notifier>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, report: &DeviceReport) -> Result<(), NotifyError> {
        let mut first_err = None;
        for target in &self.targets {
            if let Err(e) = target.notify(report).await {
                warn!(device_id = %report.device_id, "Notifier failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
