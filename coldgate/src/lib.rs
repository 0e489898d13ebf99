//! coldgate - secure telemetry ingestion gateway
//!
//! Field controllers (refrigeration and HVAC units) connect over TLS, send
//! one JSON report and get back either an acknowledgement or a command an
//! operator queued for them. Reports are stored per device and per day;
//! alarm notifications are deduplicated per device.
//!
//! The `coldgate` binary wires these modules into a daemon; `coldgate-send`
//! is the device-side counterpart used for diagnostics.

pub mod admin;
pub mod blocklist;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod ingest;
pub mod listener;
pub mod metrics;
pub mod notify;
pub mod persistence;
pub mod report;
pub mod session;
pub mod state;
pub mod store;
pub mod tls;

// Re-export commonly used types
pub use config::Config;
pub use ingest::{IngestEngine, IngestOutcome};
pub use report::{AlarmSet, DeviceReport, DeviceResponse};
