//! One request/response exchange on an established connection.

use crate::config::ListenerConfig;
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::framing::{decode_message, read_message};
use crate::ingest::IngestEngine;
use crate::metrics::{ACTIVE_SESSIONS, REPORTS_ACCEPTED, REPORTS_REJECTED};
use crate::report::{DeviceReport, DeviceResponse};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub max_message_bytes: usize,
}

impl From<&ListenerConfig> for SessionConfig {
    fn from(cfg: &ListenerConfig) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout(),
            max_message_bytes: cfg.max_message_bytes,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from(&ListenerConfig::default())
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The device got a response.
    Responded { device_id: String, status: String },
    /// Valid JSON without a device identifier. Closed without a response.
    Ignored,
    /// Closed without a response.
    Failed(SessionError),
}

struct ActiveGuard;

impl ActiveGuard {
    fn new() -> Self {
        ACTIVE_SESSIONS.inc();
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_SESSIONS.dec();
    }
}

/// Serve one request on `stream`, then close it.
pub async fn handle<S>(mut stream: S, peer: SocketAddr, engine: &IngestEngine, cfg: &SessionConfig) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _active = ActiveGuard::new();
    let (outcome, ingested) = exchange(&mut stream, peer, engine, cfg).await;
    let _ = stream.shutdown().await;

    match &outcome {
        SessionOutcome::Failed(SessionError::Protocol(e)) => {
            REPORTS_REJECTED.with_label_values(&[reject_reason(e)]).inc();
            warn!(peer = %peer, "Rejected request: {}", e);
        }
        SessionOutcome::Failed(SessionError::Transport(e)) => {
            debug!(peer = %peer, "Session ended without response: {}", e);
        }
        SessionOutcome::Ignored => {
            REPORTS_REJECTED.with_label_values(&["no_device_id"]).inc();
            debug!(peer = %peer, "Request without device identifier ignored");
        }
        SessionOutcome::Responded { .. } => {}
    }

    // Any report that reached ingestion triggers a sweep, answered or not.
    if ingested {
        engine.sweep_retention().await;
    }
    outcome
}

/// Returns the outcome and whether the report was handed to ingestion.
async fn exchange<S>(
    stream: &mut S,
    peer: SocketAddr,
    engine: &IngestEngine,
    cfg: &SessionConfig,
) -> (SessionOutcome, bool)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let buf = match read_message(stream, cfg.idle_timeout, cfg.max_message_bytes).await {
        Ok(b) => b,
        Err(e) => return (SessionOutcome::Failed(e.into()), false),
    };

    let object = match decode_message(&buf) {
        Ok(o) => o,
        Err(e) => return (SessionOutcome::Failed(e.into()), false),
    };

    let report = match DeviceReport::from_object(object) {
        Ok(Some(r)) => r,
        Ok(None) => return (SessionOutcome::Ignored, false),
        Err(e) => return (SessionOutcome::Failed(e.into()), false),
    };

    REPORTS_ACCEPTED.inc();
    info!(
        peer = %peer,
        device_id = %report.device_id,
        alarms = report.alarm_codes.len(),
        "Report received"
    );
    engine.ingest(&report).await;

    let response = match engine.take_command(&report.device_id) {
        Some(command) => DeviceResponse::command(command),
        None => DeviceResponse::received(),
    };

    if let Err(e) = send_response(stream, &response).await {
        warn!(peer = %peer, device_id = %report.device_id, "Failed to send response: {}", e);
        return (SessionOutcome::Failed(e.into()), true);
    }

    let outcome = SessionOutcome::Responded {
        device_id: report.device_id,
        status: response.status,
    };
    (outcome, true)
}

async fn send_response<S>(stream: &mut S, response: &DeviceResponse) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(response)
        .map_err(|e| TransportError::Write(std::io::Error::other(e)))?;
    stream.write_all(&body).await.map_err(TransportError::Write)?;
    stream.flush().await.map_err(TransportError::Write)
}

fn reject_reason(e: &ProtocolError) -> &'static str {
    match e {
        ProtocolError::MessageTooLarge { .. } => "too_large",
        ProtocolError::InvalidJson(_) => "invalid_json",
        ProtocolError::NotAnObject => "not_an_object",
        ProtocolError::InvalidDeviceId(_) => "invalid_device_id",
    }
}
