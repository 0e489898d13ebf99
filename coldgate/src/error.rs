//! Error taxonomy for the gateway.
//!
//! Each category has a fixed blast radius:
//! - [`TransportError`] ends the current connection. Only handshake-phase
//!   failures count toward a ban.
//! - [`ProtocolError`] closes the connection without a response.
//! - [`PersistenceError`] is logged; the session still answers the device.
//! - [`NotifyError`] is logged and swallowed.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Handshake, read or write failure on a single connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("no data for {0:?}")]
    IdleTimeout(Duration),

    #[error("peer closed the connection before a complete message")]
    Closed,

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

impl TransportError {
    /// Whether this failure happened before the session was established.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            TransportError::Handshake(_) | TransportError::HandshakeTimeout(_)
        )
    }
}

/// Undecodable or malformed request payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message exceeds {limit} bytes without a terminating brace")]
    MessageTooLarge { limit: usize },

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("invalid device identifier: {0}")]
    InvalidDeviceId(String),
}

/// Failure reading or writing the on-disk stores.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt JSON in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("background task failed: {0}")]
    Task(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        PersistenceError::Corrupt {
            path: path.into(),
            source,
        }
    }
}

/// Failure answering an operator query about one device.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidDevice(#[from] ProtocolError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Alert delivery failure.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("alert transport failed: {0}")]
    Transport(String),

    #[error("alert endpoint rejected the message: {0}")]
    Rejected(String),
}

/// Why a session ended without a response.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Missing or unusable transport credentials. Fatal at startup.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    Verifier(String),
}
