//! Device-side client: send one report over TLS, read the one response.

use crate::report::DeviceResponse;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use serde_json::Value;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::TlsConnector;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server name: {0}")]
    ServerName(String),

    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("gateway closed the connection without a response")]
    NoResponse,

    #[error("unreadable response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub struct DeviceClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    timeout: Duration,
}

impl DeviceClient {
    /// `server_name` must match a name in the gateway certificate.
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, ClientError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::ServerName(e.to_string()))?;
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a report object and decode the gateway's reply.
    pub async fn send<A: ToSocketAddrs>(&self, addr: A, report: &Value) -> Result<DeviceResponse, ClientError> {
        let body = serde_json::to_vec(report)?;
        let reply = self.send_raw(addr, &body).await?;
        if reply.is_empty() {
            return Err(ClientError::NoResponse);
        }
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Send raw bytes and return whatever comes back before the gateway
    /// closes the connection.
    pub async fn send_raw<A: ToSocketAddrs>(&self, addr: A, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        tokio::time::timeout(self.timeout, self.exchange(addr, payload))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn exchange<A: ToSocketAddrs>(&self, addr: A, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let tcp = TcpStream::connect(addr).await?;
        let mut tls = self.connector.connect(self.server_name.clone(), tcp).await?;

        tls.write_all(payload).await?;
        tls.flush().await?;

        let mut reply = Vec::new();
        match tls.read_to_end(&mut reply).await {
            Ok(_) => {}
            // Gateway closed the socket without close_notify
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e.into()),
        }
        Ok(reply)
    }
}
