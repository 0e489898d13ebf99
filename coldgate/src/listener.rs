//! TCP accept loop with blocklist enforcement and TLS handshakes.
//!
//! The accept loop only does the blocklist lookup. Each admitted connection
//! gets its own task for the handshake and the session, so a slow peer
//! never holds up the loop. The lookup is repeated once the handshake
//! completes, so a ban that lands mid-handshake still ends the connection
//! before any session. Tasks are unbounded; see DESIGN.md.

use crate::blocklist::Blocklist;
use crate::config::ListenerConfig;
use crate::error::TransportError;
use crate::ingest::IngestEngine;
use crate::metrics::{BANS_TOTAL, BLOCKED_CONNECTIONS, HANDSHAKE_FAILURES};
use crate::session::{self, SessionConfig};
use rustls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after an accept error so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    blocklist: Arc<Blocklist>,
    engine: Arc<IngestEngine>,
    session: SessionConfig,
    handshake_timeout: Duration,
    tracker: TaskTracker,
}

impl Listener {
    pub async fn bind(
        cfg: &ListenerConfig,
        tls: Arc<ServerConfig>,
        blocklist: Arc<Blocklist>,
        engine: Arc<IngestEngine>,
    ) -> io::Result<Self> {
        let tcp = TcpListener::bind(cfg.bind_addr).await?;
        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(tls),
            blocklist,
            engine,
            session: SessionConfig::from(cfg),
            handshake_timeout: cfg.handshake_timeout(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Accept until `shutdown` flips to true, then wait for in-flight
    /// sessions to finish on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.local_addr() {
            Ok(addr) => info!("Listening for devices on {}", addr),
            Err(e) => warn!("Listening for devices (address unknown: {})", e),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.tcp);
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(sessions = self.tracker.len(), "Waiting for in-flight sessions");
        }
        self.tracker.wait().await;
        info!("Listener stopped");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if self.blocklist.is_blocked(&peer.ip()) {
            BLOCKED_CONNECTIONS.inc();
            debug!(peer = %peer, "Dropping connection from banned address");
            return;
        }

        let conn = Connection {
            acceptor: self.acceptor.clone(),
            blocklist: Arc::clone(&self.blocklist),
            engine: Arc::clone(&self.engine),
            session: self.session,
            handshake_timeout: self.handshake_timeout,
        };
        self.tracker.spawn(conn.serve(stream, peer));
    }
}

struct Connection {
    acceptor: TlsAcceptor,
    blocklist: Arc<Blocklist>,
    engine: Arc<IngestEngine>,
    session: SessionConfig,
    handshake_timeout: Duration,
}

impl Connection {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let handshake = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream)).await;
        let tls = match handshake {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return self.handshake_failed(peer, TransportError::Handshake(e)).await,
            Err(_) => {
                return self
                    .handshake_failed(peer, TransportError::HandshakeTimeout(self.handshake_timeout))
                    .await
            }
        };

        // The address may have been banned while this handshake was pending.
        if self.blocklist.is_blocked(&peer.ip()) {
            BLOCKED_CONNECTIONS.inc();
            debug!(peer = %peer, "Dropping session from address banned during handshake");
            return;
        }

        self.blocklist.record_success(&peer.ip());
        debug!(peer = %peer, "TLS session established");
        session::handle(tls, peer, &self.engine, &self.session).await;
    }

    async fn handshake_failed(&self, peer: SocketAddr, err: TransportError) {
        HANDSHAKE_FAILURES.inc();
        let ip = peer.ip();
        let blocklist = Arc::clone(&self.blocklist);

        // Ban writes fsync, keep them off the async workers.
        let outcome = tokio::task::spawn_blocking(move || blocklist.record_failure(ip)).await;
        match outcome {
            Ok(Ok(o)) if o.newly_banned => {
                BANS_TOTAL.inc();
                warn!(peer = %peer, failures = o.count, "Address banned after repeated handshake failures: {}", err);
            }
            Ok(Ok(o)) => {
                info!(peer = %peer, failures = o.count, "Handshake failed: {}", err);
            }
            Ok(Err(e)) => {
                error!(peer = %peer, "Handshake failed ({}); could not persist ban: {}", err, e);
            }
            Err(e) => {
                error!(peer = %peer, "Handshake failure accounting task failed: {}", e);
            }
        }
    }
}
