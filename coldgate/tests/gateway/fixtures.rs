//! Shared fixtures: test PKI, recording notifier, running gateway.

use async_trait::async_trait;
use coldgate::blocklist::Blocklist;
use coldgate::client::DeviceClient;
use coldgate::config::{ListenerConfig, TlsConfig};
use coldgate::error::NotifyError;
use coldgate::ingest::IngestEngine;
use coldgate::listener::Listener;
use coldgate::notify::Notifier;
use coldgate::report::{AlarmSet, DeviceReport};
use coldgate::store::DeviceStore;
use coldgate::tls::{self, ClientIdentity};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// CA plus server and client leaf certificates written as PEM files.
pub struct Pki {
    pub dir: TempDir,
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl Pki {
    pub fn generate() -> Self {
        let dir = TempDir::new().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "coldgate test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(vec!["unit-u1.devices".to_string()]).unwrap();
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        let write = |name: &str, pem: String| {
            let path = dir.path().join(name);
            std::fs::write(&path, pem).unwrap();
            path
        };

        Self {
            ca_cert: write("ca.crt", ca.pem()),
            server_cert: write("server.crt", server.pem()),
            server_key: write("server.key", server_key.serialize_pem()),
            client_cert: write("client.crt", client.pem()),
            client_key: write("client.key", client_key.serialize_pem()),
            dir,
        }
    }
}

/// Notifier that remembers every alarm set it was asked to deliver.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(String, AlarmSet)>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }

    pub fn alerts(&self) -> Vec<(String, AlarmSet)> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, report: &DeviceReport) -> Result<(), NotifyError> {
        self.alerts
            .lock()
            .unwrap()
            .push((report.device_id.clone(), report.alarm_codes.clone()));
        Ok(())
    }
}

#[derive(Clone)]
pub struct GatewayOptions {
    pub mutual_tls: bool,
    pub max_failures: u32,
    pub retention_days: u32,
    /// Reuse an existing blocklist file (restart scenarios)
    pub blocklist_file: Option<PathBuf>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            mutual_tls: false,
            max_failures: 3,
            retention_days: 30,
            blocklist_file: None,
        }
    }
}

/// A gateway listening on 127.0.0.1 with its own state.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub engine: Arc<IngestEngine>,
    pub blocklist: Arc<Blocklist>,
    pub notifier: Arc<RecordingNotifier>,
    pub pki: Pki,
    pub state_dir: TempDir,
    pub mutual_tls: bool,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(opts: GatewayOptions) -> Self {
        let pki = Pki::generate();
        let state_dir = TempDir::new().unwrap();

        let tls_cfg = TlsConfig {
            cert_file: pki.server_cert.clone(),
            key_file: pki.server_key.clone(),
            client_ca_file: opts.mutual_tls.then(|| pki.ca_cert.clone()),
            ..TlsConfig::default()
        };
        let server_tls = tls::build_server_config(&tls_cfg).unwrap();

        let blocklist_file = opts
            .blocklist_file
            .clone()
            .unwrap_or_else(|| state_dir.path().join("blocked_ips.json"));
        let blocklist = Arc::new(Blocklist::load(&blocklist_file, opts.max_failures).unwrap());

        let notifier = Arc::new(RecordingNotifier::default());
        let store = DeviceStore::open(state_dir.path().join("received_data"), opts.retention_days).unwrap();
        let engine = Arc::new(IngestEngine::new(store, notifier.clone()));

        let listener_cfg = ListenerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            idle_timeout_secs: 2,
            handshake_timeout_secs: 2,
            ..ListenerConfig::default()
        };
        let listener = Listener::bind(&listener_cfg, server_tls, blocklist.clone(), engine.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(shutdown_rx));

        Self {
            addr,
            engine,
            blocklist,
            notifier,
            pki,
            state_dir,
            mutual_tls: opts.mutual_tls,
            shutdown,
            handle,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state_dir.path().join("received_data")
    }

    pub fn blocklist_file(&self) -> PathBuf {
        self.state_dir.path().join("blocked_ips.json")
    }

    /// Client presenting the test client certificate when mutual TLS is on.
    pub fn client(&self) -> DeviceClient {
        let identity = self.mutual_tls.then(|| ClientIdentity {
            cert_file: &self.pki.client_cert,
            key_file: &self.pki.client_key,
        });
        client_for(&self.pki.ca_cert, identity)
    }

    pub fn anonymous_client(&self) -> DeviceClient {
        client_for(&self.pki.ca_cert, None)
    }

    /// Ask the listener to stop accepting. Sessions already running finish.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop and wait for the listener and its sessions.
    pub async fn stop(self) {
        self.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("listener did not stop")
            .unwrap();
    }

    pub async fn join(self) {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}

fn client_for(ca: &Path, identity: Option<ClientIdentity<'_>>) -> DeviceClient {
    let config = tls::build_client_config(ca, identity).unwrap();
    DeviceClient::new(config, "localhost")
        .unwrap()
        .with_timeout(Duration::from_secs(5))
}

/// Open a plain TCP connection, send bytes that are not a TLS ClientHello,
/// and wait for the gateway to hang up.
pub async fn fail_handshake(addr: SocketAddr) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _ = stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let mut sink = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut sink)).await;
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..150 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
