use anyhow::{Context, Result};
use clap::Parser;
use coldgate::admin::{self, AdminState};
use coldgate::blocklist::Blocklist;
use coldgate::config::Config;
use coldgate::ingest::IngestEngine;
use coldgate::listener::Listener;
use coldgate::metrics;
use coldgate::notify::{FanoutNotifier, LogNotifier, Notifier};
use coldgate::store::DeviceStore;
use coldgate::tls;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coldgate", version)]
#[command(about = "Secure telemetry ingestion gateway for refrigeration and HVAC controllers")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/coldgate/config.toml")]
    config: PathBuf,

    /// Device listener address (overrides listener.bind_addr)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Server certificate chain, PEM
    #[arg(long, env = "COLDGATE_CERT_FILE")]
    cert: Option<PathBuf>,

    /// Server private key, PEM
    #[arg(long, env = "COLDGATE_KEY_FILE")]
    key: Option<PathBuf>,

    /// CA for client certificates; enables mutual TLS
    #[arg(long, env = "COLDGATE_CA_CERT_FILE")]
    client_ca: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json: bool,

    /// Disable the admin/health endpoint
    #[arg(long)]
    no_admin: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.bind {
            config.listener.bind_addr = addr;
        }
        if let Some(ref cert) = self.cert {
            config.tls.cert_file = cert.clone();
        }
        if let Some(ref key) = self.key {
            config.tls.key_file = key.clone();
        }
        if let Some(ref ca) = self.client_ca {
            config.tls.client_ca_file = Some(ca.clone());
        }
        if self.no_admin {
            config.admin.enabled = false;
        }
    }
}

fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    let fanout = FanoutNotifier::new().with(Arc::new(LogNotifier::new(config.general.log_format)));

    #[cfg(feature = "webhooks")]
    let fanout = match config.notify.webhook_url {
        Some(ref url) => {
            let webhook = coldgate::notify::WebhookNotifier::new(
                url.clone(),
                std::time::Duration::from_secs(config.notify.webhook_timeout_secs),
            )
            .context("Failed to build webhook client")?;
            info!("Alarm webhook: {}", url);
            fanout.with(Arc::new(webhook))
        }
        None => fanout,
    };

    #[cfg(not(feature = "webhooks"))]
    if config.notify.webhook_url.is_some() {
        warn!("notify.webhook_url is set but this build lacks the `webhooks` feature");
    }

    Ok(Arc::new(fanout))
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to set up SIGTERM handler: {}", e);
            None
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
        _ = async {
            match term.as_mut() {
                Some(t) => { t.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config)?;
    args.apply(&mut config);
    config.validate()?;

    let directive = config.general.filter_directive(args.verbose);
    let filter = EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .with_context(|| format!("Invalid log filter {:?}", directive))?,
    );

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.with_target(false).init();
    }

    info!("coldgate v{}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", args.config.display());

    // Refuse to run without usable credentials
    let server_tls = tls::build_server_config(&config.tls).with_context(|| {
        format!(
            "Failed to load TLS credentials (cert {}, key {})",
            config.tls.cert_file.display(),
            config.tls.key_file.display()
        )
    })?;

    let blocklist = Arc::new(
        Blocklist::load_or_recover(&config.blocklist.file, config.blocklist.max_failed_handshakes)
            .with_context(|| format!("Failed to load blocklist {}", config.blocklist.file.display()))?,
    );
    let store = DeviceStore::open(&config.storage.data_dir, config.storage.retention_days)
        .with_context(|| format!("Failed to open data directory {}", config.storage.data_dir.display()))?;
    let engine = Arc::new(IngestEngine::new(store, build_notifier(&config)?));

    info!(
        data_dir = %config.storage.data_dir.display(),
        retention_days = config.storage.retention_days,
        banned = blocklist.banned().len(),
        mutual_tls = config.tls.client_ca_file.is_some(),
        "Gateway state loaded"
    );

    metrics::init();
    let (ready_tx, ready_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = if config.admin.enabled {
        let state = AdminState {
            engine: Arc::clone(&engine),
            ready: ready_rx.clone(),
        };
        let addr = config.admin.bind_addr;
        let stop = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            admin::serve(addr, state, stop).await;
        }))
    } else {
        None
    };

    let listener = Listener::bind(&config.listener, server_tls, Arc::clone(&blocklist), Arc::clone(&engine))
        .await
        .with_context(|| format!("Failed to bind {}", config.listener.bind_addr))?;
    let listener_handle = tokio::spawn(listener.run(shutdown_rx));

    let _ = ready_tx.send(true);
    info!("coldgate running. Press Ctrl+C to stop.");
    if config.admin.enabled {
        info!("Admin API at http://{}/api/devices", config.admin.bind_addr);
    }

    let config_path = args.config.clone();
    tokio::spawn(async move {
        let mut sig = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to set up SIGHUP handler: {}", e);
                return;
            }
        };
        while sig.recv().await.is_some() {
            info!("Received SIGHUP, checking config...");
            match Config::load(&config_path) {
                // Running listeners keep their settings; a restart applies them
                Ok(_) => info!("Config parsed; restart to apply changes"),
                Err(e) => warn!("Config reload failed: {:#}", e),
            }
        }
    });

    shutdown_signal().await;

    info!("Shutting down, no longer accepting connections...");
    let _ = ready_tx.send(false);
    let _ = shutdown_tx.send(true);

    if let Err(e) = listener_handle.await {
        error!("Listener task failed: {}", e);
    }
    if let Some(handle) = admin_handle {
        if let Err(e) = handle.await {
            error!("Admin task failed: {}", e);
        }
    }

    info!("coldgate stopped.");
    Ok(())
}
