//! Send one report to a coldgate gateway and print the reply.

use anyhow::{Context, Result};
use clap::Parser;
use coldgate::client::DeviceClient;
use coldgate::tls::{self, ClientIdentity};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coldgate-send", version)]
#[command(about = "Send a telemetry report to a coldgate gateway")]
struct Args {
    /// Gateway address, host:port
    #[arg(short, long, default_value = "127.0.0.1:5001")]
    addr: String,

    /// Name to verify in the gateway certificate
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// CA that signed the gateway certificate
    #[arg(long, env = "COLDGATE_CA_CERT_FILE")]
    ca: PathBuf,

    /// Client certificate for mutual TLS
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key for mutual TLS
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Report JSON; read from stdin when omitted
    #[arg(short, long)]
    report: Option<String>,

    /// Seconds to wait for the whole exchange
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose > 0 { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let raw = match args.report {
        Some(ref r) => r.clone(),
        None => std::io::read_to_string(std::io::stdin()).context("Failed to read report from stdin")?,
    };
    let report: Value = serde_json::from_str(raw.trim()).context("Report is not valid JSON")?;

    let identity = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(ClientIdentity {
            cert_file: cert,
            key_file: key,
        }),
        _ => None,
    };
    let config = tls::build_client_config(&args.ca, identity).context("Failed to load TLS material")?;

    let client = DeviceClient::new(config, &args.server_name)?.with_timeout(Duration::from_secs(args.timeout));
    debug!(addr = %args.addr, "Sending report");
    let response = client
        .send(args.addr.as_str(), &report)
        .await
        .with_context(|| format!("Exchange with {} failed", args.addr))?;

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}
