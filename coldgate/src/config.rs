//! TOML-based configuration for the gateway.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5001";
const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:5008";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
const DEFAULT_MAX_FAILED_HANDSHAKES: u32 = 3;
const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

const DEFAULT_CERT_FILE: &str = "/etc/coldgate/tls/cert.pem";
const DEFAULT_KEY_FILE: &str = "/etc/coldgate/tls/key.pem";
const DEFAULT_BLOCKLIST_FILE: &str = "/var/lib/coldgate/blocked_ips.json";
const DEFAULT_DATA_DIR: &str = "/var/lib/coldgate/received_data";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub blocklist: BlocklistConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Format used when alerts are written to the log stream
    #[serde(default)]
    pub log_format: LogFormat,
}

impl GeneralConfig {
    /// Base log filter: `log_level` unless `-v` flags raise it.
    pub fn filter_directive(&self, verbose: u8) -> String {
        match verbose {
            0 => self.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

/// Device-facing socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listen_addr")]
    pub bind_addr: SocketAddr,
    /// Close a session after this long without receiving bytes
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Abandon (and count as failed) handshakes slower than this
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Upper bound on a single request before the closing brace arrives
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl ListenerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Transport credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Trust root for client certificates. Setting it turns on mutual authentication.
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
    #[serde(default)]
    pub min_version: TlsVersion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistConfig {
    #[serde(default = "default_blocklist_file")]
    pub file: PathBuf,
    /// Failed handshakes from one address before it is banned
    #[serde(default = "default_max_failed_handshakes")]
    pub max_failed_handshakes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Report logs dated more than this many days ago are swept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// POST alerts here (requires the `webhooks` feature)
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_addr")]
    pub bind_addr: SocketAddr,
}

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_listen_addr() -> SocketAddr { parse_addr(DEFAULT_LISTEN_ADDR) }
fn default_admin_addr() -> SocketAddr { parse_addr(DEFAULT_ADMIN_ADDR) }
fn default_idle_timeout() -> u64 { DEFAULT_IDLE_TIMEOUT_SECS }
fn default_handshake_timeout() -> u64 { DEFAULT_HANDSHAKE_TIMEOUT_SECS }
fn default_max_message_bytes() -> usize { DEFAULT_MAX_MESSAGE_BYTES }
fn default_max_failed_handshakes() -> u32 { DEFAULT_MAX_FAILED_HANDSHAKES }
fn default_retention_days() -> u32 { DEFAULT_RETENTION_DAYS }
fn default_webhook_timeout() -> u64 { DEFAULT_WEBHOOK_TIMEOUT_SECS }
fn default_cert_file() -> PathBuf { PathBuf::from(DEFAULT_CERT_FILE) }
fn default_key_file() -> PathBuf { PathBuf::from(DEFAULT_KEY_FILE) }
fn default_blocklist_file() -> PathBuf { PathBuf::from(DEFAULT_BLOCKLIST_FILE) }
fn default_data_dir() -> PathBuf { PathBuf::from(DEFAULT_DATA_DIR) }

fn parse_addr(s: &str) -> SocketAddr {
    s.parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)))
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_listen_addr(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            client_ca_file: None,
            min_version: TlsVersion::Tls12,
        }
    }
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            file: default_blocklist_file(),
            max_failed_handshakes: DEFAULT_MAX_FAILED_HANDSHAKES,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_admin_addr(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings that would disable a safety mechanism outright.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.retention_days == 0 {
            bail!("storage.retention_days must be at least 1");
        }
        if self.blocklist.max_failed_handshakes == 0 {
            bail!("blocklist.max_failed_handshakes must be at least 1");
        }
        if self.listener.idle_timeout_secs == 0 {
            bail!("listener.idle_timeout_secs must be greater than 0");
        }
        if self.listener.handshake_timeout_secs == 0 {
            bail!("listener.handshake_timeout_secs must be greater than 0");
        }
        if self.listener.max_message_bytes == 0 {
            bail!("listener.max_message_bytes must be greater than 0");
        }
        self.general
            .log_level
            .parse::<tracing_subscriber::filter::Directive>()
            .with_context(|| format!("general.log_level {:?} is not a log filter", self.general.log_level))?;
        Ok(())
    }
}
