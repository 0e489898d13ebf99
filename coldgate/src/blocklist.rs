//! Source-address blocklist with handshake failure counting.
//!
//! Failure counters live in memory only and reset on restart. Bans are
//! persisted as a JSON array of addresses and never expire on their own;
//! removing one means editing the file while the gateway is stopped.
//! Entries that do not parse as an address are ignored for matching but
//! written back unchanged on the next save.

use crate::error::PersistenceError;
use crate::persistence::JsonFile;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct Inner {
    banned: BTreeSet<IpAddr>,
    unparsed: Vec<String>,
    failures: HashMap<IpAddr, u32>,
}

/// Result of recording a failed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Consecutive failures recorded for the address
    pub count: u32,
    /// The address was banned by this failure
    pub newly_banned: bool,
}

/// Banned addresses plus per-address failure counters.
///
/// A single lock guards both; bans are rare and the check is a set lookup.
#[derive(Debug)]
pub struct Blocklist {
    file: JsonFile,
    max_failures: u32,
    inner: Mutex<Inner>,
}

impl Blocklist {
    /// Load persisted bans from `path`. A missing file is an empty list.
    pub fn load(path: impl AsRef<Path>, max_failures: u32) -> Result<Self, PersistenceError> {
        let file = JsonFile::new(path.as_ref());
        let entries: Vec<String> = file.load()?.unwrap_or_default();

        let mut banned = BTreeSet::new();
        let mut unparsed = Vec::new();
        for entry in entries {
            match entry.trim().parse::<IpAddr>() {
                Ok(ip) => {
                    banned.insert(ip);
                }
                Err(_) => {
                    warn!(entry = %entry, "Ignoring unparseable blocklist entry");
                    unparsed.push(entry);
                }
            }
        }

        if !banned.is_empty() {
            info!(count = banned.len(), file = %file.path().display(), "Loaded blocklist");
        }

        Ok(Self {
            file,
            max_failures: max_failures.max(1),
            inner: Mutex::new(Inner {
                banned,
                unparsed,
                failures: HashMap::new(),
            }),
        })
    }

    /// Like [`Blocklist::load`], but a file that is not valid JSON is moved
    /// aside to `<name>.corrupt` and the gateway starts with no bans.
    ///
    /// A file that cannot be read is an error; the bans in it still hold.
    pub fn load_or_recover(path: impl AsRef<Path>, max_failures: u32) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        match Self::load(path, max_failures) {
            Err(e @ PersistenceError::Corrupt { .. }) => {
                error!("Blocklist corrupt, starting empty: {}", e);
                let mut aside = path.as_os_str().to_os_string();
                aside.push(".corrupt");
                if let Err(e) = std::fs::rename(path, &aside) {
                    warn!("Could not move corrupt blocklist aside: {}", e);
                }
                Ok(Self {
                    file: JsonFile::new(path),
                    max_failures: max_failures.max(1),
                    inner: Mutex::new(Inner::default()),
                })
            }
            other => other,
        }
    }

    pub fn is_blocked(&self, addr: &IpAddr) -> bool {
        self.lock().banned.contains(addr)
    }

    /// Count a failed handshake, banning the address once it reaches the
    /// threshold. The ban is written to disk before this returns.
    pub fn record_failure(&self, addr: IpAddr) -> Result<FailureOutcome, PersistenceError> {
        let mut inner = self.lock();
        let count = {
            let c = inner.failures.entry(addr).or_insert(0);
            *c = c.saturating_add(1);
            *c
        };

        if count < self.max_failures || inner.banned.contains(&addr) {
            return Ok(FailureOutcome {
                count,
                newly_banned: false,
            });
        }

        inner.banned.insert(addr);
        self.persist(&inner)?;
        Ok(FailureOutcome {
            count,
            newly_banned: true,
        })
    }

    /// Forget earlier failures after a successful handshake.
    pub fn record_success(&self, addr: &IpAddr) {
        self.lock().failures.remove(addr);
    }

    /// Ban `addr` immediately. Returns whether it was newly added.
    pub fn ban(&self, addr: IpAddr) -> Result<bool, PersistenceError> {
        let mut inner = self.lock();
        if !inner.banned.insert(addr) {
            return Ok(false);
        }
        self.persist(&inner)?;
        Ok(true)
    }

    pub fn failure_count(&self, addr: &IpAddr) -> u32 {
        self.lock().failures.get(addr).copied().unwrap_or(0)
    }

    pub fn banned(&self) -> Vec<IpAddr> {
        self.lock().banned.iter().copied().collect()
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    fn persist(&self, inner: &Inner) -> Result<(), PersistenceError> {
        let entries: Vec<String> = inner
            .banned
            .iter()
            .map(IpAddr::to_string)
            .chain(inner.unparsed.iter().cloned())
            .collect();
        self.file.save(&entries)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
