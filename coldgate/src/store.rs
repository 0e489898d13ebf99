//! Append-only per-device, per-day report log.
//!
//! Reports for device `U1` received on 2025-06-15 (local time) live in
//! `<data_dir>/U1_2025-06-15.json` as a JSON array in arrival order. Each
//! append is a read-append-replace cycle, serialised per device so that two
//! reports for the same device cannot lose one another.

use crate::error::PersistenceError;
use crate::persistence::JsonFile;
use crate::report::{parse_timestamp, TIMESTAMP_FIELD};
use crate::state::KeyedLocks;
use chrono::{Days, Local, NaiveDate};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FILE_EXTENSION: &str = "json";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// A stored report object.
pub type Record = Map<String, Value>;

/// Summary of one retention sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct DeviceStore {
    data_dir: PathBuf,
    retention_days: u32,
    locks: KeyedLocks,
}

impl DeviceStore {
    /// Open (and create if needed) the store rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, retention_days: u32) -> Result<Self, PersistenceError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| PersistenceError::io(&data_dir, e))?;
        Ok(Self {
            data_dir,
            retention_days,
            locks: KeyedLocks::new(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Devices with an append or read in progress.
    pub fn locks_held(&self) -> usize {
        self.locks.len()
    }

    pub fn file_path(&self, device_id: &str, date: NaiveDate) -> PathBuf {
        self.data_dir.join(format!(
            "{}_{}.{}",
            device_id,
            date.format(DATE_FORMAT),
            FILE_EXTENSION
        ))
    }

    /// Append `record` to today's log for the device.
    pub async fn append_today(&self, device_id: &str, record: &Record) -> Result<usize, PersistenceError> {
        self.append(device_id, Local::now().date_naive(), record).await
    }

    /// Append `record` to the device's log for `date`. Returns the number of
    /// records in that file afterwards.
    pub async fn append(
        &self,
        device_id: &str,
        date: NaiveDate,
        record: &Record,
    ) -> Result<usize, PersistenceError> {
        let _guard = self.locks.lock(device_id).await;
        let file = JsonFile::new(self.file_path(device_id, date));
        let record = record.clone();

        tokio::task::spawn_blocking(move || append_blocking(&file, record))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    /// Records stored for `device_id` on `date`, verbatim and in arrival order.
    pub async fn day_records(&self, device_id: &str, date: NaiveDate) -> Result<Vec<Value>, PersistenceError> {
        let _guard = self.locks.lock(device_id).await;
        let file = JsonFile::new(self.file_path(device_id, date));
        tokio::task::spawn_blocking(move || read_array(&file))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    /// Every record for the device, ordered by report timestamp.
    ///
    /// Records without a parseable timestamp are skipped (and logged); they
    /// stay on disk untouched.
    pub async fn records(&self, device_id: &str) -> Result<Vec<Record>, PersistenceError> {
        let _guard = self.locks.lock(device_id).await;
        let dir = self.data_dir.clone();
        let device_id = device_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<Record>, PersistenceError> {
            let files: Vec<(NaiveDate, PathBuf)> = scan_dir(&dir)?
                .into_iter()
                .filter(|(id, _, _)| *id == device_id)
                .map(|(_, date, path)| (date, path))
                .collect();
            collect_sorted(&device_id, files)
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    /// Ids of every device with at least one log file, sorted.
    pub async fn list_devices(&self) -> Result<Vec<String>, PersistenceError> {
        let dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, PersistenceError> {
            let ids: BTreeSet<String> = scan_dir(&dir)?.into_iter().map(|(id, _, _)| id).collect();
            Ok(ids.into_iter().collect())
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    /// Delete log files dated strictly before `today - retention_days`.
    ///
    /// One file failing to delete does not stop the rest of the sweep.
    pub fn sweep_expired(&self, today: NaiveDate) -> Result<SweepReport, PersistenceError> {
        sweep_dir(&self.data_dir, self.retention_days, today)
    }

    /// Sweep relative to the local calendar date.
    pub async fn sweep(&self) -> Result<SweepReport, PersistenceError> {
        let today = Local::now().date_naive();
        let dir = self.data_dir.clone();
        let retention_days = self.retention_days;
        tokio::task::spawn_blocking(move || sweep_dir(&dir, retention_days, today))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

fn sweep_dir(dir: &Path, retention_days: u32, today: NaiveDate) -> Result<SweepReport, PersistenceError> {
    let cutoff = today
        .checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDate::MIN);

    let mut report = SweepReport::default();
    for (_, date, path) in scan_dir(dir)? {
        if date >= cutoff {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(file = %path.display(), date = %date, "Deleted expired report log");
                report.deleted.push(path);
            }
            Err(e) => {
                warn!(file = %path.display(), "Failed to delete expired report log: {}", e);
                report.failed.push(path);
            }
        }
    }
    Ok(report)
}

/// All well-named log files: `(device_id, date, path)`.
fn scan_dir(dir: &Path) -> Result<Vec<(String, NaiveDate, PathBuf)>, PersistenceError> {
    let entries = fs::read_dir(dir).map_err(|e| PersistenceError::io(dir, e))?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading data directory entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        match parse_file_name(&name.to_string_lossy()) {
            Some((id, date)) => found.push((id, date, path)),
            None => debug!(file = %path.display(), "Skipping file with unexpected name"),
        }
    }
    found.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    Ok(found)
}

/// Split `<device>_<YYYY-MM-DD>.json` into its parts. Device ids may
/// themselves contain underscores; the date is always the last segment.
pub fn parse_file_name(name: &str) -> Option<(String, NaiveDate)> {
    let stem = name.strip_suffix(".json")?;
    let (id, date) = stem.rsplit_once('_')?;
    if id.is_empty() {
        return None;
    }
    let date = NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?;
    Some((id.to_string(), date))
}

fn read_array(file: &JsonFile) -> Result<Vec<Value>, PersistenceError> {
    Ok(match file.load::<Value>()? {
        None => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => vec![other],
    })
}

fn append_blocking(file: &JsonFile, record: Record) -> Result<usize, PersistenceError> {
    let mut records = read_array(file)?;
    records.push(Value::Object(record));
    file.save(&records)?;
    debug!(file = %file.path().display(), count = records.len(), "Report appended");
    Ok(records.len())
}

fn collect_sorted(device_id: &str, files: Vec<(NaiveDate, PathBuf)>) -> Result<Vec<Record>, PersistenceError> {
    let mut dated = Vec::new();
    for (_, path) in files {
        let records = match read_array(&JsonFile::new(&path)) {
            Ok(r) => r,
            Err(e) => {
                warn!(device_id, "Skipping unreadable report log: {}", e);
                continue;
            }
        };
        for value in records {
            let Value::Object(record) = value else { continue };
            let ts = record
                .get(TIMESTAMP_FIELD)
                .and_then(Value::as_str)
                .and_then(parse_timestamp);
            match ts {
                Some(ts) => dated.push((ts, record)),
                None => debug!(
                    device_id,
                    file = %path.display(),
                    "Record without a valid timestamp left out of sorted view"
                ),
            }
        }
    }
    dated.sort_by_key(|(ts, _)| *ts);
    Ok(dated.into_iter().map(|(_, r)| r).collect())
}
