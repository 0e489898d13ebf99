//! JSON file persistence with atomic replacement.
//!
//! Writers serialise into a sibling temp file, fsync it, then rename over
//! the target, so readers never observe a partially written file.

use crate::error::PersistenceError;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// A JSON document at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the document. A missing file yields `Ok(None)`.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, PersistenceError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map(Some).map_err(|e| {
            if e.is_io() {
                PersistenceError::io(&self.path, e.into())
            } else {
                PersistenceError::corrupt(&self.path, e)
            }
        })
    }

    /// Replace the document atomically, creating parent directories.
    pub fn save<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
            }
        }

        let temp_path = self.temp_path();
        {
            let file =
                File::create(&temp_path).map_err(|e| PersistenceError::io(&temp_path, e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, data)
                .map_err(|e| PersistenceError::corrupt(&temp_path, e))?;
            writer
                .flush()
                .map_err(|e| PersistenceError::io(&temp_path, e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| PersistenceError::io(&temp_path, e))?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| PersistenceError::io(&self.path, e))
    }

    pub fn delete(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
