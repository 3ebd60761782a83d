//! Persistent record of which descriptor produced which artifact.
//!
//! The store lives in a single JSON file inside the cache directory. Entries
//! survive only while their artifact exists: every save prunes vanished paths
//! first, so the file never vouches for something that is gone.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::descriptor::Descriptor;

pub const HISTORY_FILE: &str = ".history";
pub const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to access history file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("History file {path} is malformed")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Cache directory {path} is locked by another run (holder of {lock})")]
    Locked { path: PathBuf, lock: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub descriptor: Descriptor,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: BTreeMap<PathBuf, HistoryEntry>,
}

impl HistoryStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Reads the store. Missing or blank files yield an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::empty(path)),
            Err(source) => return Err(HistoryError::Io { path, source }),
        };
        if text.trim().is_empty() {
            return Ok(Self::empty(path));
        }
        match serde_json::from_str(&text) {
            Ok(entries) => Ok(Self { path, entries }),
            Err(source) => Err(HistoryError::Malformed { path, source }),
        }
    }

    /// Like [`HistoryStore::load`], but a malformed file is reported and
    /// replaced by a cold cache instead of failing the run.
    pub fn load_or_cold(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        match Self::load(path) {
            Err(HistoryError::Malformed { path, source }) => {
                warn!(
                    path = %path.display(),
                    error = %source,
                    "History file is malformed; starting with a cold cache"
                );
                Ok(Self::empty(path))
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, artifact: impl Into<PathBuf>, descriptor: Descriptor) {
        self.entries.insert(
            artifact.into(),
            HistoryEntry {
                descriptor,
                recorded_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, artifact: &Path) -> Option<&HistoryEntry> {
        self.entries.get(artifact)
    }

    pub fn contains(&self, artifact: &Path) -> bool {
        self.entries.contains_key(artifact)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &HistoryEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries for artifacts that no longer exist, then persists the
    /// rest. Returns how many entries were pruned.
    pub fn prune_and_save(&mut self) -> Result<usize, HistoryError> {
        let before = self.entries.len();
        self.entries.retain(|artifact, _| artifact.exists());
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(pruned, "Pruned history entries for missing artifacts");
        }
        self.save()?;
        Ok(pruned)
    }

    fn save(&self) -> Result<(), HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let serialized = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| io_err(io::Error::other(err)))?;

        // Write then rename so an interrupted save leaves the previous file.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, serialized).map_err(io_err)?;
        fs::rename(&staging, &self.path).map_err(io_err)?;
        Ok(())
    }
}

/// Exclusive claim on a cache directory for the duration of one run.
///
/// Backed by an OS advisory lock on `.lock`, so the claim ends with the
/// process even if it is killed. A leftover lock file from a crashed run is
/// simply locked again.
#[derive(Debug)]
pub struct CacheLock {
    dir: PathBuf,
    path: PathBuf,
    _file: File,
}

impl CacheLock {
    pub fn acquire(cache_dir: &Path) -> Result<Self, HistoryError> {
        let path = cache_dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(source) => return Err(HistoryError::Io { path, source }),
        };
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(HistoryError::Locked {
                    path: cache_dir.to_path_buf(),
                    lock: path,
                });
            }
            Err(TryLockError::Error(source)) => return Err(HistoryError::Io { path, source }),
        }
        if let Err(err) = file.set_len(0).and_then(|()| writeln!(file, "{}", std::process::id())) {
            warn!(lock = %path.display(), error = %err, "Failed to write pid to lock file");
        }
        Ok(Self {
            dir: cache_dir.to_path_buf(),
            path,
            _file: file,
        })
    }

    /// Removes everything in the locked cache directory except the lock file.
    pub fn clear(&self) -> Result<usize, HistoryError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| HistoryError::Io { path, source }
        };
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let entry_path = entry.map_err(io_err(&self.dir))?.path();
            if entry_path == self.path {
                continue;
            }
            let result = if entry_path.is_dir() {
                fs::remove_dir_all(&entry_path)
            } else {
                fs::remove_file(&entry_path)
            };
            result.map_err(io_err(&entry_path))?;
            removed += 1;
        }
        Ok(removed)
    }
}
