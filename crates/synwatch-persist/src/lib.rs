//! JSON snapshot persistence for synwatch.
//!
//! A [`JsonStore`] owns one pretty-printed JSON file named after a state
//! section (`<dir>/<name>.json`). Writes go to a sibling temp file first and
//! are renamed into place, so a crash mid-write leaves the previous snapshot
//! intact. A missing or unreadable file loads as the section's default.

#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// File-backed store for a single named state section.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store for `<dir>/<name>.json`.
    ///
    /// The directory is created lazily on the first save.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.json")),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, falling back to `T::default()`.
    pub fn load<T>(&self) -> T
    where
        T: DeserializeOwned + Default,
    {
        match self.try_load() {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable snapshot, starting empty");
                T::default()
            }
        }
    }

    /// `Ok(None)` when no snapshot exists yet.
    fn try_load<T>(&self) -> io::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&raw)?;
        Ok(Some(value))
    }

    /// Atomically replace the snapshot with `value`.
    pub fn save<T>(&self, value: &T) -> io::Result<()>
    where
        T: Serialize + ?Sized,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "snapshot written");
        Ok(())
    }
}
