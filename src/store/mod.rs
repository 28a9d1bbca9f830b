//! Persistent fleet store backed by JSON documents.
//!
//! The store holds two documents in the configuration directory:
//! `clusters.json` (the fleet) and `variables.json` (free-form key/value
//! settings such as provider credentials). The engine reads the fleet once per
//! operation and funnels every mutation through [`FleetStore::update`], which
//! re-reads, applies, validates, and writes under a lock so concurrent
//! per-instance completions merge instead of overwriting each other.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;

use crate::fleet::{Clusters, FleetError};

/// File name of the fleet document.
pub const CLUSTERS_FILE: &str = "clusters.json";

/// File name of the variables document.
pub const VARIABLES_FILE: &str = "variables.json";

/// Errors raised while reading or writing the fleet store.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a document is not valid JSON of the expected shape.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the fleet document violates an invariant.
    #[error("invalid fleet: {0}")]
    Invalid(#[from] FleetError),
}

/// Narrow accessor the engine uses to read and mutate the fleet.
pub trait FleetStore: Send + Sync {
    /// Reads the fleet document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read, parsed, or
    /// validated.
    fn clusters(&self) -> Result<Clusters, StoreError>;

    /// Replaces the fleet document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when validation or the write fails.
    fn save_clusters(&self, clusters: &Clusters) -> Result<(), StoreError>;

    /// Reads the variables document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be read or parsed.
    fn variables(&self) -> Result<BTreeMap<String, String>, StoreError>;

    /// Applies `mutate` to a fresh read of the fleet and writes the result,
    /// serialised against every other update through this store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when `mutate` fails or the result
    /// violates an invariant, or any read/write error.
    fn update(
        &self,
        mutate: &mut dyn FnMut(&mut Clusters) -> Result<(), FleetError>,
    ) -> Result<Clusters, StoreError>;
}

/// JSON file store rooted at a configuration directory.
#[derive(Debug)]
pub struct JsonFleetStore {
    dir: Utf8PathBuf,
    lock: Mutex<()>,
}

impl JsonFleetStore {
    /// Creates a store rooted at `dir`. Nothing is read until first use.
    #[must_use]
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Returns the configuration directory.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn read_clusters(&self) -> Result<Clusters, StoreError> {
        let path = self.dir.join(CLUSTERS_FILE);
        let Some(contents) = read_optional(&self.dir, CLUSTERS_FILE)? else {
            return Ok(Clusters::new());
        };
        if contents.trim().is_empty() {
            return Ok(Clusters::new());
        }
        let clusters: Clusters =
            serde_json::from_str(&contents).map_err(|err| StoreError::Parse {
                path,
                message: err.to_string(),
            })?;
        clusters.validate()?;
        Ok(clusters)
    }

    fn write_clusters(&self, clusters: &Clusters) -> Result<(), StoreError> {
        clusters.validate()?;
        let path = self.dir.join(CLUSTERS_FILE);
        let rendered =
            serde_json::to_string_pretty(clusters).map_err(|err| StoreError::Parse {
                path: path.clone(),
                message: err.to_string(),
            })?;
        write_atomic(&self.dir, CLUSTERS_FILE, &rendered)?;
        debug!(path = %path, "fleet document written");
        Ok(())
    }
}

impl FleetStore for JsonFleetStore {
    fn clusters(&self) -> Result<Clusters, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_clusters()
    }

    fn save_clusters(&self, clusters: &Clusters) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_clusters(clusters)
    }

    fn variables(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let Some(contents) = read_optional(&self.dir, VARIABLES_FILE)? else {
            return Ok(BTreeMap::new());
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|err| StoreError::Parse {
            path: self.dir.join(VARIABLES_FILE),
            message: err.to_string(),
        })
    }

    fn update(
        &self,
        mutate: &mut dyn FnMut(&mut Clusters) -> Result<(), FleetError>,
    ) -> Result<Clusters, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut clusters = self.read_clusters()?;
        mutate(&mut clusters)?;
        self.write_clusters(&clusters)?;
        Ok(clusters)
    }
}

fn open_dir(dir: &Utf8Path) -> Result<Option<Dir>, StoreError> {
    match Dir::open_ambient_dir(dir, ambient_authority()) {
        Ok(handle) => Ok(Some(handle)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Io {
            path: dir.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn read_optional(dir: &Utf8Path, file_name: &str) -> Result<Option<String>, StoreError> {
    let path = dir.join(file_name);
    let Some(handle) = open_dir(dir)? else {
        return Ok(None);
    };
    match handle.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Io {
            path,
            message: err.to_string(),
        }),
    }
}

fn write_atomic(dir: &Utf8Path, file_name: &str, contents: &str) -> Result<(), StoreError> {
    let io_error = |err: io::Error| StoreError::Io {
        path: dir.join(file_name),
        message: err.to_string(),
    };
    Dir::create_ambient_dir_all(dir, ambient_authority()).map_err(io_error)?;
    let handle = Dir::open_ambient_dir(dir, ambient_authority()).map_err(io_error)?;
    let staging = format!(".{file_name}.tmp");
    handle.write(&staging, contents).map_err(io_error)?;
    handle
        .rename(&staging, &handle, file_name)
        .map_err(io_error)
}

#[cfg(test)]
mod tests;
