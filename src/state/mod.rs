//! Persisted notification state.
//!
//! A flat mapping of stable string keys to the last reported JSON value.
//! Stores are read as a whole at the start of a run and written one key at a
//! time, each write replacing the backing file atomically.

pub mod detector;

pub use detector::*;

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Snapshot of every persisted key.
pub type StateMap = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store {path} does not exist (create it with --init-state)")]
    Missing { path: String },

    #[error("state store {path} is unreadable: {source}")]
    Unreadable { path: String, source: io::Error },

    #[error("state store {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },

    #[error("failed to write state store {path}: {source}")]
    Write { path: String, source: io::Error },

    #[error("state backend failure: {0}")]
    Backend(String),
}

/// Keyed persistence for last-reported values.
pub trait StateStore {
    /// Read every key. Fails rather than returning an empty map when the
    /// store cannot be read.
    fn read_all(&self) -> Result<StateMap, StateError>;

    /// Set one key, leaving every other key untouched.
    fn write(&mut self, key: &str, value: &Value) -> Result<(), StateError>;
}

/// JSON object on disk, e.g. `data/latest.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the store, creating an empty one if the file does not exist yet.
    ///
    /// An existing file is left as is.
    pub fn initialize(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let store = Self::open(path);
        if !store.path.exists() {
            if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| store.write_error(source))?;
            }
            store.write_all(&StateMap::new())?;
            debug!("Initialized empty state store at {}", store.path.display());
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    fn write_error(&self, source: io::Error) -> StateError {
        StateError::Write {
            path: self.display_path(),
            source,
        }
    }

    /// Replace the whole file via a sibling temp file and rename.
    fn write_all(&self, state: &StateMap) -> Result<(), StateError> {
        let mut content =
            serde_json::to_string_pretty(state).map_err(|e| StateError::Backend(e.to_string()))?;
        content.push('\n');

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| self.write_error(e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| self.write_error(e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| self.write_error(e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.write_error(e.error))?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn read_all(&self) -> Result<StateMap, StateError> {
        let content = fs::read_to_string(&self.path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StateError::Missing {
                    path: self.display_path(),
                }
            } else {
                StateError::Unreadable {
                    path: self.display_path(),
                    source,
                }
            }
        })?;

        serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
            path: self.display_path(),
            source,
        })
    }

    fn write(&mut self, key: &str, value: &Value) -> Result<(), StateError> {
        let mut state = self.read_all()?;
        state.insert(key.to_string(), value.clone());
        self.write_all(&state)?;
        debug!("Persisted state key '{}'", key);
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: StateMap,
    /// When true, reads fail.
    pub fail_on_read: bool,
    /// When true, writes fail.
    pub fail_on_write: bool,
    /// Number of successful writes.
    pub write_count: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: StateMap) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }
}

impl StateStore for MemoryStore {
    fn read_all(&self) -> Result<StateMap, StateError> {
        if self.fail_on_read {
            return Err(StateError::Backend("simulated read failure".to_string()));
        }
        Ok(self.entries.clone())
    }

    fn write(&mut self, key: &str, value: &Value) -> Result<(), StateError> {
        if self.fail_on_write {
            return Err(StateError::Backend("simulated write failure".to_string()));
        }
        self.entries.insert(key.to_string(), value.clone());
        self.write_count += 1;
        Ok(())
    }
}
