//! Key-value settings collaborator.
//!
//! The charge-limitation engine keeps a little state (when max voltage was reached, whether
//! max voltage is currently allowed) that has to survive restarts. It is persisted through
//! this trait so the storage backend stays swappable.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String) -> Result<()>;
}

/// Volatile store, mainly for tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore(HashMap<String, String>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.0.insert(key.to_owned(), value);
        Ok(())
    }
}

/// Flat JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file starts an empty store; an unreadable one
    /// is reported, since silently dropping it would re-trigger a full charge.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::Settings(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("settings file {} not found, starting empty", path.display());
                BTreeMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, values })
    }

    fn persist(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.values)
            .map_err(|e| Error::Settings(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        if self.values.get(key) == Some(&value) {
            return Ok(());
        }
        self.values.insert(key.to_owned(), value);
        self.persist().inspect_err(|err| warn!("could not persist settings: {err}"))
    }
}
