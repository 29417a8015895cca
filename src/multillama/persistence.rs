//! Loading and saving the settings and chat-state records.
//!
//! [`StateStore`] is the seam; [`JsonFileStore`] keeps each record as a JSON document
//! named after its versioned key inside one directory. Writes land in a `.tmp` sibling
//! first and are renamed into place so a crash never leaves a half-written record.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::session_store::ChatState;

/// Versioned key of the settings record.
pub const SETTINGS_KEY: &str = "multi_llama_settings_v1";
/// Versioned key of the chat-state record.
pub const CHAT_STATE_KEY: &str = "multi_llama_chat_state_v1";

#[derive(Debug)]
pub enum PersistenceError {
    Io { key: String, source: io::Error },
    Serde { key: String, source: serde_json::Error },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io { key, source } => write!(f, "I/O error on {}: {}", key, source),
            PersistenceError::Serde { key, source } => {
                write!(f, "Malformed record {}: {}", key, source)
            }
        }
    }
}

impl Error for PersistenceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PersistenceError::Io { source, .. } => Some(source),
            PersistenceError::Serde { source, .. } => Some(source),
        }
    }
}

/// Storage backend for the two persisted records.
///
/// `load_*` return `Ok(None)` when nothing has been stored yet.
pub trait StateStore: Send + Sync {
    fn load_settings(&self) -> Result<Option<Settings>, PersistenceError>;
    fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError>;
    fn load_chat_state(&self) -> Result<Option<ChatState>, PersistenceError>;
    fn save_chat_state(&self, state: &ChatState) -> Result<(), PersistenceError>;
}

/// JSON documents in a directory.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistenceError::Serde {
                key: key.to_string(),
                source,
            })
    }

    fn write<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let io_err = |source: io::Error| PersistenceError::Io {
            key: key.to_string(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Serde {
            key: key.to_string(),
            source,
        })?;
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(io_err)?;
        if fs::rename(&tmp, &path).is_err() {
            let _ = fs::remove_file(&path);
            fs::rename(&tmp, &path).map_err(io_err)?;
        }
        log::debug!("JsonFileStore: wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn load_settings(&self) -> Result<Option<Settings>, PersistenceError> {
        Ok(self.read::<Settings>(SETTINGS_KEY)?.map(Settings::normalized))
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError> {
        self.write(SETTINGS_KEY, settings)
    }

    fn load_chat_state(&self) -> Result<Option<ChatState>, PersistenceError> {
        self.read(CHAT_STATE_KEY)
    }

    fn save_chat_state(&self, state: &ChatState) -> Result<(), PersistenceError> {
        self.write(CHAT_STATE_KEY, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_records_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_settings().unwrap().is_none());
        assert!(store.load_chat_state().unwrap().is_none());
    }

    #[test]
    fn test_settings_are_normalized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));
        let mut settings = Settings::default();
        settings.hosts[0].url = "localhost:3000/".to_string();
        store.save_settings(&settings).unwrap();

        let loaded = store.load_settings().unwrap().unwrap();
        assert_eq!(loaded.hosts[0].url, "http://127.0.0.1:11434");
        assert!(dir.path().join("nested/multi_llama_settings_v1.json").exists());
        assert!(!dir.path().join("nested/multi_llama_settings_v1.json.tmp").exists());
    }

    #[test]
    fn test_malformed_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("multi_llama_chat_state_v1.json"), b"{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(
            store.load_chat_state(),
            Err(PersistenceError::Serde { .. })
        ));
    }
}
