use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

pub const CREDENTIALS_STORAGE_KEY: &str = "dexie-browser/dexie-cloud-credentials";
pub const KNOWN_DATABASES_STORAGE_KEY: &str = "dexie-browser/known-databases";
pub const SELECTED_KNOWN_DATABASE_ID_STORAGE_KEY: &str =
    "dexie-browser/known-databases/selected-id";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read storage file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse storage file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to create storage directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize value for `{key}`: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write storage file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable string key-value storage shared by every context of the application.
pub trait KeyValueStore: Debug + Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

/// Stores every key in a single JSON object document on disk.
///
/// Writes go to a sibling temp file that is renamed over the document, so a
/// reader never sees a partial file. Stores opened on the same path within one
/// process share a lock around read-modify-write.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Mutex::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            write_lock: path_lock(&path),
            path,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = fs::read_to_string(&self.path).map_err(|source| StorageError::Read {
            path: self.path.clone(),
            source,
        })?;

        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw).map_err(|source| StorageError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_document(&self, document: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let parent_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent_dir).map_err(|source| StorageError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;

        let rendered =
            serde_json::to_string_pretty(document).map_err(|source| StorageError::Serialize {
                key: self.path.display().to_string(),
                source,
            })?;

        let write_error = |source: std::io::Error| StorageError::Write {
            path: self.path.clone(),
            source,
        };
        let mut staged = NamedTempFile::new_in(parent_dir).map_err(write_error)?;
        staged
            .write_all(rendered.as_bytes())
            .and_then(|()| staged.flush())
            .map_err(write_error)?;
        staged
            .persist(&self.path)
            .map_err(|error| write_error(error.error))?;
        Ok(())
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut document = self.read_document()?;
        apply(&mut document);
        self.write_document(&document)
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_document()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|document| {
            document.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.update(|document| {
            document.remove(key);
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written through this process's [`Storage`] handle.
    Local,
    /// Reported by another context sharing the same durable store.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub origin: ChangeOrigin,
}

/// Cloneable handle over a [`KeyValueStore`] that broadcasts a [`StorageEvent`]
/// for every local write and for every externally reported change.
#[derive(Debug, Clone)]
pub struct Storage {
    store: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<StorageEvent>,
}

impl Storage {
    #[must_use]
    pub fn new(store: impl KeyValueStore + 'static) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: Arc::new(store),
            events,
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::default())
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.store.get_item(key)
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.store.set_item(key, value)?;
        self.emit(key, ChangeOrigin::Local);
        Ok(())
    }

    pub fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.store.remove_item(key)?;
        self.emit(key, ChangeOrigin::Local);
        Ok(())
    }

    /// Reads and decodes a JSON value. Missing keys, `null`, unreadable storage and
    /// malformed JSON all yield `None`; the latter two are logged.
    #[must_use]
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get_item(key) {
            Ok(raw) => raw?,
            Err(error) => {
                warn!(key, error = %error, "failed to read stored value");
                return None;
            }
        };

        match serde_json::from_str::<Option<T>>(&raw) {
            Ok(value) => value,
            Err(error) => {
                warn!(key, error = %error, "failed to parse stored value");
                None
            }
        }
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let rendered = serde_json::to_string(value).map_err(|source| StorageError::Serialize {
            key: key.to_string(),
            source,
        })?;
        self.set_item(key, &rendered)
    }

    /// Publishes a change made by another context; the write itself already happened.
    pub fn notify_external(&self, key: &str) {
        self.emit(key, ChangeOrigin::External);
    }

    fn emit(&self, key: &str, origin: ChangeOrigin) {
        // No subscribers is not an error.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            origin,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::{
        ChangeOrigin, FileStore, KeyValueStore, Storage, StorageEvent, CREDENTIALS_STORAGE_KEY,
    };

    fn temp_storage_path(temp_dir: &TempDir) -> PathBuf {
        temp_dir.path().join("nested").join("storage.json")
    }

    #[test]
    fn file_store_persists_and_removes_items() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_storage_path(&temp_dir);

        let store = FileStore::new(&path);
        assert_eq!(store.get_item("missing").expect("read should succeed"), None);

        store.set_item("a", "1").expect("write should succeed");
        store.set_item("b", "2").expect("write should succeed");

        let reopened = FileStore::new(&path);
        assert_eq!(
            reopened.get_item("a").expect("read should succeed").as_deref(),
            Some("1")
        );

        reopened.remove_item("a").expect("remove should succeed");
        assert_eq!(reopened.get_item("a").expect("read should succeed"), None);
        assert_eq!(
            reopened.get_item("b").expect("read should succeed").as_deref(),
            Some("2")
        );
    }

    #[test]
    fn file_store_reports_corrupt_documents() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("storage.json");
        std::fs::write(&path, "{not json").expect("failed to seed file");

        let store = FileStore::new(&path);
        let err = store.get_item("a").expect_err("corrupt file should fail");
        assert!(err.to_string().contains("failed to parse storage file"));
    }

    #[test]
    fn readers_never_observe_a_partial_document() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_storage_path(&temp_dir);
        let writer = FileStore::new(&path);
        let reader = FileStore::new(&path);
        writer
            .set_item(CREDENTIALS_STORAGE_KEY, "seed")
            .expect("seed should succeed");

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..200 {
                    writer
                        .set_item(CREDENTIALS_STORAGE_KEY, &format!("round-{round}"))
                        .expect("write should succeed");
                }
            });
            for _ in 0..200 {
                let value = reader
                    .get_item(CREDENTIALS_STORAGE_KEY)
                    .expect("read should succeed");
                assert!(value.is_some(), "credential key vanished mid-write");
            }
        });
    }

    #[test]
    fn stores_sharing_a_path_keep_each_others_updates() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_storage_path(&temp_dir);
        let first = FileStore::new(&path);
        let second = FileStore::new(&path);

        std::thread::scope(|scope| {
            for index in 0..16 {
                let store = if index % 2 == 0 { &first } else { &second };
                scope.spawn(move || {
                    store
                        .set_item(&format!("key-{index}"), "value")
                        .expect("write should succeed");
                });
            }
        });

        for index in 0..16 {
            assert_eq!(
                first
                    .get_item(&format!("key-{index}"))
                    .expect("read should succeed")
                    .as_deref(),
                Some("value")
            );
        }
        let parent = path.parent().expect("storage path should have a parent");
        let files = std::fs::read_dir(parent)
            .expect("directory should be readable")
            .count();
        assert_eq!(files, 1, "temp files should be renamed into place");
    }

    #[test]
    fn local_writes_emit_events() {
        let storage = Storage::in_memory();
        let mut events = storage.subscribe();

        storage
            .set_item(CREDENTIALS_STORAGE_KEY, "{}")
            .expect("write should succeed");
        storage
            .remove_item(CREDENTIALS_STORAGE_KEY)
            .expect("remove should succeed");
        storage.notify_external("other");

        let expected = [
            (CREDENTIALS_STORAGE_KEY, ChangeOrigin::Local),
            (CREDENTIALS_STORAGE_KEY, ChangeOrigin::Local),
            ("other", ChangeOrigin::External),
        ];
        for (key, origin) in expected {
            assert_eq!(
                events.try_recv().expect("event should be queued"),
                StorageEvent {
                    key: key.to_string(),
                    origin,
                }
            );
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn read_json_treats_malformed_and_null_values_as_absent() {
        let storage = Storage::in_memory();
        storage.set_item("bad", "{oops").expect("write should succeed");
        storage.set_item("null", "null").expect("write should succeed");
        storage
            .write_json("list", &vec![1, 2, 3])
            .expect("write should succeed");

        assert_eq!(storage.read_json::<Vec<u8>>("bad"), None);
        assert_eq!(storage.read_json::<Vec<u8>>("null"), None);
        assert_eq!(storage.read_json::<Vec<u8>>("missing"), None);
        assert_eq!(storage.read_json::<Vec<u8>>("list"), Some(vec![1, 2, 3]));
    }
}
