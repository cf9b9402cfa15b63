//! Bridges that keep a single query's payload across process restarts.
//!
//! The cache itself is memory-only. A query opts in with
//! [`QueryOptions::persist`](crate::QueryOptions::persist): an empty entry is seeded
//! from [`PersistentStorage::load_initial`], every successful fetch or direct write
//! is saved, and removing the entry through the client clears it. Eviction by the
//! garbage collector leaves the stored copy alone.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use refetch::prelude::*;
//! use refetch::{JsonFileStorage, PersistentStorage};
//!
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct User { name: String }
//! # async fn fetch_user() -> Result<Option<User>, QueryError> { Ok(None) }
//! # fn demo(client: &QueryClient, data_dir: std::path::PathBuf) -> Result<(), Box<dyn std::error::Error>> {
//! let storage: Arc<dyn PersistentStorage<Option<User>>> =
//!     Arc::new(JsonFileStorage::<Option<User>>::new(data_dir)?);
//!
//! let user = client.query(
//!     &QueryKey::new("user"),
//!     |_ctx| fetch_user(),
//!     QueryOptions::default().persist(storage),
//! )?;
//! # drop(user);
//! # Ok(())
//! # }
//! ```

use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::PersistError;
use crate::key::QueryKey;
use crate::store::AnyData;

/// Storage for one query's payload that outlives the process.
pub trait PersistentStorage<T>: Send + Sync {
    /// Returns the stored payload for `key`, if any.
    fn load_initial(&self, key: &QueryKey) -> Option<T>;

    /// Stores `payload` for `key`, replacing what was there.
    fn save(&self, key: &QueryKey, payload: &T) -> Result<(), PersistError>;

    /// Forgets the payload for `key`.
    fn clear(&self, key: &QueryKey) -> Result<(), PersistError> {
        let _ = key;
        Ok(())
    }
}

/// Type-erased view of a [`PersistentStorage`] kept on the entry.
pub(crate) trait ErasedPersist: Send + Sync {
    fn save(&self, key: &QueryKey, data: &AnyData);
    fn clear(&self, key: &QueryKey);
}

pub(crate) struct TypedPersist<T>(pub Arc<dyn PersistentStorage<T>>);

impl<T: Send + Sync + 'static> ErasedPersist for TypedPersist<T> {
    fn save(&self, key: &QueryKey, data: &AnyData) {
        let Some(payload) = data.downcast_ref::<T>() else {
            warn!(%key, "persisted query holds an unexpected type, not saving");
            return;
        };
        if let Err(err) = self.0.save(key, payload) {
            warn!(%key, error = %err, "failed to persist query data");
        }
    }

    fn clear(&self, key: &QueryKey) {
        if let Err(err) = self.0.clear(key) {
            warn!(%key, error = %err, "failed to clear persisted query data");
        }
    }
}

/// In-memory storage, mostly useful in tests.
#[derive(Debug)]
pub struct MemoryStorage<T> {
    items: DashMap<String, T>,
}

impl<T> MemoryStorage<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { items: DashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for MemoryStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> PersistentStorage<T> for MemoryStorage<T> {
    fn load_initial(&self, key: &QueryKey) -> Option<T> {
        self.items.get(&key.to_string()).map(|item| item.clone())
    }

    fn save(&self, key: &QueryKey, payload: &T) -> Result<(), PersistError> {
        self.items.insert(key.to_string(), payload.clone());
        Ok(())
    }

    fn clear(&self, key: &QueryKey) -> Result<(), PersistError> {
        self.items.remove(&key.to_string());
        Ok(())
    }
}

/// Stores each key as a JSON file inside a directory.
#[derive(Debug)]
pub struct JsonFileStorage<T> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStorage<T> {
    /// Opens (and creates if needed) the storage directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &QueryKey) -> PathBuf {
        // Hex keeps file names unique and portable for any key.
        let canonical = key.to_string();
        let mut name = String::with_capacity(canonical.len() * 2 + 5);
        for byte in canonical.bytes() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

impl<T> PersistentStorage<T> for JsonFileStorage<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load_initial(&self, key: &QueryKey) -> Option<T> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(%key, path = %path.display(), error = %err, "failed to read persisted query data");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(%key, path = %path.display(), error = %err, "ignoring unreadable persisted query data");
                None
            }
        }
    }

    fn save(&self, key: &QueryKey, payload: &T) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec(payload)?;
        fs::write(self.path_for(key), bytes)?;
        Ok(())
    }

    fn clear(&self, key: &QueryKey) -> Result<(), PersistError> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn alice() -> User {
        User {
            id: 1,
            name: "alice".into(),
        }
    }

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        let key = QueryKey::new("user");

        assert_eq!(storage.load_initial(&key), None);
        storage.save(&key, &alice()).unwrap();
        assert_eq!(storage.load_initial(&key), Some(alice()));
        storage.clear(&key).unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_json_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = query_key!["user", 1];

        let storage = JsonFileStorage::<User>::new(dir.path()).unwrap();
        storage.save(&key, &alice()).unwrap();

        let reopened = JsonFileStorage::<User>::new(dir.path()).unwrap();
        assert_eq!(reopened.load_initial(&key), Some(alice()));

        reopened.clear(&key).unwrap();
        assert_eq!(reopened.load_initial(&key), None);
        // Clearing twice is fine.
        reopened.clear(&key).unwrap();
    }

    #[test]
    fn test_json_file_storage_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let key = QueryKey::new("user");
        let storage = JsonFileStorage::<User>::new(dir.path()).unwrap();

        fs::write(storage.path_for(&key), b"not json").unwrap();
        assert_eq!(storage.load_initial(&key), None);
    }

    #[test]
    fn test_erased_save_checks_type() {
        let storage = Arc::new(MemoryStorage::<User>::new());
        let erased = TypedPersist(storage.clone() as Arc<dyn PersistentStorage<User>>);
        let key = QueryKey::new("user");

        erased.save(&key, &(Arc::new(42_u8) as AnyData));
        assert!(storage.is_empty());

        erased.save(&key, &(Arc::new(alice()) as AnyData));
        assert_eq!(storage.load_initial(&key), Some(alice()));
    }
}
