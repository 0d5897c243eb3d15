//! Durable key/value persistence for the enrolled credential and its
//! lockout bookkeeping.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Name of the storage scope used when none is configured.
pub const DEFAULT_SCOPE: &str = "pin__preferences";

/// Hex digest of the enrolled secret.
pub const KEY_CREDENTIAL_HASH: &str = "pin__saved_locked_password";
/// Epoch millis at which the current lockout window began; 0 when idle.
pub const KEY_FAILURE_BLOCK_START: &str = "pin__unlock_failure_time";
/// Epoch millis of the most recent successful unlock.
pub const KEY_LAST_UNLOCK_SUCCESS: &str = "pin__unlock_success_time";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Millis(i64),
    Text(String),
}

/// Key/value persistence contract.
///
/// Every call is atomic per key and immediately visible to later calls,
/// including calls made through another handle on the same backing store.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError>;

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn get_text(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoredValue::Text(text)) => Ok(Some(text)),
            Some(StoredValue::Millis(_)) => Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: "expected text, found a timestamp".into(),
            }),
        }
    }

    /// Read a timestamp, folding the legacy `0` marker into `None`.
    fn get_millis(&self, key: &str) -> Result<Option<i64>, StorageError> {
        match self.get(key)? {
            None | Some(StoredValue::Millis(0)) => Ok(None),
            Some(StoredValue::Millis(millis)) => Ok(Some(millis)),
            Some(StoredValue::Text(_)) => Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: "expected a timestamp, found text".into(),
            }),
        }
    }
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StorageError> {
        (**self).put(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

impl<S: CredentialStore + ?Sized> CredentialStore for &S {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StorageError> {
        (**self).put(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// Process-local store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// JSON document on disk holding one storage scope.
///
/// Reads always go back to the file. Writes replace the whole document via
/// a uniquely named temp file and rename, leaving it readable only by the
/// owner. Read-modify-write cycles hold an exclusive `flock` on
/// `<path>.lock`, so handles in this or any other process never drop each
/// other's keys.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Open `<dir>/<scope>.json`.
    pub fn open_scope(dir: &Path, scope: &str) -> Self {
        Self::new(dir.join(format!("{scope}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut lock = self.path.clone().into_os_string();
        lock.push(".lock");
        PathBuf::from(lock)
    }

    fn read_document(&self) -> Result<BTreeMap<String, StoredValue>, StorageError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_error(err)),
        };

        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }

        serde_json::from_slice(&contents).map_err(|err| StorageError::Corrupt {
            key: self.path.display().to_string(),
            reason: err.to_string(),
        })
    }

    fn write_document(&self, document: &BTreeMap<String, StoredValue>) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(document)
            .map_err(|err| StorageError::Encode(err.to_string()))?;

        let mut tmp = NamedTempFile::new_in(self.parent_dir()).map_err(|err| self.io_error(err))?;
        tmp.write_all(&encoded).map_err(|err| self.io_error(err))?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|err| self.io_error(err))?;
        tmp.as_file().sync_all().map_err(|err| self.io_error(err))?;
        tmp.persist(&self.path)
            .map_err(|err| self.io_error(err.error))?;
        Ok(())
    }

    fn modify<F>(&self, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<String, StoredValue>),
    {
        fs::create_dir_all(self.parent_dir()).map_err(|err| self.io_error(err))?;
        let _lock = self.lock_exclusive()?;
        let mut document = self.read_document()?;
        change(&mut document);
        self.write_document(&document)
    }

    /// Block until this process owns `<path>.lock`. The lock is released
    /// when the returned file is dropped.
    fn lock_exclusive(&self) -> Result<File, StorageError> {
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&lock_path)
            .map_err(|err| self.io_error(err))?;

        loop {
            // SAFETY: `file` owns a valid descriptor for the whole call.
            #[allow(unsafe_code)]
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result == 0 {
                return Ok(file);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(self.io_error(err));
            }
        }
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError> {
        Ok(self.read_document()?.remove(key))
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StorageError> {
        self.modify(|doc| {
            doc.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.modify(|doc| {
            doc.remove(key);
        })
    }
}

/// Snapshot of everything persisted for one enrollment scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollmentRecord {
    pub credential_hash: Option<String>,
    pub failure_block_started_at: Option<i64>,
    pub last_successful_unlock_at: Option<i64>,
}

impl EnrollmentRecord {
    pub fn load<S: CredentialStore + ?Sized>(store: &S) -> Result<Self, StorageError> {
        Ok(Self {
            credential_hash: store.get_text(KEY_CREDENTIAL_HASH)?,
            failure_block_started_at: store.get_millis(KEY_FAILURE_BLOCK_START)?,
            last_successful_unlock_at: store.get_millis(KEY_LAST_UNLOCK_SUCCESS)?,
        })
    }

    pub fn is_enrolled(&self) -> bool {
        self.credential_hash.is_some()
    }
}

/// Whether `store` holds an enrolled secret.
///
/// Looks only at the default credential key, so it answers for whatever
/// scope `store` was opened on without building an engine. Engines that
/// remap storage should be queried directly instead.
pub fn has_enrolled_secret<S: CredentialStore + ?Sized>(store: &S) -> Result<bool, StorageError> {
    Ok(store.get_text(KEY_CREDENTIAL_HASH)?.is_some())
}

/// Drop the enrolled secret from `store`, leaving lockout timestamps alone.
pub fn remove_enrolled_secret<S: CredentialStore + ?Sized>(store: &S) -> Result<(), StorageError> {
    store.remove(KEY_CREDENTIAL_HASH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn memory_store_round_trips_and_removes() {
        let store = MemoryStore::new();
        store
            .put(KEY_CREDENTIAL_HASH, StoredValue::Text("abc".into()))
            .unwrap();
        assert_eq!(store.get_text(KEY_CREDENTIAL_HASH).unwrap(), Some("abc".into()));
        store.remove(KEY_CREDENTIAL_HASH).unwrap();
        assert_eq!(store.get(KEY_CREDENTIAL_HASH).unwrap(), None);
    }

    #[test]
    fn zero_millis_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .put(KEY_FAILURE_BLOCK_START, StoredValue::Millis(0))
            .unwrap();
        assert_eq!(store.get_millis(KEY_FAILURE_BLOCK_START).unwrap(), None);
    }

    #[test]
    fn mismatched_value_type_is_corrupt() {
        let store = MemoryStore::new();
        store
            .put(KEY_LAST_UNLOCK_SUCCESS, StoredValue::Text("yesterday".into()))
            .unwrap();
        let err = store.get_millis(KEY_LAST_UNLOCK_SUCCESS).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_scope(dir.path(), DEFAULT_SCOPE);
        assert_eq!(store.get(KEY_CREDENTIAL_HASH).unwrap(), None);
        assert!(!has_enrolled_secret(&store).unwrap());
    }

    #[test]
    fn file_store_writes_are_visible_to_other_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("pins.json");
        let writer = FileStore::new(&path);
        let reader = FileStore::new(&path);

        writer
            .put(KEY_CREDENTIAL_HASH, StoredValue::Text("abc".into()))
            .unwrap();
        writer
            .put(KEY_LAST_UNLOCK_SUCCESS, StoredValue::Millis(42))
            .unwrap();

        let record = EnrollmentRecord::load(&reader).unwrap();
        assert_eq!(record.credential_hash.as_deref(), Some("abc"));
        assert_eq!(record.last_successful_unlock_at, Some(42));
        assert_eq!(record.failure_block_started_at, None);

        let metadata = fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn file_store_persists_as_json_with_legacy_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::open_scope(dir.path(), DEFAULT_SCOPE);
        store
            .put(KEY_FAILURE_BLOCK_START, StoredValue::Millis(1_700_000_000_000))
            .unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["pin__unlock_failure_time"], 1_700_000_000_000i64);
    }

    #[test]
    fn file_store_handles_on_one_file_keep_each_others_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pins.json");
        let first = FileStore::new(&path);
        let second = FileStore::new(&path);

        for round in 0..100i64 {
            let barrier = Barrier::new(2);
            thread::scope(|scope| {
                let a = scope.spawn(|| {
                    barrier.wait();
                    first.put(KEY_FAILURE_BLOCK_START, StoredValue::Millis(round + 1))
                });
                let b = scope.spawn(|| {
                    barrier.wait();
                    second.put(KEY_LAST_UNLOCK_SUCCESS, StoredValue::Millis(round + 1))
                });
                a.join().unwrap().unwrap();
                b.join().unwrap().unwrap();
            });

            let record = EnrollmentRecord::load(&first).unwrap();
            assert_eq!(record.failure_block_started_at, Some(round + 1));
            assert_eq!(record.last_successful_unlock_at, Some(round + 1));
            first.remove(KEY_FAILURE_BLOCK_START).unwrap();
            second.remove(KEY_LAST_UNLOCK_SUCCESS).unwrap();
        }

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name != "pins.json" && name != "pins.json.lock")
            .collect();
        assert!(leftovers.is_empty(), "stray temp files: {leftovers:?}");
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pins.json");
        fs::write(&path, "not json").unwrap();
        let store = FileStore::new(&path);
        assert!(matches!(
            store.get(KEY_CREDENTIAL_HASH).unwrap_err(),
            StorageError::Corrupt { .. }
        ));
    }

    #[test]
    fn remove_enrolled_secret_keeps_timestamps() {
        let store = MemoryStore::new();
        store
            .put(KEY_CREDENTIAL_HASH, StoredValue::Text("abc".into()))
            .unwrap();
        store
            .put(KEY_LAST_UNLOCK_SUCCESS, StoredValue::Millis(7))
            .unwrap();

        assert!(has_enrolled_secret(&store).unwrap());
        remove_enrolled_secret(&store).unwrap();
        assert!(!has_enrolled_secret(&store).unwrap());
        assert_eq!(store.get_millis(KEY_LAST_UNLOCK_SUCCESS).unwrap(), Some(7));
    }
}
