//! Active key persistence and "same key" reconciliation
//!
//! One [`ActiveKeyRecord`] is live per identity. Encryption reconciles a
//! freshly derived key against it (rotating on disagreement); decryption only
//! checks and never rotates.

use crate::atomic::write_atomic;
use crate::kdf::DerivedKey;
use crate::templates::is_valid_identity;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

const KEY_FILE: &str = "active.key";
const SIDECAR_FILE: &str = "active.json";

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Derived key does not match the active key for '{0}'")]
    KeyMismatch(String),

    #[error("No active key for '{0}'")]
    NoActiveKey(String),

    #[error("Active key record is corrupt: {0}")]
    Corrupt(String),

    #[error("Invalid identity '{0}'")]
    InvalidIdentity(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Key record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Operation that last wrote the active key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOperation {
    Encrypt,
    Decrypt,
}

impl fmt::Display for KeyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOperation::Encrypt => f.write_str("encrypt"),
            KeyOperation::Decrypt => f.write_str("decrypt"),
        }
    }
}

/// Persisted form of the active key (the JSON sidecar)
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveKeyRecord {
    pub identity: String,
    pub key_array: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub operation: KeyOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_fingerprint: Option<String>,
}

impl ActiveKeyRecord {
    pub fn from_key(identity: &str, key: &DerivedKey, operation: KeyOperation) -> Self {
        Self {
            identity: identity.to_string(),
            key_array: key.key_array(),
            timestamp: key.derived_at(),
            operation,
            feature_hash: key.feature_hash().map(str::to_string),
            enrollment_fingerprint: key.enrollment_fingerprint().map(str::to_string),
        }
    }

    pub fn to_key(&self) -> DerivedKey {
        DerivedKey::from_parts(
            self.key_array.clone(),
            self.timestamp,
            self.feature_hash.clone(),
            self.enrollment_fingerprint.clone(),
        )
    }
}

impl fmt::Debug for ActiveKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveKeyRecord")
            .field("identity", &self.identity)
            .field("key_len", &self.key_array.len())
            .field("timestamp", &self.timestamp)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl Drop for ActiveKeyRecord {
    fn drop(&mut self) {
        self.key_array.zeroize();
    }
}

/// Storage behind the key consistency store
pub trait KeyRecordBackend: Send + Sync {
    /// Load the identity's record, `None` if none was ever stored
    fn load(&self, identity: &str) -> Result<Option<ActiveKeyRecord>, KeyStoreError>;

    /// Replace the identity's record
    fn store(&self, record: &ActiveKeyRecord) -> Result<(), KeyStoreError>;

    /// Remove the identity's record; returns whether one existed
    fn remove(&self, identity: &str) -> Result<bool, KeyStoreError>;
}

/// `active.key` + `active.json` per identity directory
#[derive(Debug, Clone)]
pub struct FileKeyBackend {
    root: PathBuf,
}

impl FileKeyBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, identity: &str) -> PathBuf {
        self.root.join(identity)
    }

    fn staging_dir(&self, identity: &str) -> PathBuf {
        self.root.join(format!(".{}.staging", identity))
    }

    fn retired_dir(&self, identity: &str) -> PathBuf {
        self.root.join(format!(".{}.retired", identity))
    }

    /// Finish or roll back a directory swap interrupted between its two renames
    fn recover_swap(&self, identity: &str) -> Result<(), KeyStoreError> {
        let live = self.dir(identity);
        if live.exists() {
            return Ok(());
        }

        let staging = self.staging_dir(identity);
        let retired = self.retired_dir(identity);
        if staging.join(KEY_FILE).exists() && staging.join(SIDECAR_FILE).exists() {
            warn!("Completing interrupted key swap for '{}'", identity);
            fs::rename(&staging, &live)?;
        } else if retired.exists() {
            warn!("Restoring previous active key for '{}'", identity);
            fs::rename(&retired, &live)?;
        }

        Ok(())
    }
}

fn read_optional(path: &std::path::Path) -> Result<Option<Vec<u8>>, KeyStoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl KeyRecordBackend for FileKeyBackend {
    fn load(&self, identity: &str) -> Result<Option<ActiveKeyRecord>, KeyStoreError> {
        self.recover_swap(identity)?;

        let dir = self.dir(identity);
        let key = read_optional(&dir.join(KEY_FILE))?.map(zeroize::Zeroizing::new);
        let Some(sidecar) = read_optional(&dir.join(SIDECAR_FILE))? else {
            if key.is_some() {
                return Err(KeyStoreError::Corrupt(format!(
                    "'{}' has {} but no {}",
                    identity, KEY_FILE, SIDECAR_FILE
                )));
            }
            return Ok(None);
        };

        let record: ActiveKeyRecord = serde_json::from_slice(&sidecar)?;

        if record.identity != identity {
            return Err(KeyStoreError::Corrupt(format!(
                "sidecar for '{}' names identity '{}'",
                identity, record.identity
            )));
        }

        // The sidecar is authoritative; a stale or missing key file is rewritten from it
        if key.as_deref().map(Vec::as_slice) != Some(record.key_array.as_slice()) {
            warn!(
                "{} for '{}' disagrees with {}, restoring it",
                KEY_FILE, identity, SIDECAR_FILE
            );
            write_atomic(&dir.join(KEY_FILE), &record.key_array)?;
        }

        Ok(Some(record))
    }

    fn store(&self, record: &ActiveKeyRecord) -> Result<(), KeyStoreError> {
        fs::create_dir_all(&self.root)?;

        let staging = self.staging_dir(&record.identity);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        write_atomic(&staging.join(KEY_FILE), &record.key_array)?;
        let sidecar = serde_json::to_vec_pretty(record)?;
        write_atomic(&staging.join(SIDECAR_FILE), &sidecar)?;

        let live = self.dir(&record.identity);
        let retired = self.retired_dir(&record.identity);
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if live.exists() {
            fs::rename(&live, &retired)?;
        }
        fs::rename(&staging, &live)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }

        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<bool, KeyStoreError> {
        for leftover in [self.staging_dir(identity), self.retired_dir(identity)] {
            if leftover.exists() {
                fs::remove_dir_all(&leftover)?;
            }
        }

        let dir = self.dir(identity);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }
}

/// In-process backend, used by tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryKeyBackend {
    records: Mutex<HashMap<String, ActiveKeyRecord>>,
}

impl MemoryKeyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyRecordBackend for MemoryKeyBackend {
    fn load(&self, identity: &str) -> Result<Option<ActiveKeyRecord>, KeyStoreError> {
        Ok(self.records.lock().get(identity).cloned())
    }

    fn store(&self, record: &ActiveKeyRecord) -> Result<(), KeyStoreError> {
        self.records
            .lock()
            .insert(record.identity.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<bool, KeyStoreError> {
        Ok(self.records.lock().remove(identity).is_some())
    }
}

/// When two derived keys count as "the same key"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualityPolicy {
    /// Keys derived under the same enrollment are equal even if their bytes differ
    pub same_enrollment: bool,

    /// Upper bound on the time between the two derivations
    pub max_age_secs: Option<u64>,
}

impl Default for EqualityPolicy {
    fn default() -> Self {
        Self {
            same_enrollment: true,
            max_age_secs: None,
        }
    }
}

/// Authority on which key is live for an identity
pub struct KeyConsistencyStore {
    backend: Box<dyn KeyRecordBackend>,
    policy: EqualityPolicy,
    lock: Mutex<()>,
}

impl fmt::Debug for KeyConsistencyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConsistencyStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl KeyConsistencyStore {
    pub fn new(backend: impl KeyRecordBackend + 'static, policy: EqualityPolicy) -> Self {
        Self {
            backend: Box::new(backend),
            policy,
            lock: Mutex::new(()),
        }
    }

    /// Store backed by `<root>/<identity>/active.{key,json}`
    pub fn file(root: impl Into<PathBuf>, policy: EqualityPolicy) -> Self {
        Self::new(FileKeyBackend::new(root), policy)
    }

    pub fn in_memory(policy: EqualityPolicy) -> Self {
        Self::new(MemoryKeyBackend::new(), policy)
    }

    /// The identity's active key, if any
    pub fn load_active(&self, identity: &str) -> Result<Option<DerivedKey>, KeyStoreError> {
        check_identity(identity)?;
        let _guard = self.lock.lock();
        Ok(self.backend.load(identity)?.map(|record| record.to_key()))
    }

    /// Whether `b` is a re-derivation of `a` under the configured policy
    pub fn is_equal(&self, a: &DerivedKey, b: &DerivedKey) -> bool {
        if a.same_bytes(b) {
            return true;
        }

        if !self.policy.same_enrollment || a.len() != b.len() {
            return false;
        }

        let same_enrollment = match (a.enrollment_fingerprint(), b.enrollment_fingerprint()) {
            (Some(fa), Some(fb)) => fa == fb,
            _ => false,
        };

        let within_age = match self.policy.max_age_secs {
            Some(max) => (a.derived_at() - b.derived_at()).num_seconds().unsigned_abs() <= max,
            None => true,
        };

        same_enrollment && within_age
    }

    /// Return the key to use for encryption
    ///
    /// The stored key wins when it is equal to `candidate`; otherwise
    /// `candidate` becomes the active key.
    pub fn reconcile(
        &self,
        identity: &str,
        candidate: DerivedKey,
        operation: KeyOperation,
    ) -> Result<DerivedKey, KeyStoreError> {
        check_identity(identity)?;
        let _guard = self.lock.lock();

        if let Some(record) = self.backend.load(identity)? {
            let stored = record.to_key();
            if self.is_equal(&stored, &candidate) {
                debug!("Candidate key for '{}' matches the active key", identity);
                return Ok(stored);
            }
        }

        self.backend
            .store(&ActiveKeyRecord::from_key(identity, &candidate, operation))?;
        info!(
            "Active key for '{}' replaced ({} bytes, {})",
            identity,
            candidate.len(),
            operation
        );

        Ok(candidate)
    }

    /// Return the stored key if `candidate` is equal to it; never writes
    pub fn check_for_decrypt(
        &self,
        identity: &str,
        candidate: &DerivedKey,
    ) -> Result<DerivedKey, KeyStoreError> {
        check_identity(identity)?;
        let _guard = self.lock.lock();

        let record = self
            .backend
            .load(identity)?
            .ok_or_else(|| KeyStoreError::NoActiveKey(identity.to_string()))?;
        let stored = record.to_key();

        if self.is_equal(&stored, candidate) {
            Ok(stored)
        } else {
            warn!("Derived key for '{}' does not match the active key", identity);
            Err(KeyStoreError::KeyMismatch(identity.to_string()))
        }
    }

    /// Drop the identity's active key
    pub fn clear(&self, identity: &str) -> Result<bool, KeyStoreError> {
        check_identity(identity)?;
        let _guard = self.lock.lock();
        self.backend.remove(identity)
    }

    pub fn policy(&self) -> &EqualityPolicy {
        &self.policy
    }
}

fn check_identity(identity: &str) -> Result<(), KeyStoreError> {
    if is_valid_identity(identity) {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidIdentity(identity.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn key(byte: u8, fingerprint: Option<&str>) -> DerivedKey {
        let key = DerivedKey::from_bytes(vec![byte; 16]);
        match fingerprint {
            Some(fp) => key.with_enrollment_fingerprint(fp),
            None => key,
        }
    }

    fn strict() -> EqualityPolicy {
        EqualityPolicy {
            same_enrollment: false,
            max_age_secs: None,
        }
    }

    #[test]
    fn test_first_reconcile_persists_candidate() {
        let store = KeyConsistencyStore::in_memory(EqualityPolicy::default());
        assert!(store.load_active("alice").unwrap().is_none());

        let used = store
            .reconcile("alice", key(1, None), KeyOperation::Encrypt)
            .unwrap();
        assert_eq!(used.as_bytes(), &[1u8; 16]);

        let active = store.load_active("alice").unwrap().unwrap();
        assert!(active.same_bytes(&used));
    }

    #[test]
    fn test_reconcile_rotates_on_different_key() {
        let store = KeyConsistencyStore::in_memory(strict());

        store.reconcile("alice", key(1, None), KeyOperation::Encrypt).unwrap();
        let used = store
            .reconcile("alice", key(2, None), KeyOperation::Encrypt)
            .unwrap();

        assert_eq!(used.as_bytes(), &[2u8; 16]);
        assert_eq!(store.load_active("alice").unwrap().unwrap().as_bytes(), &[2u8; 16]);
    }

    #[test]
    fn test_same_enrollment_keeps_stored_key() {
        let store = KeyConsistencyStore::in_memory(EqualityPolicy::default());

        store
            .reconcile("alice", key(1, Some("enr-a")), KeyOperation::Encrypt)
            .unwrap();
        let used = store
            .reconcile("alice", key(9, Some("enr-a")), KeyOperation::Encrypt)
            .unwrap();

        assert_eq!(used.as_bytes(), &[1u8; 16]);
    }

    #[test]
    fn test_is_equal_policy() {
        let store = KeyConsistencyStore::in_memory(EqualityPolicy::default());

        assert!(store.is_equal(&key(3, None), &key(3, None)));
        assert!(!store.is_equal(&key(3, None), &key(4, None)));
        assert!(store.is_equal(&key(3, Some("x")), &key(4, Some("x"))));
        assert!(!store.is_equal(&key(3, Some("x")), &key(4, Some("y"))));

        let long = DerivedKey::from_bytes(vec![3; 32]).with_enrollment_fingerprint("x");
        assert!(!store.is_equal(&key(3, Some("x")), &long));

        let strict = KeyConsistencyStore::in_memory(strict());
        assert!(!strict.is_equal(&key(3, Some("x")), &key(4, Some("x"))));
    }

    #[test]
    fn test_max_age_bounds_enrollment_equality() {
        let store = KeyConsistencyStore::in_memory(EqualityPolicy {
            same_enrollment: true,
            max_age_secs: Some(60),
        });

        let now = Utc::now();
        let fresh = DerivedKey::from_parts(vec![1; 16], now, None, Some("x".into()));
        let recent = DerivedKey::from_parts(vec![2; 16], now - Duration::seconds(30), None, Some("x".into()));
        let stale = DerivedKey::from_parts(vec![2; 16], now - Duration::hours(2), None, Some("x".into()));

        assert!(store.is_equal(&fresh, &recent));
        assert!(!store.is_equal(&fresh, &stale));
    }

    #[test]
    fn test_check_for_decrypt_mismatch_does_not_write() {
        let store = KeyConsistencyStore::in_memory(EqualityPolicy::default());

        assert!(matches!(
            store.check_for_decrypt("alice", &key(1, None)),
            Err(KeyStoreError::NoActiveKey(_))
        ));

        store
            .reconcile("alice", key(1, Some("enr-a")), KeyOperation::Encrypt)
            .unwrap();

        assert!(matches!(
            store.check_for_decrypt("alice", &key(2, Some("enr-b"))),
            Err(KeyStoreError::KeyMismatch(id)) if id == "alice"
        ));
        assert_eq!(store.load_active("alice").unwrap().unwrap().as_bytes(), &[1u8; 16]);

        let used = store
            .check_for_decrypt("alice", &key(7, Some("enr-a")))
            .unwrap();
        assert_eq!(used.as_bytes(), &[1u8; 16]);
    }

    #[test]
    fn test_file_backend_layout() {
        let dir = tempdir().unwrap();
        let store = KeyConsistencyStore::file(dir.path(), EqualityPolicy::default());

        store
            .reconcile("alice", key(5, Some("enr-a")), KeyOperation::Encrypt)
            .unwrap();

        let key_path = dir.path().join("alice").join(KEY_FILE);
        let sidecar_path = dir.path().join("alice").join(SIDECAR_FILE);
        assert_eq!(fs::read(&key_path).unwrap(), vec![5u8; 16]);

        let sidecar: serde_json::Value =
            serde_json::from_slice(&fs::read(&sidecar_path).unwrap()).unwrap();
        assert_eq!(sidecar["operation"], "encrypt");
        assert_eq!(sidecar["key_array"].as_array().unwrap().len(), 16);
        assert!(sidecar["timestamp"].is_string());

        // A fresh store over the same directory sees the same key
        let reopened = KeyConsistencyStore::file(dir.path(), EqualityPolicy::default());
        let active = reopened.load_active("alice").unwrap().unwrap();
        assert_eq!(active.as_bytes(), &[5u8; 16]);
        assert_eq!(active.enrollment_fingerprint(), Some("enr-a"));
    }

    #[test]
    fn test_file_backend_restores_torn_key_file() {
        let dir = tempdir().unwrap();
        let store = KeyConsistencyStore::file(dir.path(), strict());
        store.reconcile("alice", key(5, None), KeyOperation::Encrypt).unwrap();

        // Key file left over from a different write
        let key_path = dir.path().join("alice").join(KEY_FILE);
        fs::write(&key_path, [0x42u8; 16]).unwrap();

        let active = store.load_active("alice").unwrap().unwrap();
        assert_eq!(active.as_bytes(), &[5u8; 16]);
        assert_eq!(fs::read(&key_path).unwrap(), vec![5u8; 16]);

        fs::remove_file(&key_path).unwrap();
        let used = store.check_for_decrypt("alice", &key(5, None)).unwrap();
        assert_eq!(used.as_bytes(), &[5u8; 16]);
        assert!(key_path.exists());

        store.reconcile("alice", key(6, None), KeyOperation::Encrypt).unwrap();
        assert_eq!(fs::read(&key_path).unwrap(), vec![6u8; 16]);
    }

    #[test]
    fn test_file_backend_recovers_interrupted_swap() {
        let dir = tempdir().unwrap();
        let store = KeyConsistencyStore::file(dir.path(), strict());
        store.reconcile("alice", key(5, None), KeyOperation::Encrypt).unwrap();

        // Old record moved aside, new one never renamed in
        let live = dir.path().join("alice");
        let retired = dir.path().join(".alice.retired");
        fs::rename(&live, &retired).unwrap();
        assert_eq!(store.load_active("alice").unwrap().unwrap().as_bytes(), &[5u8; 16]);
        assert!(live.exists());
        assert!(!retired.exists());

        // A complete staged record wins over the retired one
        store.reconcile("alice", key(6, None), KeyOperation::Encrypt).unwrap();
        let staging = dir.path().join(".alice.staging");
        fs::rename(&live, &staging).unwrap();
        assert_eq!(store.load_active("alice").unwrap().unwrap().as_bytes(), &[6u8; 16]);
        assert!(!staging.exists());
    }

    #[test]
    fn test_file_backend_detects_corruption() {
        let dir = tempdir().unwrap();
        let store = KeyConsistencyStore::file(dir.path(), EqualityPolicy::default());
        store.reconcile("alice", key(5, None), KeyOperation::Encrypt).unwrap();

        let sidecar_path = dir.path().join("alice").join(SIDECAR_FILE);
        fs::remove_file(&sidecar_path).unwrap();
        assert!(matches!(
            store.load_active("alice"),
            Err(KeyStoreError::Corrupt(_))
        ));

        let record = ActiveKeyRecord::from_key("bob", &key(5, None), KeyOperation::Encrypt);
        fs::write(&sidecar_path, serde_json::to_vec(&record).unwrap()).unwrap();
        assert!(matches!(
            store.load_active("alice"),
            Err(KeyStoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_invalid_identity() {
        let store = KeyConsistencyStore::in_memory(EqualityPolicy::default());
        assert!(matches!(
            store.reconcile("../x", key(1, None), KeyOperation::Encrypt),
            Err(KeyStoreError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_concurrent_reconcile_leaves_one_consistent_key() {
        let dir = tempdir().unwrap();
        let store = Arc::new(KeyConsistencyStore::file(dir.path(), strict()));

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .reconcile("alice", key(i, None), KeyOperation::Encrypt)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let active = store.load_active("alice").unwrap().unwrap();
        assert!(active.as_bytes().iter().all(|&b| b == active.as_bytes()[0]));
    }
}
