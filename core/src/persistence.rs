//! Persistence bridge between the contact record and the durable store.
//!
//! ## Store layout
//!
//! ```text
//! card/fn   first name     card/a    address
//! card/ln   last name      card/pn   phone number
//! card/e    email
//! ```
//!
//! Values are the raw field bytes including the terminator. Saving is
//! best-effort: a failed save is logged and never undoes the in-memory write.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::errors::{ErrorCategory, PersistenceError};
use crate::field::FieldId;
use crate::record::FieldStore;

/// A key/value pair as found in the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Port to the external durable key/value store.
pub trait DurableStore: Send {
    /// Write one value, replacing any previous one.
    fn save(&mut self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;

    /// Every entry under the card namespace.
    fn load_all(&mut self) -> Result<Vec<PersistedEntry>, PersistenceError>;
}

/// Outcome of a startup load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Fields overwritten from the store.
    pub restored: Vec<FieldId>,
    /// Keys that were present but not applied.
    pub skipped: Vec<String>,
}

/// Saves changed fields and restores all fields at startup.
pub struct PersistenceBridge {
    store: Box<dyn DurableStore>,
}

impl PersistenceBridge {
    pub fn new(store: Box<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Persist one field's current value. Failures are logged.
    pub fn save(&mut self, field: FieldId, value: &[u8]) -> Result<(), PersistenceError> {
        let key = field.storage_key();
        match self.store.save(&key, value) {
            Ok(()) => {
                tracing::debug!(%key, len = value.len(), "field saved");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    %key,
                    category = ErrorCategory::PersistenceFailure.as_str(),
                    "save failed, keeping in-memory value: {e}"
                );
                Err(e)
            }
        }
    }

    /// Overwrite in-memory fields with every stored value.
    ///
    /// A failed store read leaves every field at its current value. Entries
    /// with unknown keys or oversized values are skipped one by one.
    pub fn load_all(&mut self, record: &mut FieldStore) -> Result<LoadReport, PersistenceError> {
        let entries = self.store.load_all().map_err(|e| {
            tracing::warn!(
                category = ErrorCategory::PersistenceFailure.as_str(),
                "loading stored fields failed: {e}"
            );
            e
        })?;

        let mut report = LoadReport::default();
        for entry in entries {
            let Some(field) = FieldId::from_storage_key(&entry.key) else {
                tracing::debug!(key = %entry.key, "ignoring unknown stored key");
                report.skipped.push(entry.key);
                continue;
            };
            match record.restore(field, &entry.value) {
                Ok(()) => {
                    tracing::info!(
                        key = %entry.key,
                        value = %record.field(field).to_string_lossy(),
                        "field restored"
                    );
                    report.restored.push(field);
                }
                Err(e) => {
                    tracing::warn!(
                        key = %entry.key,
                        category = ErrorCategory::PersistenceFailure.as_str(),
                        "stored value rejected: {e}"
                    );
                    report.skipped.push(entry.key);
                }
            }
        }
        Ok(report)
    }
}

/// In-memory store, shared through an `Arc` so tests can inspect it after
/// handing it to the bridge.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an entry, as if written in an earlier boot.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Make every following save fail.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Make every following load fail.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Relaxed);
    }
}

impl DurableStore for std::sync::Arc<MemoryStore> {
    fn save(&mut self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(PersistenceError::Unavailable("injected save failure".to_string()));
        }
        self.insert(key, value);
        Ok(())
    }

    fn load_all(&mut self) -> Result<Vec<PersistedEntry>, PersistenceError> {
        if self.fail_loads.load(Ordering::Relaxed) {
            return Err(PersistenceError::Unavailable("injected load failure".to_string()));
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .map(|(key, value)| PersistedEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }
}
