//! `CardContext`: the application context owning the sync chain.
//!
//! Every externally triggered event runs the whole chain under one lock:
//!
//! ```text
//! write:    validate → mutate → save → encode → activate
//! batch:    validate all → (mutate → save)* → encode → activate
//! startup:  load all → encode → activate
//! ```
//!
//! A second event never observes, encodes or activates a half-updated record.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::emulation::{
    EmulationController, EmulationState, FieldPresence, Indicator, TagEmulator,
};
use crate::errors::{ErrorCategory, FieldError};
use crate::field::{FieldId, validate_write};
use crate::ndef::TagEncoder;
use crate::persistence::{DurableStore, LoadReport, PersistenceBridge};
use crate::record::FieldStore;

/// Counters over the lifetime of the context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub writes: u64,
    pub rejected_writes: u64,
    pub save_failures: u64,
    pub refreshes: u64,
    pub encode_failures: u64,
    pub activations: u64,
    pub activation_failures: u64,
}

/// How the encode + activate step of a chain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Activated { payload_len: usize },
    /// Record did not fit; the previous payload stays live.
    EncodeFailed,
    /// Payload encoded but emulation is left stopped.
    ActivationFailed,
}

/// Result of an accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes accepted.
    pub written: usize,
    /// Whether the durable store took the new value.
    pub persisted: bool,
    pub refresh: RefreshOutcome,
}

/// Result of the startup load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// `None` when the store could not be read at all.
    pub load: Option<LoadReport>,
    pub refresh: RefreshOutcome,
}

/// One segment of a batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldWrite<'a> {
    pub field: FieldId,
    pub offset: usize,
    pub data: &'a [u8],
}

struct Chain {
    record: FieldStore,
    encoder: TagEncoder,
    bridge: PersistenceBridge,
    controller: EmulationController,
    stats: SyncStats,
}

impl Chain {
    fn reject(&mut self, id: FieldId, offset: usize, len: usize) {
        self.stats.rejected_writes += 1;
        tracing::warn!(
            field = %id,
            offset,
            len,
            max = id.max_len(),
            category = ErrorCategory::OutOfBounds.as_str(),
            "write rejected"
        );
    }

    /// Mutate and save one field. Returns whether the save went through.
    fn apply(&mut self, id: FieldId, offset: usize, data: &[u8]) -> Result<bool, FieldError> {
        if let Err(e) = self.record.apply_write(id, offset, data) {
            self.reject(id, offset, data.len());
            return Err(e);
        }
        self.stats.writes += 1;
        tracing::info!(
            field = %id,
            offset,
            len = data.len(),
            value = %self.record.field(id).to_string_lossy(),
            "field written"
        );

        let value = self.record.field(id).persisted_bytes();
        let persisted = self.bridge.save(id, &value).is_ok();
        if !persisted {
            self.stats.save_failures += 1;
        }
        Ok(persisted)
    }

    fn refresh(&mut self) -> RefreshOutcome {
        self.stats.refreshes += 1;
        let payload = match self.encoder.encode(&self.record) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.encode_failures += 1;
                tracing::warn!(
                    category = ErrorCategory::EncodingOverflow.as_str(),
                    "tag payload not rebuilt, previous payload kept: {e}"
                );
                return RefreshOutcome::EncodeFailed;
            }
        };
        match self.controller.activate(payload) {
            Ok(()) => {
                self.stats.activations += 1;
                RefreshOutcome::Activated {
                    payload_len: payload.len(),
                }
            }
            Err(_) => {
                self.stats.activation_failures += 1;
                RefreshOutcome::ActivationFailed
            }
        }
    }
}

/// Single owner of the contact record and everything derived from it.
pub struct CardContext {
    chain: Mutex<Chain>,
    indicator: Box<dyn Indicator>,
}

impl CardContext {
    /// Build the context around its ports. Fields start at their defaults;
    /// nothing is encoded until [`CardContext::startup`].
    pub fn new(
        store: Box<dyn DurableStore>,
        emulator: Box<dyn TagEmulator>,
        indicator: Box<dyn Indicator>,
    ) -> Self {
        Self {
            chain: Mutex::new(Chain {
                record: FieldStore::new(),
                encoder: TagEncoder::new(),
                bridge: PersistenceBridge::new(store),
                controller: EmulationController::new(emulator),
                stats: SyncStats::default(),
            }),
            indicator,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore stored fields, then run exactly one encode + activate cycle
    /// whether or not anything was restored.
    pub fn startup(&self) -> StartupReport {
        let mut chain = self.lock();
        let Chain { record, bridge, .. } = &mut *chain;
        let load = bridge.load_all(record).ok();
        if let Some(report) = &load {
            tracing::info!(
                restored = report.restored.len(),
                skipped = report.skipped.len(),
                "stored fields loaded"
            );
        }
        let refresh = chain.refresh();
        StartupReport { load, refresh }
    }

    /// Current content of a field.
    pub fn read_field(&self, id: FieldId) -> Vec<u8> {
        self.lock().record.read_field(id).to_vec()
    }

    /// Apply a (reassembled) write and run the rest of the chain.
    ///
    /// Out-of-bounds writes are rejected before anything changes. Save and
    /// activation failures are reported in the outcome, never as an error:
    /// the write itself stands.
    pub fn write_field(
        &self,
        id: FieldId,
        offset: usize,
        data: &[u8],
    ) -> Result<WriteOutcome, FieldError> {
        let mut chain = self.lock();
        let persisted = chain.apply(id, offset, data)?;
        let refresh = chain.refresh();
        Ok(WriteOutcome {
            written: data.len(),
            persisted,
            refresh,
        })
    }

    /// Apply several writes as one update: every segment is checked first,
    /// then all are applied and saved in order, then the tag payload is
    /// rebuilt once. The reader never sees a payload with only some of the
    /// segments in it.
    ///
    /// One outcome per segment; they share the refresh result.
    pub fn write_fields(
        &self,
        writes: &[FieldWrite<'_>],
    ) -> Result<Vec<WriteOutcome>, FieldError> {
        let mut chain = self.lock();
        for w in writes {
            if let Err(e) = validate_write(w.field, w.offset, w.data.len()) {
                chain.reject(w.field, w.offset, w.data.len());
                return Err(e);
            }
        }
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        let mut applied = Vec::with_capacity(writes.len());
        for w in writes {
            let persisted = chain.apply(w.field, w.offset, w.data)?;
            applied.push((w.data.len(), persisted));
        }
        let refresh = chain.refresh();
        Ok(applied
            .into_iter()
            .map(|(written, persisted)| WriteOutcome {
                written,
                persisted,
                refresh,
            })
            .collect())
    }

    /// Field values as lossy text, in record order.
    pub fn snapshot(&self) -> Vec<(FieldId, String)> {
        self.lock().record.snapshot()
    }

    /// Bytes of the last successfully encoded payload.
    pub fn payload(&self) -> Vec<u8> {
        self.lock().encoder.payload().as_bytes().to_vec()
    }

    pub fn emulation_state(&self) -> EmulationState {
        self.lock().controller.state()
    }

    pub fn stats(&self) -> SyncStats {
        self.lock().stats
    }

    /// Reader field presence changed. Only the indicator follows it; the
    /// sync chain is never touched.
    pub fn on_field_presence(&self, presence: FieldPresence) {
        self.indicator
            .set_field_indicator(presence == FieldPresence::On);
    }
}
