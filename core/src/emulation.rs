//! Tag emulation controller: hot-swaps the payload a proximity reader sees.
//!
//! Activation is stop → install → start. Stopping an already stopped
//! emulator is fine. A failed stop is logged and the swap goes on. If
//! installing or starting fails the emulator is left stopped, or in an
//! unknown state when the stop failed too; the next successful field change
//! tries again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::errors::{EmulationError, ErrorCategory};
use crate::ndef::EncodedPayload;

/// Result of asking the emulator to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Port to the proximity-tag emulation hardware.
pub trait TagEmulator: Send {
    fn stop(&mut self) -> Result<StopOutcome, EmulationError>;

    /// Install the bytes to present. Called only while stopped.
    fn set_payload(&mut self, payload: &[u8]) -> Result<(), EmulationError>;

    fn start(&mut self) -> Result<(), EmulationError>;
}

/// Reader field presence, as signalled by the tag hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPresence {
    On,
    Off,
}

/// Port to the status indicator that mirrors reader field presence.
pub trait Indicator: Send + Sync {
    fn set_field_indicator(&self, on: bool);
}

/// Indicator that only logs.
#[derive(Debug, Default)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn set_field_indicator(&self, on: bool) {
        tracing::info!(on, "reader field indicator");
    }
}

/// What the reader currently sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationState {
    Stopped,
    Emulating { payload_len: usize },
    /// Stop failed and the swap did not complete: the previous payload may
    /// still be presented.
    Unknown,
}

/// Drives the [`TagEmulator`] port.
pub struct EmulationController {
    emulator: Box<dyn TagEmulator>,
    state: EmulationState,
}

impl EmulationController {
    pub fn new(emulator: Box<dyn TagEmulator>) -> Self {
        Self {
            emulator,
            state: EmulationState::Stopped,
        }
    }

    /// Swap the emulated payload for `payload`.
    pub fn activate(&mut self, payload: &EncodedPayload) -> Result<(), EmulationError> {
        match self.swap(payload) {
            Ok(()) => {
                self.state = EmulationState::Emulating {
                    payload_len: payload.len(),
                };
                tracing::info!(len = payload.len(), "tag emulation started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    category = ErrorCategory::EmulationFailure.as_str(),
                    state = ?self.state,
                    "tag emulation not restarted: {e}"
                );
                Err(e)
            }
        }
    }

    fn swap(&mut self, payload: &EncodedPayload) -> Result<(), EmulationError> {
        self.state = match self.emulator.stop() {
            Ok(StopOutcome::Stopped) => EmulationState::Stopped,
            Ok(StopOutcome::AlreadyStopped) => {
                tracing::debug!("tag emulation already stopped");
                EmulationState::Stopped
            }
            Err(e) => {
                tracing::warn!(
                    category = ErrorCategory::EmulationFailure.as_str(),
                    "stopping tag emulation failed, installing anyway: {e}"
                );
                EmulationState::Unknown
            }
        };
        self.emulator.set_payload(payload.as_bytes())?;
        self.emulator.start()
    }

    pub fn state(&self) -> EmulationState {
        self.state
    }
}

/// One call seen by a [`RecordingEmulator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatorCall {
    Stop,
    SetPayload(Vec<u8>),
    Start,
}

/// Emulator that records every call, with injectable failures.
///
/// Shared through an `Arc` so the caller keeps a handle for inspection.
#[derive(Debug, Default)]
pub struct RecordingEmulator {
    calls: Mutex<Vec<EmulatorCall>>,
    running: AtomicBool,
    fail_stop: AtomicBool,
    fail_set_payload: AtomicBool,
    fail_start: AtomicBool,
}

impl RecordingEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EmulatorCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads installed so far, oldest first.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EmulatorCall::SetPayload(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_set_payload(&self, fail: bool) {
        self.fail_set_payload.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    fn record(&self, call: EmulatorCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl TagEmulator for std::sync::Arc<RecordingEmulator> {
    fn stop(&mut self) -> Result<StopOutcome, EmulationError> {
        self.record(EmulatorCall::Stop);
        if self.fail_stop.load(Ordering::Relaxed) {
            return Err(EmulationError::Stop("injected failure".to_string()));
        }
        if self.running.swap(false, Ordering::Relaxed) {
            Ok(StopOutcome::Stopped)
        } else {
            Ok(StopOutcome::AlreadyStopped)
        }
    }

    fn set_payload(&mut self, payload: &[u8]) -> Result<(), EmulationError> {
        if self.fail_set_payload.load(Ordering::Relaxed) {
            return Err(EmulationError::SetPayload("injected failure".to_string()));
        }
        self.record(EmulatorCall::SetPayload(payload.to_vec()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), EmulationError> {
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(EmulationError::Start("injected failure".to_string()));
        }
        self.record(EmulatorCall::Start);
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }
}
