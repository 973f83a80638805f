//! Field synchronization engine for the contact-card device.
//!
//! The card keeps five text fields and presents them through two channels:
//! a remote read/write protocol and an emulated proximity tag carrying an
//! NDEF text message. This crate is the part in between:
//!
//! - [`record::FieldStore`] owns the five bounded buffers.
//! - [`field::validate_write`] rejects writes past a field's capacity.
//! - [`persistence::PersistenceBridge`] saves changed fields and restores them at startup.
//! - [`ndef::TagEncoder`] rebuilds the tag payload, all or nothing.
//! - [`emulation::EmulationController`] hot-swaps the payload the reader sees.
//! - [`context::CardContext`] runs the whole chain under one lock.
//!
//! Hardware and storage are reached only through the [`TagEmulator`],
//! [`DurableStore`] and [`Indicator`] ports.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod context;
pub mod emulation;
pub mod errors;
pub mod field;
pub mod ndef;
pub mod persistence;
pub mod record;

pub use config::CardConfig;
pub use context::{
    CardContext, FieldWrite, RefreshOutcome, StartupReport, SyncStats, WriteOutcome,
};
pub use emulation::{
    EmulationController, EmulationState, FieldPresence, Indicator, LogIndicator, StopOutcome,
    TagEmulator,
};
pub use errors::{
    ConfigError, EmulationError, EncodeError, ErrorCategory, FieldError, PersistenceError,
};
pub use field::{FieldBuffer, FieldId, validate_write};
pub use ndef::{EncodedPayload, PAYLOAD_CAPACITY, TagEncoder};
pub use persistence::{DurableStore, LoadReport, PersistedEntry, PersistenceBridge};
pub use record::FieldStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
