//! The contact record: single source of truth for the five fields.

use crate::errors::{FieldError, PersistenceError};
use crate::field::{FieldBuffer, FieldId};

/// Owns the five field buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldStore {
    fields: [FieldBuffer; 5],
}

impl Default for FieldStore {
    fn default() -> Self {
        Self {
            fields: FieldId::ALL.map(FieldBuffer::with_default),
        }
    }
}

impl FieldStore {
    /// Store holding the default value of every field.
    pub fn new() -> Self {
        Self::default()
    }

    fn index(id: FieldId) -> usize {
        match id {
            FieldId::FirstName => 0,
            FieldId::LastName => 1,
            FieldId::Email => 2,
            FieldId::Address => 3,
            FieldId::PhoneNumber => 4,
        }
    }

    pub fn field(&self, id: FieldId) -> &FieldBuffer {
        &self.fields[Self::index(id)]
    }

    /// Current content of a field, up to its terminator.
    pub fn read_field(&self, id: FieldId) -> &[u8] {
        self.field(id).as_bytes()
    }

    /// The single mutation point of the record.
    pub fn apply_write(&mut self, id: FieldId, offset: usize, data: &[u8]) -> Result<(), FieldError> {
        self.fields[Self::index(id)].apply_write(offset, data)
    }

    /// Overwrite a field from its persisted representation.
    pub(crate) fn restore(&mut self, id: FieldId, value: &[u8]) -> Result<(), PersistenceError> {
        self.fields[Self::index(id)].restore(value)
    }

    /// Fields in tag record order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldBuffer> {
        self.fields.iter()
    }

    /// Snapshot of the record as lossy text, in record order.
    pub fn snapshot(&self) -> Vec<(FieldId, String)> {
        self.iter()
            .map(|f| (f.id(), f.to_string_lossy()))
            .collect()
    }
}
