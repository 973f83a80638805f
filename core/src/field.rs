//! The five fixed contact fields and their capacity-bounded buffers.
//!
//! Every field owns `max_len() + 1` bytes: the content, followed by a zero
//! terminator. The only mutation is [`FieldBuffer::apply_write`], which is
//! bounds-checked by [`validate_write`] before a single byte is touched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{FieldError, PersistenceError};

/// Namespace under which fields are persisted.
pub const STORAGE_NAMESPACE: &str = "card";

/// One of the five contact fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    FirstName,
    LastName,
    Email,
    Address,
    PhoneNumber,
}

impl FieldId {
    /// All fields, in tag record order.
    pub const ALL: [FieldId; 5] = [
        FieldId::FirstName,
        FieldId::LastName,
        FieldId::Email,
        FieldId::Address,
        FieldId::PhoneNumber,
    ];

    /// Declared capacity in bytes, excluding the terminator.
    pub const fn max_len(self) -> usize {
        match self {
            Self::FirstName => 20,
            Self::LastName => 20,
            Self::Email => 30,
            Self::Address => 60,
            Self::PhoneNumber => 15,
        }
    }

    /// Short sub-key used in the durable store.
    pub const fn short_tag(self) -> &'static str {
        match self {
            Self::FirstName => "fn",
            Self::LastName => "ln",
            Self::Email => "e",
            Self::Address => "a",
            Self::PhoneNumber => "pn",
        }
    }

    /// Value installed at process start, before persisted values are loaded.
    pub const fn default_value(self) -> &'static str {
        match self {
            Self::FirstName => "Name",
            Self::LastName => "Last Name",
            Self::Email => "email@example.com",
            Self::Address => "Address",
            Self::PhoneNumber => "0000000",
        }
    }

    /// Machine name, as used on the wire and in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Email => "email",
            Self::Address => "address",
            Self::PhoneNumber => "phone_number",
        }
    }

    /// Human-readable label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::FirstName => "First Name",
            Self::LastName => "Last Name",
            Self::Email => "Email",
            Self::Address => "Address",
            Self::PhoneNumber => "Phone Number",
        }
    }

    /// Full durable store key, e.g. `card/fn`.
    pub fn storage_key(self) -> String {
        format!("{STORAGE_NAMESPACE}/{}", self.short_tag())
    }

    /// Parse the machine name (`first_name`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == s)
    }

    /// Parse a short store tag (`fn`, `ln`, `e`, `a`, `pn`).
    pub fn from_short_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.short_tag() == tag)
    }

    /// Resolve a full store key (`card/<tag>`). Keys outside the namespace,
    /// or with further path segments, resolve to `None`.
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let tag = key
            .strip_prefix(STORAGE_NAMESPACE)
            .and_then(|rest| rest.strip_prefix('/'))?;
        if tag.contains('/') {
            return None;
        }
        Self::from_short_tag(tag)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that `len` bytes written at `offset` stay within the field's capacity.
pub fn validate_write(field: FieldId, offset: usize, len: usize) -> Result<(), FieldError> {
    let max = field.max_len();
    match offset.checked_add(len) {
        Some(end) if end <= max => Ok(()),
        _ => Err(FieldError::OutOfBounds {
            field,
            offset,
            len,
            max,
        }),
    }
}

/// Fixed-capacity, zero-terminated field buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBuffer {
    id: FieldId,
    /// Always `id.max_len() + 1` bytes long.
    bytes: Box<[u8]>,
}

impl FieldBuffer {
    /// Buffer holding the field's default value.
    pub fn with_default(id: FieldId) -> Self {
        let mut buffer = Self {
            id,
            bytes: vec![0u8; id.max_len() + 1].into_boxed_slice(),
        };
        let default = id.default_value().as_bytes();
        buffer.bytes[..default.len()].copy_from_slice(default);
        buffer
    }

    pub fn id(&self) -> FieldId {
        self.id
    }

    /// Content length, up to the first terminator.
    pub fn len(&self) -> usize {
        self.bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.id.max_len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current content, without terminator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    /// Lossy text view for logs and displays.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    /// Copy `data` to `offset` and terminate right after it.
    ///
    /// Fails without touching the buffer when the write would exceed the
    /// field's capacity.
    pub fn apply_write(&mut self, offset: usize, data: &[u8]) -> Result<(), FieldError> {
        validate_write(self.id, offset, data.len())?;
        let end = offset + data.len();
        self.bytes[offset..end].copy_from_slice(data);
        self.bytes[end] = 0;
        Ok(())
    }

    /// Content plus terminator, as stored in the durable store.
    pub fn persisted_bytes(&self) -> Vec<u8> {
        let len = self.len();
        self.bytes[..=len].to_vec()
    }

    /// Overwrite the buffer from a persisted value.
    ///
    /// The value is read up to its first terminator; a value without one is
    /// cut at the field's capacity. Values longer than `max_len() + 1` are
    /// rejected and leave the buffer untouched.
    pub fn restore(&mut self, value: &[u8]) -> Result<(), PersistenceError> {
        let max = self.id.max_len();
        if value.len() > max + 1 {
            return Err(PersistenceError::ValueTooLong {
                key: self.id.storage_key(),
                len: value.len(),
                max: max + 1,
            });
        }
        let content_len = value
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(value.len())
            .min(max);
        self.bytes.fill(0);
        self.bytes[..content_len].copy_from_slice(&value[..content_len]);
        Ok(())
    }
}
