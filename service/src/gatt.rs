//! Field endpoints of the card's remote protocol.
//!
//! One primary service with one characteristic per field. Every
//! characteristic is readable and writable over an encrypted link only, and
//! announces reliable writes through its extended-properties descriptor.
//!
//! ## Reliable writes
//!
//! Prepared writes are staged per connection. Execute merges chunks that
//! continue each other (same field, next offset) into one segment and
//! applies all segments, in arrival order, as one card update; cancel drops
//! the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use bizcard_core::config::ServiceConfig;
use bizcard_core::{
    CardContext, ErrorCategory, FieldError, FieldId, FieldWrite, WriteOutcome, validate_write,
};
use thiserror::Error;

/// Primary service holding the five field characteristics.
pub const SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcdef0";

/// Characteristic identifier: a 16-bit assigned number or a full 128-bit UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttUuid {
    Short(u16),
    Long(&'static str),
}

impl std::fmt::Display for AttUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Short(n) => write!(f, "0x{n:04X}"),
            Self::Long(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Read,
    Write,
    ExtendedProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadEncrypted,
    WriteEncrypted,
    PrepareWrite,
}

impl Property {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ExtendedProperties => "extended_properties",
        }
    }
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadEncrypted => "read_encrypted",
            Self::WriteEncrypted => "write_encrypted",
            Self::PrepareWrite => "prepare_write",
        }
    }
}

const FIELD_PROPERTIES: &[Property] = &[
    Property::Read,
    Property::Write,
    Property::ExtendedProperties,
];

const FIELD_PERMISSIONS: &[Permission] = &[
    Permission::ReadEncrypted,
    Permission::WriteEncrypted,
    Permission::PrepareWrite,
];

/// One field characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub field: FieldId,
    pub uuid: AttUuid,
    pub properties: &'static [Property],
    pub permissions: &'static [Permission],
    /// Reliable-write bit of the extended-properties descriptor.
    pub reliable_write: bool,
}

impl Endpoint {
    const fn field(field: FieldId, uuid: AttUuid) -> Self {
        Self {
            field,
            uuid,
            properties: FIELD_PROPERTIES,
            permissions: FIELD_PERMISSIONS,
            reliable_write: true,
        }
    }

    /// Value of the extended-properties descriptor (little-endian u16).
    pub fn extended_properties(&self) -> [u8; 2] {
        [u8::from(self.reliable_write), 0x00]
    }
}

/// Field characteristics in record order.
pub static ENDPOINTS: [Endpoint; 5] = [
    Endpoint::field(FieldId::FirstName, AttUuid::Short(0x2A8A)),
    Endpoint::field(FieldId::LastName, AttUuid::Short(0x2A90)),
    Endpoint::field(FieldId::Email, AttUuid::Short(0x2A87)),
    Endpoint::field(
        FieldId::Address,
        AttUuid::Long("12345678-1234-5678-1234-56789abcdef2"),
    ),
    Endpoint::field(
        FieldId::PhoneNumber,
        AttUuid::Long("12345678-1234-5678-1234-56789abcdef3"),
    ),
];

/// Characteristic serving `field`.
pub fn endpoint(field: FieldId) -> &'static Endpoint {
    match field {
        FieldId::FirstName => &ENDPOINTS[0],
        FieldId::LastName => &ENDPOINTS[1],
        FieldId::Email => &ENDPOINTS[2],
        FieldId::Address => &ENDPOINTS[3],
        FieldId::PhoneNumber => &ENDPOINTS[4],
    }
}

/// Protocol-level rejection, mapped onto ATT error codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttError {
    #[error("invalid offset {offset} for {field}")]
    InvalidOffset { field: FieldId, offset: usize },

    #[error("link is not encrypted")]
    InsufficientEncryption,

    #[error("prepare queue full ({limit} writes staged)")]
    PrepareQueueFull { limit: usize },
}

impl AttError {
    /// ATT error code.
    pub const fn code(&self) -> u8 {
        match self {
            Self::InvalidOffset { .. } => 0x07,
            Self::PrepareQueueFull { .. } => 0x09,
            Self::InsufficientEncryption => 0x0F,
        }
    }
}

impl From<FieldError> for AttError {
    fn from(e: FieldError) -> Self {
        match e {
            FieldError::OutOfBounds { field, offset, .. } => Self::InvalidOffset { field, offset },
        }
    }
}

/// One staged chunk, or after reassembly, one contiguous segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedWrite {
    pub field: FieldId,
    pub offset: usize,
    pub data: Vec<u8>,
}

/// A segment applied by execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedWrite {
    pub field: FieldId,
    pub offset: usize,
    pub outcome: WriteOutcome,
}

/// Per-connection link state.
#[derive(Debug, Default)]
pub struct Link {
    encrypted: bool,
    queue: Vec<PreparedWrite>,
}

impl Link {
    pub fn new(encrypted: bool) -> Self {
        Self {
            encrypted,
            queue: Vec::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
    }

    /// Number of staged chunks.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Merge chunks that continue the previous one into a single segment.
pub fn reassemble(chunks: Vec<PreparedWrite>) -> Vec<PreparedWrite> {
    let mut segments: Vec<PreparedWrite> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if let Some(last) = segments.last_mut()
            && last.field == chunk.field
            && last.offset + last.data.len() == chunk.offset
        {
            last.data.extend_from_slice(&chunk.data);
            continue;
        }
        segments.push(chunk);
    }
    segments
}

/// Limits applied by the [`ProtocolServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub require_encryption: bool,
    pub prepare_queue_limit: usize,
    pub max_read_len: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for ServerOptions {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            require_encryption: cfg.require_encryption,
            prepare_queue_limit: cfg.prepare_queue_limit,
            max_read_len: cfg.max_read_len,
        }
    }
}

/// Serves the field endpoints on top of a shared [`CardContext`].
pub struct ProtocolServer {
    ctx: Arc<CardContext>,
    options: ServerOptions,
    started: Instant,
    connections: AtomicUsize,
}

impl ProtocolServer {
    pub fn new(ctx: Arc<CardContext>, options: ServerOptions) -> Self {
        Self {
            ctx,
            options,
            started: Instant::now(),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn context(&self) -> &CardContext {
        &self.ctx
    }

    pub fn options(&self) -> ServerOptions {
        self.options
    }

    pub fn uptime_s(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn check_link(&self, link: &Link) -> Result<(), AttError> {
        if self.options.require_encryption && !link.encrypted {
            tracing::warn!("request on unencrypted link rejected");
            return Err(AttError::InsufficientEncryption);
        }
        Ok(())
    }

    fn check_bounds(field: FieldId, offset: usize, len: usize) -> Result<(), AttError> {
        validate_write(field, offset, len).map_err(|e| {
            tracing::warn!(
                field = %field,
                offset,
                len,
                category = ErrorCategory::OutOfBounds.as_str(),
                "write rejected at the endpoint"
            );
            AttError::from(e)
        })
    }

    /// Read window of a field starting at `offset`.
    pub fn read(&self, link: &Link, field: FieldId, offset: usize) -> Result<Vec<u8>, AttError> {
        self.check_link(link)?;
        let value = self.ctx.read_field(field);
        if offset > value.len() {
            tracing::debug!(field = %field, offset, len = value.len(), "read past end");
            return Err(AttError::InvalidOffset { field, offset });
        }
        let end = value
            .len()
            .min(offset.saturating_add(self.options.max_read_len));
        Ok(value[offset..end].to_vec())
    }

    /// Plain write: validated here, then run through the full chain.
    pub fn write(
        &self,
        link: &Link,
        field: FieldId,
        offset: usize,
        data: &[u8],
    ) -> Result<WriteOutcome, AttError> {
        self.check_link(link)?;
        Self::check_bounds(field, offset, data.len())?;
        Ok(self.ctx.write_field(field, offset, data)?)
    }

    /// Stage a chunk of a reliable write. Returns the queue length.
    pub fn prepare(
        &self,
        link: &mut Link,
        field: FieldId,
        offset: usize,
        data: Vec<u8>,
    ) -> Result<usize, AttError> {
        self.check_link(link)?;
        Self::check_bounds(field, offset, data.len())?;
        let limit = self.options.prepare_queue_limit;
        if link.queue.len() >= limit {
            tracing::warn!(limit, "prepare queue full");
            return Err(AttError::PrepareQueueFull { limit });
        }
        link.queue.push(PreparedWrite {
            field,
            offset,
            data,
        });
        Ok(link.queue.len())
    }

    /// Apply (`commit`) or drop the staged chunks. The queue is empty
    /// afterwards either way.
    ///
    /// Every segment is checked before the first one is applied, so a
    /// rejected execute changes nothing. The tag payload is rebuilt once for
    /// the whole queue.
    pub fn execute(&self, link: &mut Link, commit: bool) -> Result<Vec<ExecutedWrite>, AttError> {
        let chunks = std::mem::take(&mut link.queue);
        if !commit {
            tracing::debug!(discarded = chunks.len(), "prepared writes cancelled");
            return Ok(Vec::new());
        }
        self.check_link(link)?;

        let segments = reassemble(chunks);
        for segment in &segments {
            Self::check_bounds(segment.field, segment.offset, segment.data.len())?;
        }

        let writes: Vec<FieldWrite<'_>> = segments
            .iter()
            .map(|s| FieldWrite {
                field: s.field,
                offset: s.offset,
                data: &s.data,
            })
            .collect();
        let outcomes = self.ctx.write_fields(&writes)?;
        Ok(segments
            .iter()
            .zip(outcomes)
            .map(|(segment, outcome)| ExecutedWrite {
                field: segment.field,
                offset: segment.offset,
                outcome,
            })
            .collect())
    }
}
