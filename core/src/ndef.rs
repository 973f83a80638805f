//! NDEF text message encoding for the proximity tag.
//!
//! The tag presents one NDEF message with exactly one well-known text record
//! ("T") per field, in [`FieldId::ALL`] order, each tagged `en`.
//!
//! ```text
//! record      := header type_len payload_len type payload
//! header      := MB | ME | SR | TNF(well-known = 0x01)
//! payload_len := u8 when SR, u32 big-endian otherwise
//! payload     := status lang text      status = utf8(0) | len(lang)
//! ```
//!
//! Encoding is all-or-nothing: the message is sized before a byte is written,
//! and the new bytes replace the live payload only when encoding succeeded.

use crate::errors::EncodeError;
use crate::field::FieldId;
use crate::record::FieldStore;

/// Fixed payload capacity: the sum of all field capacities.
pub const PAYLOAD_CAPACITY: usize = {
    let mut total = 0;
    let mut i = 0;
    while i < FieldId::ALL.len() {
        total += FieldId::ALL[i].max_len();
        i += 1;
    }
    total
};

/// Maximum number of records in one message.
pub const MAX_RECORDS: usize = 5;

/// Language code carried by every record.
pub const LANG_EN: &[u8] = b"en";

const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_SR: u8 = 0x10;
const TNF_WELL_KNOWN: u8 = 0x01;
const TNF_MASK: u8 = 0x07;
const TEXT_RECORD_TYPE: &[u8] = b"T";
const STATUS_LANG_LEN_MASK: u8 = 0x3F;
const STATUS_UTF16: u8 = 0x80;

/// One NDEF text record, borrowing its language code and text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRecord<'a> {
    pub lang: &'a [u8],
    pub text: &'a [u8],
}

impl<'a> TextRecord<'a> {
    pub fn new(lang: &'a [u8], text: &'a [u8]) -> Self {
        Self { lang, text }
    }

    fn payload_len(&self) -> usize {
        1 + self.lang.len() + self.text.len()
    }

    fn is_short(&self) -> bool {
        self.payload_len() <= u8::MAX as usize
    }

    /// Bytes this record takes inside a message.
    pub fn encoded_len(&self) -> usize {
        let len_field = if self.is_short() { 1 } else { 4 };
        1 + 1 + len_field + TEXT_RECORD_TYPE.len() + self.payload_len()
    }

    fn write_into(&self, out: &mut Vec<u8>, first: bool, last: bool) {
        let mut header = TNF_WELL_KNOWN;
        if first {
            header |= FLAG_MB;
        }
        if last {
            header |= FLAG_ME;
        }
        let payload_len = self.payload_len();
        if self.is_short() {
            header |= FLAG_SR;
        }

        out.push(header);
        out.push(TEXT_RECORD_TYPE.len() as u8);
        if self.is_short() {
            out.push(payload_len as u8);
        } else {
            out.extend_from_slice(&(payload_len as u32).to_be_bytes());
        }
        out.extend_from_slice(TEXT_RECORD_TYPE);
        // UTF-8 status: encoding bit clear, language length in the low bits.
        out.push(self.lang.len() as u8 & STATUS_LANG_LEN_MASK);
        out.extend_from_slice(self.lang);
        out.extend_from_slice(self.text);
    }
}

/// An NDEF message under construction, bounded to [`MAX_RECORDS`].
#[derive(Debug, Default)]
pub struct NdefMessage<'a> {
    records: Vec<TextRecord<'a>>,
}

impl<'a> NdefMessage<'a> {
    pub fn new() -> Self {
        Self {
            records: Vec::with_capacity(MAX_RECORDS),
        }
    }

    pub fn push(&mut self, record: TextRecord<'a>) -> Result<(), EncodeError> {
        if self.records.len() >= MAX_RECORDS {
            return Err(EncodeError::TooManyRecords { max: MAX_RECORDS });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[TextRecord<'a>] {
        &self.records
    }

    pub fn encoded_len(&self) -> usize {
        self.records.iter().map(TextRecord::encoded_len).sum()
    }

    /// Encode into `out`, which is cleared first. Fails before writing
    /// anything when the message would exceed `capacity`.
    pub fn encode_into(&self, out: &mut Vec<u8>, capacity: usize) -> Result<(), EncodeError> {
        let needed = self.encoded_len();
        if needed > capacity {
            return Err(EncodeError::PayloadOverflow { needed, capacity });
        }
        out.clear();
        let last = self.records.len().saturating_sub(1);
        for (i, record) in self.records.iter().enumerate() {
            record.write_into(out, i == 0, i == last);
        }
        Ok(())
    }
}

/// Build the message for the current record, in field order.
pub fn build_message(store: &FieldStore) -> Result<NdefMessage<'_>, EncodeError> {
    let mut message = NdefMessage::new();
    for field in store.iter() {
        message.push(TextRecord::new(LANG_EN, field.as_bytes()))?;
    }
    Ok(message)
}

/// The most recently successfully encoded tag payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    bytes: Vec<u8>,
}

impl EncodedPayload {
    fn empty() -> Self {
        Self {
            bytes: Vec::with_capacity(PAYLOAD_CAPACITY),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Rebuilds the tag payload from the contact record.
///
/// Owns two fixed-capacity buffers: the live payload and a scratch buffer.
/// A successful encode fills the scratch buffer and swaps it in; a failed one
/// leaves the live payload as it was.
#[derive(Debug)]
pub struct TagEncoder {
    payload: EncodedPayload,
    scratch: Vec<u8>,
}

impl Default for TagEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TagEncoder {
    pub fn new() -> Self {
        Self {
            payload: EncodedPayload::empty(),
            scratch: Vec::with_capacity(PAYLOAD_CAPACITY),
        }
    }

    /// Encode `store` and make the result the live payload.
    pub fn encode(&mut self, store: &FieldStore) -> Result<&EncodedPayload, EncodeError> {
        let message = build_message(store)?;
        message.encode_into(&mut self.scratch, PAYLOAD_CAPACITY)?;
        std::mem::swap(&mut self.payload.bytes, &mut self.scratch);
        tracing::debug!(len = self.payload.len(), "tag payload encoded");
        Ok(&self.payload)
    }

    /// Live payload; empty until the first successful encode.
    pub fn payload(&self) -> &EncodedPayload {
        &self.payload
    }
}

/// A text record read back from a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    pub lang: String,
    pub text: String,
}

/// Malformed payload seen by [`decode_text_records`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload truncated at byte {0}")]
    Truncated(usize),

    #[error("record {index} is not a well-known text record")]
    NotText { index: usize },

    #[error("record {index} uses UTF-16 text")]
    Utf16 { index: usize },
}

fn take(bytes: &[u8], pos: usize, n: usize) -> Result<&[u8], DecodeError> {
    bytes
        .get(pos..pos.saturating_add(n))
        .ok_or(DecodeError::Truncated(pos))
}

/// Read the text records of a payload the way a tag reader would.
pub fn decode_text_records(bytes: &[u8]) -> Result<Vec<DecodedText>, DecodeError> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let index = records.len();
        let header = take(bytes, pos, 1)?[0];
        let type_len = take(bytes, pos + 1, 1)?[0] as usize;
        pos += 2;
        let payload_len = if header & FLAG_SR != 0 {
            let len = take(bytes, pos, 1)?[0] as usize;
            pos += 1;
            len
        } else {
            let raw = take(bytes, pos, 4)?;
            pos += 4;
            u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
        };
        let record_type = take(bytes, pos, type_len)?;
        pos += type_len;
        if header & TNF_MASK != TNF_WELL_KNOWN || record_type != TEXT_RECORD_TYPE {
            return Err(DecodeError::NotText { index });
        }

        let payload = take(bytes, pos, payload_len)?;
        pos += payload_len;
        let status = *payload.first().ok_or(DecodeError::Truncated(pos))?;
        if status & STATUS_UTF16 != 0 {
            return Err(DecodeError::Utf16 { index });
        }
        let lang_len = (status & STATUS_LANG_LEN_MASK) as usize;
        let lang = payload
            .get(1..1 + lang_len)
            .ok_or(DecodeError::Truncated(pos))?;
        let text = &payload[1 + lang_len..];
        records.push(DecodedText {
            lang: String::from_utf8_lossy(lang).into_owned(),
            text: String::from_utf8_lossy(text).into_owned(),
        });

        if header & FLAG_ME != 0 {
            break;
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn capacity_is_sum_of_fields() {
        assert_eq!(PAYLOAD_CAPACITY, 145);
    }

    #[test]
    fn single_record_layout() {
        let mut message = NdefMessage::new();
        message.push(TextRecord::new(LANG_EN, b"Ada")).unwrap();
        let mut out = Vec::new();
        message.encode_into(&mut out, PAYLOAD_CAPACITY).unwrap();
        assert_eq!(
            out,
            vec![0xD1, 0x01, 0x06, b'T', 0x02, b'e', b'n', b'A', b'd', b'a']
        );
    }

    #[test]
    fn flags_mark_first_and_last_record() {
        let mut message = NdefMessage::new();
        message.push(TextRecord::new(LANG_EN, b"a")).unwrap();
        message.push(TextRecord::new(LANG_EN, b"b")).unwrap();
        message.push(TextRecord::new(LANG_EN, b"c")).unwrap();
        let mut out = Vec::new();
        message.encode_into(&mut out, PAYLOAD_CAPACITY).unwrap();
        // Each record is 8 bytes: 7 bytes framing plus one text byte.
        assert_eq!(out.len(), 24);
        assert_eq!(out[0], 0x91);
        assert_eq!(out[8], 0x11);
        assert_eq!(out[16], 0x51);
    }

    #[test]
    fn long_record_uses_four_byte_length() {
        let text = vec![b'x'; 300];
        let record = TextRecord::new(LANG_EN, &text);
        assert_eq!(record.encoded_len(), 1 + 1 + 4 + 1 + 303);
        let mut message = NdefMessage::new();
        message.push(record).unwrap();
        let mut out = Vec::new();
        message.encode_into(&mut out, 1024).unwrap();
        assert_eq!(out[0], 0xC1);
        assert_eq!(&out[2..6], &303u32.to_be_bytes());
    }

    #[test]
    fn sixth_record_is_rejected() {
        let mut message = NdefMessage::new();
        for _ in 0..MAX_RECORDS {
            message.push(TextRecord::new(LANG_EN, b"x")).unwrap();
        }
        assert_eq!(
            message.push(TextRecord::new(LANG_EN, b"x")),
            Err(EncodeError::TooManyRecords { max: 5 })
        );
    }

    #[test]
    fn default_record_encodes_in_field_order() {
        let mut encoder = TagEncoder::new();
        let payload = encoder.encode(&FieldStore::new()).unwrap();
        assert_eq!(payload.len(), 79);

        let decoded = decode_text_records(payload.as_bytes()).unwrap();
        let texts: Vec<&str> = decoded.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Name", "Last Name", "email@example.com", "Address", "0000000"]
        );
        assert!(decoded.iter().all(|r| r.lang == "en"));
    }

    #[test]
    fn encode_is_deterministic() {
        let mut store = FieldStore::new();
        store.apply_write(FieldId::Email, 0, b"ada@example.org").unwrap();
        let mut a = TagEncoder::new();
        let mut b = TagEncoder::new();
        let first = a.encode(&store).unwrap().clone();
        assert_eq!(&first, b.encode(&store).unwrap());
        assert_eq!(&first, a.encode(&store).unwrap());
    }

    #[test]
    fn overflow_keeps_previous_payload() {
        let mut store = FieldStore::new();
        let mut encoder = TagEncoder::new();
        let before = encoder.encode(&store).unwrap().clone();

        for id in FieldId::ALL {
            let full = vec![b'z'; id.max_len()];
            store.apply_write(id, 0, &full).unwrap();
        }
        let err = encoder.encode(&store).unwrap_err();
        assert_eq!(
            err,
            EncodeError::PayloadOverflow {
                needed: 180,
                capacity: PAYLOAD_CAPACITY,
            }
        );
        assert_eq!(encoder.payload(), &before);
    }

    #[test]
    fn payload_that_exactly_fills_capacity_is_accepted() {
        // 5 records * 7 bytes framing = 35, leaving 110 bytes of text.
        let mut store = FieldStore::new();
        store.apply_write(FieldId::FirstName, 0, &[b'a'; 20]).unwrap();
        store.apply_write(FieldId::LastName, 0, &[b'b'; 20]).unwrap();
        store.apply_write(FieldId::Email, 0, &[b'c'; 30]).unwrap();
        store.apply_write(FieldId::Address, 0, &[b'd'; 25]).unwrap();
        store.apply_write(FieldId::PhoneNumber, 0, &[b'e'; 15]).unwrap();
        let mut encoder = TagEncoder::new();
        assert_eq!(encoder.encode(&store).unwrap().len(), PAYLOAD_CAPACITY);

        store.apply_write(FieldId::Address, 25, b"d").unwrap();
        assert!(encoder.encode(&store).is_err());
        assert_eq!(encoder.payload().len(), PAYLOAD_CAPACITY);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut encoder = TagEncoder::new();
        let payload = encoder.encode(&FieldStore::new()).unwrap();
        let cut = &payload.as_bytes()[..payload.len() - 3];
        assert!(matches!(
            decode_text_records(cut),
            Err(DecodeError::Truncated(_))
        ));
    }
}
