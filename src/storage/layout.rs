//! On-disk record layouts for the message file
//!
//! Three layouts exist. The layout of a file is fixed when it is created and
//! is recorded in the file name prefix (see `archive::naming`), so a reader
//! never has to guess. All integers are little-endian. Every layout starts
//! with the same 8 bytes, which is what makes tombstoning layout-independent:
//!
//! ```text
//! Common prefix:
//!   0   start pattern   [u8; 4] = "DCPM"
//!   4   flags           u32
//!
//! Legacy ("arc-"):
//!   8   recv time       i64 ms
//!   16  source time     i64 ms
//!   24  sequence        u32
//!   28  dcp address     u32
//!   32  payload len     u32
//!   36  payload
//!
//! Extended ("arch-"):
//!   8   recv time       i64 ms
//!   16  source time     i64 ms
//!   24  sequence        u32
//!   28  relay time      i64 ms  (i64::MIN = none)
//!   36  carrier start   i64 ms  (i64::MIN = none)
//!   44  carrier stop    i64 ms  (i64::MIN = none)
//!   52  baud            u16
//!   54  merge code      u8
//!   55  reserved        u8
//!   56  data source id  i32
//!   60  dcp address     u32
//!   64  payload len     u32
//!   68  payload
//!
//! Structured ("archv-"):
//!   8   version         u8 = 1
//!   9   field count     u8
//!   10  fields len      u16
//!   12  fields          repeated [tag u8][len u8][value]
//!   ..  payload len     u32
//!   ..  payload
//!   ..  payload crc32   u32
//! ```
//!
//! The structured layout always writes the sequence and relay-time fields,
//! even when unknown, so they can be patched in place later. Unknown tags
//! are skipped when decoding.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{flags, DataSourceId, DcpAddress, Message};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

/// Marker written at the start of every record
pub const START_PATTERN: [u8; 4] = *b"DCPM";

/// Offset of the flag word within any record
pub const FLAGS_OFFSET: u64 = 4;

/// Largest payload accepted when decoding
pub const MAX_PAYLOAD_LEN: usize = 1_000_000;

const NONE_TIME: i64 = i64::MIN;

const LEGACY_HEADER_LEN: usize = 36;
const EXTENDED_HEADER_LEN: usize = 68;
const STRUCTURED_FIXED_LEN: usize = 12;
const STRUCTURED_VERSION: u8 = 1;

const TAG_RECV_TIME: u8 = 1;
const TAG_SOURCE_TIME: u8 = 2;
const TAG_SEQUENCE: u8 = 3;
const TAG_RELAY_TIME: u8 = 4;
const TAG_CARRIER_START: u8 = 5;
const TAG_CARRIER_STOP: u8 = 6;
const TAG_BAUD: u8 = 7;
const TAG_MERGE_CODE: u8 = 8;
const TAG_SOURCE_ID: u8 = 9;
const TAG_DCP_ADDRESS: u8 = 10;

/// Message-file record layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordLayout {
    /// Minimal fixed layout
    Legacy,
    /// Fixed layout with carrier, baud, relay, merge and source fields
    Extended,
    /// Tag-delimited, self-describing layout
    Structured,
}

impl Default for RecordLayout {
    fn default() -> Self {
        RecordLayout::Structured
    }
}

impl fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordLayout::Legacy => write!(f, "legacy"),
            RecordLayout::Extended => write!(f, "extended"),
            RecordLayout::Structured => write!(f, "structured"),
        }
    }
}

/// Where the patchable sequence fields live, relative to the record start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceFields {
    pub sequence_at: u64,
    pub relay_time_at: Option<u64>,
}

impl RecordLayout {
    /// Bytes that must be read (after the start pattern is confirmed) to
    /// learn where the patchable fields are
    pub fn fixed_header_len(&self) -> usize {
        match self {
            RecordLayout::Legacy => LEGACY_HEADER_LEN,
            RecordLayout::Extended => EXTENDED_HEADER_LEN,
            RecordLayout::Structured => STRUCTURED_FIXED_LEN,
        }
    }

    /// Serialize a message into one complete record
    pub fn encode(&self, msg: &Message) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EXTENDED_HEADER_LEN + msg.payload.len() + 8);
        buf.extend_from_slice(&START_PATTERN);
        buf.extend_from_slice(&msg.flags.to_le_bytes());

        match self {
            RecordLayout::Legacy => {
                buf.extend_from_slice(&msg.local_recv_time.to_le_bytes());
                buf.extend_from_slice(&msg.source_time.to_le_bytes());
                buf.extend_from_slice(&msg.sequence_num.to_le_bytes());
                buf.extend_from_slice(&msg.dcp_address.0.to_le_bytes());
                buf.extend_from_slice(&(msg.payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&msg.payload);
            }
            RecordLayout::Extended => {
                buf.extend_from_slice(&msg.local_recv_time.to_le_bytes());
                buf.extend_from_slice(&msg.source_time.to_le_bytes());
                buf.extend_from_slice(&msg.sequence_num.to_le_bytes());
                buf.extend_from_slice(&msg.relay_time.unwrap_or(NONE_TIME).to_le_bytes());
                buf.extend_from_slice(&msg.carrier_start.unwrap_or(NONE_TIME).to_le_bytes());
                buf.extend_from_slice(&msg.carrier_stop.unwrap_or(NONE_TIME).to_le_bytes());
                buf.extend_from_slice(&msg.baud.to_le_bytes());
                buf.push(msg.merge_code);
                buf.push(0);
                buf.extend_from_slice(&msg.data_source_id.0.to_le_bytes());
                buf.extend_from_slice(&msg.dcp_address.0.to_le_bytes());
                buf.extend_from_slice(&(msg.payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&msg.payload);
            }
            RecordLayout::Structured => {
                let mut fields = Vec::with_capacity(96);
                let mut count = 0u8;
                let mut put = |tag: u8, value: &[u8]| {
                    fields.push(tag);
                    fields.push(value.len() as u8);
                    fields.extend_from_slice(value);
                    count += 1;
                };
                put(TAG_RECV_TIME, &msg.local_recv_time.to_le_bytes());
                put(TAG_SOURCE_TIME, &msg.source_time.to_le_bytes());
                put(TAG_SEQUENCE, &msg.sequence_num.to_le_bytes());
                put(TAG_RELAY_TIME, &msg.relay_time.unwrap_or(NONE_TIME).to_le_bytes());
                if let Some(start) = msg.carrier_start {
                    put(TAG_CARRIER_START, &start.to_le_bytes());
                }
                if let Some(stop) = msg.carrier_stop {
                    put(TAG_CARRIER_STOP, &stop.to_le_bytes());
                }
                put(TAG_BAUD, &msg.baud.to_le_bytes());
                put(TAG_MERGE_CODE, &[msg.merge_code]);
                put(TAG_SOURCE_ID, &msg.data_source_id.0.to_le_bytes());
                put(TAG_DCP_ADDRESS, &msg.dcp_address.0.to_le_bytes());

                buf.push(STRUCTURED_VERSION);
                buf.push(count);
                buf.extend_from_slice(&(fields.len() as u16).to_le_bytes());
                buf.extend_from_slice(&fields);
                buf.extend_from_slice(&(msg.payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&msg.payload);
                buf.extend_from_slice(&crc32fast::hash(&msg.payload).to_le_bytes());
            }
        }

        buf
    }

    /// Decode one record. `header` holds the first `fixed_header_len()`
    /// bytes of the record (start pattern included); the rest is pulled
    /// from `reader`.
    pub fn decode<R: Read>(&self, header: &[u8], reader: &mut R) -> StorageResult<Message> {
        if header.len() < self.fixed_header_len() {
            return Err(StorageError::Corruption(format!(
                "{} record header truncated: {} bytes",
                self,
                header.len()
            )));
        }
        let flags = le_u32(header, 4);

        match self {
            RecordLayout::Legacy => {
                let payload_len = le_u32(header, 32) as usize;
                let payload = read_payload(reader, payload_len)?;
                Ok(Message {
                    flags,
                    dcp_address: DcpAddress(le_u32(header, 28)),
                    local_recv_time: le_i64(header, 8),
                    source_time: le_i64(header, 16),
                    sequence_num: le_u32(header, 24),
                    relay_time: None,
                    carrier_start: None,
                    carrier_stop: None,
                    baud: 0,
                    merge_code: 0,
                    data_source_id: DataSourceId::UNKNOWN,
                    payload,
                })
            }
            RecordLayout::Extended => {
                let payload_len = le_u32(header, 64) as usize;
                let payload = read_payload(reader, payload_len)?;
                Ok(Message {
                    flags,
                    dcp_address: DcpAddress(le_u32(header, 60)),
                    local_recv_time: le_i64(header, 8),
                    source_time: le_i64(header, 16),
                    sequence_num: le_u32(header, 24),
                    relay_time: opt_time(le_i64(header, 28)),
                    carrier_start: opt_time(le_i64(header, 36)),
                    carrier_stop: opt_time(le_i64(header, 44)),
                    baud: u16::from_le_bytes([header[52], header[53]]),
                    merge_code: header[54],
                    data_source_id: DataSourceId(le_i32(header, 56)),
                    payload,
                })
            }
            RecordLayout::Structured => {
                if header[8] != STRUCTURED_VERSION {
                    return Err(StorageError::InvalidLayout(format!(
                        "unsupported structured record version {}",
                        header[8]
                    )));
                }
                let fields_len = u16::from_le_bytes([header[10], header[11]]) as usize;
                let mut fields = vec![0u8; fields_len];
                reader.read_exact(&mut fields)?;

                let mut msg = Message {
                    flags,
                    dcp_address: DcpAddress(0),
                    local_recv_time: 0,
                    source_time: 0,
                    sequence_num: 0,
                    relay_time: None,
                    carrier_start: None,
                    carrier_stop: None,
                    baud: 0,
                    merge_code: 0,
                    data_source_id: DataSourceId::UNKNOWN,
                    payload: Vec::new(),
                };
                for (tag, _, value) in FieldIter::new(&fields) {
                    match (tag, value.len()) {
                        (TAG_RECV_TIME, 8) => msg.local_recv_time = le_i64(value, 0),
                        (TAG_SOURCE_TIME, 8) => msg.source_time = le_i64(value, 0),
                        (TAG_SEQUENCE, 4) => msg.sequence_num = le_u32(value, 0),
                        (TAG_RELAY_TIME, 8) => msg.relay_time = opt_time(le_i64(value, 0)),
                        (TAG_CARRIER_START, 8) => msg.carrier_start = opt_time(le_i64(value, 0)),
                        (TAG_CARRIER_STOP, 8) => msg.carrier_stop = opt_time(le_i64(value, 0)),
                        (TAG_BAUD, 2) => msg.baud = u16::from_le_bytes([value[0], value[1]]),
                        (TAG_MERGE_CODE, 1) => msg.merge_code = value[0],
                        (TAG_SOURCE_ID, 4) => msg.data_source_id = DataSourceId(le_i32(value, 0)),
                        (TAG_DCP_ADDRESS, 4) => msg.dcp_address = DcpAddress(le_u32(value, 0)),
                        (tag, len) => {
                            tracing::trace!("Skipping structured field tag={} len={}", tag, len);
                        }
                    }
                }

                let mut len_buf = [0u8; 4];
                reader.read_exact(&mut len_buf)?;
                msg.payload = read_payload(reader, u32::from_le_bytes(len_buf) as usize)?;

                let mut crc_buf = [0u8; 4];
                reader.read_exact(&mut crc_buf)?;
                let stored = u32::from_le_bytes(crc_buf);
                let computed = crc32fast::hash(&msg.payload);
                if stored != computed {
                    return Err(StorageError::Corruption(format!(
                        "payload CRC mismatch: stored={}, computed={}",
                        stored, computed
                    )));
                }
                Ok(msg)
            }
        }
    }

    /// Locate the sequence fields of a record. For the structured layout
    /// `fields` must hold the tag area that follows the fixed header; the
    /// fixed layouts ignore it.
    pub fn sequence_fields(&self, fields: &[u8]) -> StorageResult<SequenceFields> {
        match self {
            RecordLayout::Legacy => Ok(SequenceFields {
                sequence_at: 24,
                relay_time_at: None,
            }),
            RecordLayout::Extended => Ok(SequenceFields {
                sequence_at: 24,
                relay_time_at: Some(28),
            }),
            RecordLayout::Structured => {
                let mut sequence_at = None;
                let mut relay_time_at = None;
                for (tag, pos, value) in FieldIter::new(fields) {
                    let at = (STRUCTURED_FIXED_LEN + pos) as u64;
                    match (tag, value.len()) {
                        (TAG_SEQUENCE, 4) => sequence_at = Some(at),
                        (TAG_RELAY_TIME, 8) => relay_time_at = Some(at),
                        _ => {}
                    }
                }
                let sequence_at = sequence_at.ok_or_else(|| {
                    StorageError::InvalidLayout("structured record has no sequence field".into())
                })?;
                Ok(SequenceFields {
                    sequence_at,
                    relay_time_at,
                })
            }
        }
    }

    /// Length of the structured tag area, from the fixed header
    pub fn fields_len(&self, header: &[u8]) -> usize {
        match self {
            RecordLayout::Structured if header.len() >= STRUCTURED_FIXED_LEN => {
                u16::from_le_bytes([header[10], header[11]]) as usize
            }
            _ => 0,
        }
    }

    /// Encode a relay time for an in-place patch
    pub fn encode_relay_time(relay_time: Option<i64>) -> [u8; 8] {
        relay_time.unwrap_or(NONE_TIME).to_le_bytes()
    }

    /// Set or clear the flag bits that accompany a sequence patch
    pub fn sequence_flags(current: u32) -> u32 {
        current & !flags::NO_SEQNUM
    }
}

/// Iterates `(tag, value position, value)` over a structured tag area,
/// stopping at the first truncated field
struct FieldIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldIter<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = (u8, usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 2 > self.buf.len() {
            return None;
        }
        let tag = self.buf[self.pos];
        let len = self.buf[self.pos + 1] as usize;
        let start = self.pos + 2;
        if start + len > self.buf.len() {
            return None;
        }
        self.pos = start + len;
        Some((tag, start, &self.buf[start..start + len]))
    }
}

fn read_payload<R: Read>(reader: &mut R, len: usize) -> StorageResult<Vec<u8>> {
    if len > MAX_PAYLOAD_LEN {
        return Err(StorageError::Corruption(format!(
            "payload length too large: {}",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn opt_time(value: i64) -> Option<i64> {
    if value == NONE_TIME {
        None
    } else {
        Some(value)
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(bytes)
}
