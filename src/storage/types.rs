//! Core data types for the DCP archive
//!
//! This module defines the fundamental types used throughout the archive:
//! - `Message`: one archived DCP report (metadata + payload)
//! - `IndexEntry`: fixed-size projection of a message used for filtering
//! - `EntryHandle`: stable address of an archived message
//! - `MessageClass`, `DcpAddress`, `DataSourceId`: classification types
//! - `TimeRange` and day/minute arithmetic helpers

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds in one minute
pub const MS_PER_MINUTE: i64 = 60 * 1000;

/// Milliseconds in one day-period
pub const MS_PER_DAY: i64 = 24 * 60 * MS_PER_MINUTE;

/// Minute buckets per day-period
pub const MINUTES_PER_DAY: usize = 24 * 60;

/// Flag bits carried by every message and index entry
pub mod flags {
    /// Record superseded by a better copy (tombstone)
    pub const DELETED: u32 = 0x0000_0001;
    /// No transmission sequence number is known yet
    pub const NO_SEQNUM: u32 = 0x0000_0002;
    /// Ingestion asked to bypass duplicate filtering; never stored
    pub const FORCE_SAVE: u32 = 0x0000_0004;
    /// Carrier start/stop times are present
    pub const HAS_CARRIER: u32 = 0x0000_0008;
    /// Mask for the message class field
    pub const CLASS_MASK: u32 = 0x0000_00F0;
    /// Bit offset of the message class field
    pub const CLASS_SHIFT: u32 = 4;
}

/// Current wall-clock time as unix milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Start (00:00 UTC) of the day containing `ms`
pub fn day_start(ms: i64) -> i64 {
    ms.div_euclid(MS_PER_DAY) * MS_PER_DAY
}

/// Minute-of-day for `ms` relative to `day_start`, if it falls inside that day
pub fn minute_of_day(ms: i64, day_start: i64) -> Option<usize> {
    let offset = ms - day_start;
    if !(0..MS_PER_DAY).contains(&offset) {
        return None;
    }
    Some((offset / MS_PER_MINUTE) as usize)
}

/// Format a unix-millisecond timestamp for log output
pub fn fmt_time(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y/%m/%d-%H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{}ms", ms))
}

/// Platform address of the originating DCP (8 hex digits for GOES)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DcpAddress(pub u32);

impl fmt::Display for DcpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DcpAddress {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s.trim(), 16).map(DcpAddress)
    }
}

/// Identifier of the ingestion source (downlink, receiver, file drop) a
/// message arrived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSourceId(pub i32);

impl DataSourceId {
    /// Source id used when the adapter supplies none
    pub const UNKNOWN: DataSourceId = DataSourceId(-1);
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message class, stored in the `CLASS_MASK` bits of the flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    /// GOES self-timed transmission
    GoesSelfTimed,
    /// GOES random transmission
    GoesRandom,
    /// Iridium short-burst data
    Iridium,
    /// Report collected over a network link
    NetworkDcp,
    /// Anything else
    Other,
}

impl MessageClass {
    /// Get all classes for iteration
    pub fn all() -> &'static [MessageClass] {
        &[
            MessageClass::GoesSelfTimed,
            MessageClass::GoesRandom,
            MessageClass::Iridium,
            MessageClass::NetworkDcp,
            MessageClass::Other,
        ]
    }

    fn code(self) -> u32 {
        match self {
            MessageClass::GoesSelfTimed => 1,
            MessageClass::GoesRandom => 2,
            MessageClass::Iridium => 3,
            MessageClass::NetworkDcp => 4,
            MessageClass::Other => 0,
        }
    }

    /// Decode the class from a flag word
    pub fn from_flags(flags: u32) -> Self {
        match (flags & flags::CLASS_MASK) >> flags::CLASS_SHIFT {
            1 => MessageClass::GoesSelfTimed,
            2 => MessageClass::GoesRandom,
            3 => MessageClass::Iridium,
            4 => MessageClass::NetworkDcp,
            _ => MessageClass::Other,
        }
    }

    /// Replace the class bits in a flag word
    pub fn apply(self, flags: u32) -> u32 {
        (flags & !flags::CLASS_MASK) | (self.code() << flags::CLASS_SHIFT)
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageClass::GoesSelfTimed => write!(f, "goes-st"),
            MessageClass::GoesRandom => write!(f, "goes-rd"),
            MessageClass::Iridium => write!(f, "iridium"),
            MessageClass::NetworkDcp => write!(f, "netdcp"),
            MessageClass::Other => write!(f, "other"),
        }
    }
}

impl FromStr for MessageClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "goes-st" | "st" => Ok(MessageClass::GoesSelfTimed),
            "goes-rd" | "rd" => Ok(MessageClass::GoesRandom),
            "iridium" => Ok(MessageClass::Iridium),
            "netdcp" => Ok(MessageClass::NetworkDcp),
            "other" => Ok(MessageClass::Other),
            other => Err(format!("unknown message class '{}'", other)),
        }
    }
}

/// A single archived DCP message
///
/// The payload is opaque to the archive. Only `flags` and the
/// sequence-number fields may change after the message is archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Flag bits (see [`flags`])
    pub flags: u32,
    /// Originating platform
    pub dcp_address: DcpAddress,
    /// Local receive time, unix ms
    pub local_recv_time: i64,
    /// Source-assigned transmission time, unix ms
    pub source_time: i64,
    /// Transmission sequence number; meaningful only without `NO_SEQNUM`
    pub sequence_num: u32,
    /// Satellite relay (domsat) time, unix ms
    pub relay_time: Option<i64>,
    /// Carrier start time, unix ms
    pub carrier_start: Option<i64>,
    /// Carrier stop time, unix ms
    pub carrier_stop: Option<i64>,
    /// Baud rate, 0 if unknown
    pub baud: u16,
    /// Code assigned by the host's duplicate filter
    pub merge_code: u8,
    /// Ingestion source the message came from
    pub data_source_id: DataSourceId,
    /// Raw report bytes
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message received now, without a sequence number
    pub fn new(dcp_address: DcpAddress, source_time: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            flags: flags::NO_SEQNUM,
            dcp_address,
            local_recv_time: now_millis(),
            source_time,
            sequence_num: 0,
            relay_time: None,
            carrier_start: None,
            carrier_stop: None,
            baud: 0,
            merge_code: 0,
            data_source_id: DataSourceId::UNKNOWN,
            payload: payload.into(),
        }
    }

    /// Builder method: set local receive time
    pub fn received_at(mut self, ms: i64) -> Self {
        self.local_recv_time = ms;
        self
    }

    /// Builder method: set sequence number and relay time
    pub fn sequence(mut self, seq: u32, relay_time: i64) -> Self {
        self.sequence_num = seq;
        self.relay_time = Some(relay_time);
        self.flags &= !flags::NO_SEQNUM;
        self
    }

    /// Builder method: set carrier times
    pub fn carrier(mut self, start: i64, stop: i64) -> Self {
        self.carrier_start = Some(start);
        self.carrier_stop = Some(stop);
        self.flags |= flags::HAS_CARRIER;
        self
    }

    /// Builder method: set baud rate
    pub fn baud(mut self, baud: u16) -> Self {
        self.baud = baud;
        self
    }

    /// Builder method: set message class
    pub fn class(mut self, class: MessageClass) -> Self {
        self.flags = class.apply(self.flags);
        self
    }

    /// Builder method: set data source
    pub fn source(mut self, id: DataSourceId) -> Self {
        self.data_source_id = id;
        self
    }

    /// Message class from the flag bits
    pub fn message_class(&self) -> MessageClass {
        MessageClass::from_flags(self.flags)
    }

    /// Sequence number, if one is known
    pub fn sequence_number(&self) -> Option<u32> {
        if self.flags & flags::NO_SEQNUM == 0 {
            Some(self.sequence_num)
        } else {
            None
        }
    }

    /// Check the tombstone bit
    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }
}

/// Stable address of an archived message: its period and entry number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryHandle {
    /// Day-start (unix ms) of the owning period
    pub period_start: i64,
    /// Position in that period's index
    pub entry_number: u32,
}

impl EntryHandle {
    pub fn new(period_start: i64, entry_number: u32) -> Self {
        Self {
            period_start,
            entry_number,
        }
    }
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", fmt_time(self.period_start), self.entry_number)
    }
}

/// Lightweight projection of a message used to filter without reading
/// the payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    /// Position in the index file
    pub entry_number: u32,
    pub local_recv_time: i64,
    pub source_time: i64,
    pub flags: u32,
    pub sequence_num: u32,
    pub relay_time: Option<i64>,
    pub dcp_address: DcpAddress,
    pub data_source_id: DataSourceId,
    pub merge_code: u8,
    /// Byte offset of the full record, negative when unknown
    pub record_offset: i64,
    /// Previous message from the same platform
    pub prev: Option<EntryHandle>,
}

impl IndexEntry {
    /// Build the index projection of a freshly written message
    pub fn from_message(
        msg: &Message,
        entry_number: u32,
        record_offset: i64,
        prev: Option<EntryHandle>,
    ) -> Self {
        Self {
            entry_number,
            local_recv_time: msg.local_recv_time,
            source_time: msg.source_time,
            flags: msg.flags,
            sequence_num: msg.sequence_num,
            relay_time: msg.relay_time,
            dcp_address: msg.dcp_address,
            data_source_id: msg.data_source_id,
            merge_code: msg.merge_code,
            record_offset,
            prev,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }

    pub fn has_valid_offset(&self) -> bool {
        self.record_offset >= 0
    }

    pub fn message_class(&self) -> MessageClass {
        MessageClass::from_flags(self.flags)
    }

    pub fn sequence_number(&self) -> Option<u32> {
        if self.flags & flags::NO_SEQNUM == 0 {
            Some(self.sequence_num)
        } else {
            None
        }
    }
}

/// A message returned from a search together with its address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedMessage {
    pub handle: EntryHandle,
    pub message: Message,
}

/// Time range (half-open interval: [start, end))
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: i64,
    /// End timestamp (exclusive), in milliseconds
    pub end: i64,
}

impl TimeRange {
    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// The whole day-period starting at `day_start`
    pub fn day_of(day_start: i64) -> Self {
        Self {
            start: day_start,
            end: day_start + MS_PER_DAY,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Expand this range by a duration on both sides
    pub fn expand(&self, millis: i64) -> Self {
        Self {
            start: self.start - millis,
            end: self.end + millis,
        }
    }
}
