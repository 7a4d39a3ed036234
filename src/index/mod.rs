//! DCP Archive Index Structures
//!
//! In-memory (checkpointed) structures that sit beside the period files:
//!
//! - **MinuteIndex**: 1440 per-minute buckets used to prune period scans
//! - **RecentCache**: newest index entries of the current period
//! - **OutageSequenceIndex**: sequence-number chains for outage recovery
//! - **LastMessageIndex**: newest message per platform, for back-links
//!
//! # Architecture
//!
//! ```text
//! Search: "everything received since 10:42, source time before 11:00"
//!        ↓
//! MinuteIndex: skip empty minutes and minutes whose oldest data is too new
//!        ↓
//! RecentCache / IndexStore: bulk-read entries up to the end of the minute
//!        ↓
//! Read only surviving records → Fast!
//! ```

mod cache;
mod last_msg;
mod minute;
mod outage;

pub use cache::RecentCache;
pub use last_msg::{LastMessage, LastMessageIndex, LAST_MSG_FILE};
pub use minute::{MinuteBucket, MinuteIndex};
pub use outage::{
    DailySequenceMap, OutageEntry, OutageSequenceIndex, SequenceRange, DEFAULT_PADDING_MS,
};
