//! Day-period archive
//!
//! One [`PeriodArchive`] per calendar day (UTC), each a message file, an
//! index file and a minute index. The [`ArchiveManager`] owns the set,
//! writes to the current day and searches across all of them.
//!
//! ```text
//! dir/
//!   archv-20240104.{msg,idx,min}   finalized, read-only
//!   archv-20240105.{msg,idx,min}   current
//!   index-hash                     newest message per platform
//! ```

mod maintenance;
mod manager;
mod naming;
mod period;
mod search;

pub use manager::{ArchiveConfig, ArchiveManager, ArchiveStats};
pub use naming::{layout_prefix, parse_msg_file_name, scan_dir, PeriodFiles};
pub use period::PeriodArchive;
pub use search::{SearchCriteria, SearchCursor, SearchStatus, DEFAULT_MAX_BATCH};
