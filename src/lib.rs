//! # DCP Archive
//!
//! Day-period archive for environmental telemetry messages received from
//! Data Collection Platforms (DCPs). Every calendar day is one period: an
//! append-only message file, a fixed-width index and a per-minute index
//! used to prune time-window scans.
//!
//! ## Features
//!
//! - **Concurrent append and search**: ingestion threads append while
//!   retrieval sessions scan with resumable, deadline-bounded cursors
//! - **Three record layouts**: legacy, extended and structured, detected
//!   from the file name
//! - **Outage recovery**: look up messages by transmission sequence number
//! - **Crash tolerance**: minute indexes are reconciled from the index at
//!   startup, corrupt records are skipped by resynchronising
//!
//! ## Modules
//!
//! - [`storage`]: message types, record layouts, message and index files
//! - [`index`]: minute buckets, recent cache, outage and platform maps
//! - [`archive`]: periods, search cursor, the archive manager
//! - [`ingest`]: the interface ingestion adapters see
//! - [`config`]: TOML file plus environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dcp_archive::archive::{ArchiveConfig, ArchiveManager, SearchCriteria, SearchStatus};
//! use dcp_archive::storage::{DataSourceId, DcpAddress, Message};
//! use std::time::{Duration, Instant};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let archive = ArchiveManager::open(ArchiveConfig::new("/var/lib/dcp-archive"))?;
//!
//!     let now = chrono::Utc::now().timestamp_millis();
//!     let msg = Message::new(DcpAddress(0xCE1234A6), now, b"HG 12.3".to_vec()).received_at(now);
//!     archive.archive_msg(msg, DataSourceId(1))?;
//!
//!     let mut cursor = archive.open_search(SearchCriteria::new().since(now - 3_600_000).until(now + 1));
//!     loop {
//!         let deadline = Instant::now() + Duration::from_secs(1);
//!         let (batch, status) = archive.continue_search(&mut cursor, deadline)?;
//!         println!("{} messages", batch.len());
//!         if status == SearchStatus::Done {
//!             break;
//!         }
//!     }
//!
//!     archive.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod index;
pub mod ingest;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    ArchivedMessage, DataSourceId, DcpAddress, EntryHandle, IndexEntry, Message, MessageClass,
    RecordLayout, StorageError, StorageResult, TimeRange,
};

pub use index::{LastMessage, SequenceRange};

pub use archive::{
    ArchiveConfig, ArchiveManager, ArchiveStats, PeriodArchive, SearchCriteria, SearchCursor,
    SearchStatus,
};

pub use ingest::{InputSource, MessageSink, NamedSource};

pub use config::{Config, ConfigError, LoggingConfig};
