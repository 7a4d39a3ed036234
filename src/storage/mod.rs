//! DCP Archive Storage Layer
//!
//! The per-period files and the types that flow through them:
//!
//! - **types**: Core data structures (Message, IndexEntry, EntryHandle, TimeRange)
//! - **layout**: The three message-record layouts and their codecs
//! - **record**: RecordStore, the append-only message file
//! - **index_file**: IndexStore, the fixed-width index file
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Message → RecordStore.append → offset → IndexEntry → IndexStore.write_index
//!
//! Read Path:
//!   IndexStore.read_indexes → filter → RecordStore.read_at(offset) → Message
//! ```

pub mod error;
pub mod index_file;
pub mod layout;
pub mod record;
pub mod types;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use index_file::IndexStore;
pub use layout::RecordLayout;
pub use record::RecordStore;
pub use types::{
    flags, ArchivedMessage, DataSourceId, DcpAddress, EntryHandle, IndexEntry, Message,
    MessageClass, TimeRange,
};
