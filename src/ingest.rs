//! Ingestion capability interface
//!
//! Adapters (satellite downlinks, network feeds, file drops) implement
//! [`InputSource`] and hand messages to a [`MessageSink`]. They never see
//! the archive itself.

use crate::archive::ArchiveManager;
use crate::storage::{DataSourceId, EntryHandle, Message, StorageResult};

/// Identity of a message source
pub trait InputSource: Send + Sync {
    fn source_id(&self) -> DataSourceId;
    fn name(&self) -> &str;
}

/// Destination for ingested messages
pub trait MessageSink: Send + Sync {
    fn archive_msg(&self, msg: Message, source: &dyn InputSource) -> StorageResult<EntryHandle>;
}

impl MessageSink for ArchiveManager {
    fn archive_msg(&self, msg: Message, source: &dyn InputSource) -> StorageResult<EntryHandle> {
        tracing::trace!("Archiving {} from {}", msg.dcp_address, source.name());
        ArchiveManager::archive_msg(self, msg, source.source_id())
    }
}

/// A source known only by id and name
#[derive(Debug, Clone)]
pub struct NamedSource {
    id: DataSourceId,
    name: String,
}

impl NamedSource {
    pub fn new(id: DataSourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl InputSource for NamedSource {
    fn source_id(&self) -> DataSourceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}
