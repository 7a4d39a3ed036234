//! Last Message Index - newest archived message per platform
//!
//! Maps each DCP address to the handle of the last message archived for
//! it. New messages link back through this pointer, which is what lets
//! `platform_history` walk a platform's messages newest-first without a
//! scan. Persisted with bincode as the `index-hash` file.

use crate::storage::error::StorageResult;
use crate::storage::types::{flags, DcpAddress, EntryHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// File name of the persisted index inside the archive directory
pub const LAST_MSG_FILE: &str = "index-hash";

/// Pointer to the newest message of one platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub handle: EntryHandle,
    pub source_time: i64,
    pub flags: u32,
}

impl LastMessage {
    pub fn has_sequence(&self) -> bool {
        self.flags & flags::NO_SEQNUM == 0
    }
}

#[derive(Serialize, Deserialize)]
struct LastMessageData {
    version: u32,
    entries: Vec<(DcpAddress, LastMessage)>,
}

/// DCP address → newest archived message
#[derive(Debug)]
pub struct LastMessageIndex {
    map: HashMap<DcpAddress, LastMessage>,
    path: PathBuf,
    dirty: bool,
    /// Never written back to disk
    read_only: bool,
}

impl LastMessageIndex {
    /// Create or load the index stored in `archive_dir`
    pub fn new(archive_dir: &Path) -> StorageResult<Self> {
        let path = archive_dir.join(LAST_MSG_FILE);
        let map = if path.exists() {
            match Self::load_from_file(&path) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("Discarding unreadable {:?}: {}", path, e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            map,
            path,
            dirty: false,
            read_only: false,
        })
    }

    /// Load the index for inspection. In-memory changes are kept but
    /// `persist` and drop leave the file alone.
    pub fn open_read_only(archive_dir: &Path) -> StorageResult<Self> {
        let mut index = Self::new(archive_dir)?;
        index.read_only = true;
        Ok(index)
    }

    fn load_from_file(path: &Path) -> StorageResult<HashMap<DcpAddress, LastMessage>> {
        let reader = BufReader::new(File::open(path)?);
        let data: LastMessageData = bincode::deserialize_from(reader)?;
        Ok(data.entries.into_iter().collect())
    }

    pub fn get(&self, addr: DcpAddress) -> Option<LastMessage> {
        self.map.get(&addr).copied()
    }

    /// Record `last` as the newest message for `addr`, returning the
    /// previous pointer
    pub fn update(&mut self, addr: DcpAddress, last: LastMessage) -> Option<LastMessage> {
        self.dirty = true;
        self.map.insert(addr, last)
    }

    /// Clear `NO_SEQNUM` on the pointer if it still refers to `handle`
    pub fn mark_sequenced(&mut self, addr: DcpAddress, handle: EntryHandle) {
        if let Some(last) = self.map.get_mut(&addr) {
            if last.handle == handle {
                last.flags &= !flags::NO_SEQNUM;
                self.dirty = true;
            }
        }
    }

    /// Drop pointers into periods that no longer exist
    pub fn remove_before(&mut self, period_start: i64) -> usize {
        let before = self.map.len();
        self.map.retain(|_, last| last.handle.period_start >= period_start);
        let removed = before - self.map.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist to disk if modified
    pub fn persist(&mut self) -> StorageResult<()> {
        if !self.dirty || self.read_only {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = LastMessageData {
            version: 1,
            entries: self.map.iter().map(|(k, v)| (*k, *v)).collect(),
        };

        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &data)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for LastMessageIndex {
    fn drop(&mut self) {
        if self.dirty {
            let _ = self.persist();
        }
    }
}
