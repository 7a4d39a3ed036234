//! RecordStore: the append-only message file of one day-period
//!
//! Records are written back to back at end-of-file in the file's
//! [`RecordLayout`]. A record is addressed by the byte offset returned from
//! [`RecordStore::append`]. Records are never moved or shrunk: deletion sets
//! the tombstone bit in place and a late sequence number is patched in
//! place.
//!
//! Reads tolerate drift. If the start pattern is not at the requested
//! offset (a torn write from a crash, or a bad offset) the reader slides
//! forward one byte at a time, within a bounded window, until it finds one.
//! In-place writes never slide; they need a record start exactly at the
//! offset.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::layout::{RecordLayout, FLAGS_OFFSET, START_PATTERN};
use crate::storage::types::{flags, Message};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default distance the reader will slide looking for a start pattern
pub const DEFAULT_RESYNC_WINDOW: usize = 64 * 1024;

/// Append-only message file
pub struct RecordStore {
    path: PathBuf,
    layout: RecordLayout,
    /// Write handle; `None` once the store is read-only
    writer: Mutex<Option<File>>,
    /// Separate read handle so searches do not contend with the writer
    reader: Mutex<BufReader<File>>,
    resync_window: usize,
}

impl RecordStore {
    /// Open a message file, creating it when `writable`
    pub fn open(
        path: impl AsRef<Path>,
        layout: RecordLayout,
        writable: bool,
        resync_window: usize,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = if writable {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Some(
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(false)
                    .open(&path)?,
            )
        } else {
            None
        };

        let reader = BufReader::new(File::open(&path)?);

        Ok(Self {
            path,
            layout,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            resync_window,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Current size of the file in bytes
    pub fn len(&self) -> StorageResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_writable(&self) -> bool {
        self.writer.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Append a message at end-of-file and return its offset
    pub fn append(&self, msg: &Message) -> StorageResult<u64> {
        let bytes = self.layout.encode(msg);

        let mut guard = self.writer.lock()?;
        let file = guard.as_mut().ok_or_else(|| self.read_only())?;

        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        Ok(offset)
    }

    /// Read the record at `offset`
    ///
    /// Returns `Ok(None)` when no start pattern can be found within the
    /// resync window, which is the end-of-data condition for this read.
    pub fn read_at(&self, offset: u64) -> StorageResult<Option<Message>> {
        let mut reader = self.reader.lock()?;

        let start = match self.find_start(&mut reader, offset)? {
            Some(start) => start,
            None => return Ok(None),
        };

        reader.seek(SeekFrom::Start(start))?;
        let mut header = vec![0u8; self.layout.fixed_header_len()];
        reader.read_exact(&mut header)?;
        let msg = self.layout.decode(&header, &mut *reader)?;
        Ok(Some(msg))
    }

    /// Set the tombstone bit of the record at `offset`
    pub fn mark_deleted(&self, offset: u64) -> StorageResult<()> {
        let start = self.locate_exact(offset)?;

        let mut guard = self.writer.lock()?;
        let file = guard.as_mut().ok_or_else(|| self.read_only())?;

        let current = read_u32_at(file, start + FLAGS_OFFSET)?;
        write_at(file, start + FLAGS_OFFSET, &(current | flags::DELETED).to_le_bytes())?;
        Ok(())
    }

    /// Rewrite the sequence number (and relay time, where the layout has
    /// one) of the record at `offset`, clearing `NO_SEQNUM`
    pub fn patch_sequence(
        &self,
        offset: u64,
        sequence_num: u32,
        relay_time: Option<i64>,
    ) -> StorageResult<()> {
        let start = self.locate_exact(offset)?;

        let mut guard = self.writer.lock()?;
        let file = guard.as_mut().ok_or_else(|| self.read_only())?;

        let mut header = vec![0u8; self.layout.fixed_header_len()];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut header)?;
        let mut fields = vec![0u8; self.layout.fields_len(&header)];
        file.read_exact(&mut fields)?;
        let loc = self.layout.sequence_fields(&fields)?;

        write_at(file, start + loc.sequence_at, &sequence_num.to_le_bytes())?;
        if let Some(relay_at) = loc.relay_time_at {
            write_at(file, start + relay_at, &RecordLayout::encode_relay_time(relay_time))?;
        }
        let current = read_u32_at(file, start + FLAGS_OFFSET)?;
        write_at(
            file,
            start + FLAGS_OFFSET,
            &RecordLayout::sequence_flags(current).to_le_bytes(),
        )?;
        Ok(())
    }

    /// Flush written data to disk
    pub fn sync(&self) -> StorageResult<()> {
        let guard = self.writer.lock()?;
        if let Some(file) = guard.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Sync and drop the write handle; later mutations fail
    pub fn make_read_only(&self) -> StorageResult<()> {
        let mut guard = self.writer.lock()?;
        if let Some(file) = guard.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Check that a record starts exactly at `offset`. Writes never slide:
    /// a drifted offset would otherwise modify the neighbouring record.
    fn locate_exact(&self, offset: u64) -> StorageResult<u64> {
        let mut reader = self.reader.lock()?;
        reader.seek(SeekFrom::Start(offset))?;

        let mut found = Vec::with_capacity(START_PATTERN.len());
        reader
            .by_ref()
            .take(START_PATTERN.len() as u64)
            .read_to_end(&mut found)?;

        if found != START_PATTERN {
            return Err(StorageError::Corruption(format!(
                "no record start at offset {} in {:?}",
                offset, self.path
            )));
        }
        Ok(offset)
    }

    /// Slide forward from `offset` looking for the start pattern
    fn find_start(&self, reader: &mut BufReader<File>, offset: u64) -> StorageResult<Option<u64>> {
        reader.seek(SeekFrom::Start(offset))?;

        let want = START_PATTERN.len() + self.resync_window;
        let mut window = Vec::with_capacity(want);
        reader.by_ref().take(want as u64).read_to_end(&mut window)?;

        let found = window
            .windows(START_PATTERN.len())
            .position(|w| w == START_PATTERN);

        match found {
            Some(0) => Ok(Some(offset)),
            Some(skipped) => {
                tracing::warn!(
                    "Resynchronized {:?}: skipped {} bytes after offset {}",
                    self.path,
                    skipped,
                    offset
                );
                Ok(Some(offset + skipped as u64))
            }
            None => {
                if !window.is_empty() {
                    tracing::warn!(
                        "No record start within {} bytes of offset {} in {:?}",
                        window.len(),
                        offset,
                        self.path
                    );
                }
                Ok(None)
            }
        }
    }

    fn read_only(&self) -> StorageError {
        StorageError::PeriodFinalized(format!("{:?}", self.path))
    }
}

fn read_u32_at(file: &mut File, at: u64) -> StorageResult<u32> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(at))?;
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_at(file: &mut File, at: u64, bytes: &[u8]) -> StorageResult<()> {
    file.seek(SeekFrom::Start(at))?;
    file.write_all(bytes)?;
    Ok(())
}
