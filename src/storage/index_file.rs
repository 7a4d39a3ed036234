//! IndexStore: fixed-width index records, one per archived message
//!
//! Entry `n` lives at byte `n * ENTRY_LEN`. The file only grows, except
//! that a trailing partial record (a crash mid-write) is overwritten by the
//! next append.
//!
//! ```text
//!   0   recv time        i64 ms
//!   8   source time      i64 ms
//!   16  relay time       i64 ms  (i64::MIN = none)
//!   24  record offset    i64     (-1 = unknown)
//!   32  prev period      i64 ms  (i64::MIN = no link)
//!   40  flags            u32
//!   44  sequence         u32
//!   48  dcp address      u32
//!   52  data source id   i32
//!   56  prev entry       u32
//!   60  merge code       u8
//!   61  reserved         [u8; 3]
//!   64  crc32 of 0..64   u32
//! ```

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{DataSourceId, DcpAddress, EntryHandle, IndexEntry};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of one index record on disk
pub const ENTRY_LEN: usize = 68;

const CRC_AT: usize = 64;
const NONE_TIME: i64 = i64::MIN;

/// Fixed-width index file for one period
pub struct IndexStore {
    path: PathBuf,
    file: File,
    writable: bool,
}

impl IndexStore {
    /// Open an index file, creating it when `writable`
    pub fn open(path: impl AsRef<Path>, writable: bool) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_file(&path, writable)?;
        Ok(Self {
            path,
            file,
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of complete entries in the file
    pub fn num_entries(&self) -> StorageResult<u32> {
        let len = self.file.metadata()?.len();
        Ok((len / ENTRY_LEN as u64) as u32)
    }

    /// Write `entry` at its entry number, appending or overwriting
    pub fn write_index(&mut self, entry: &IndexEntry) -> StorageResult<()> {
        if !self.writable {
            return Err(StorageError::PeriodFinalized(format!("{:?}", self.path)));
        }
        let bytes = encode_entry(entry);
        self.file
            .seek(SeekFrom::Start(entry.entry_number as u64 * ENTRY_LEN as u64))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Read one entry
    pub fn read_index(&mut self, entry_number: u32) -> StorageResult<IndexEntry> {
        if entry_number >= self.num_entries()? {
            return Err(StorageError::EntryNotFound(format!(
                "entry {} in {:?}",
                entry_number, self.path
            )));
        }
        let mut buf = [0u8; ENTRY_LEN];
        self.file
            .seek(SeekFrom::Start(entry_number as u64 * ENTRY_LEN as u64))?;
        self.file.read_exact(&mut buf)?;
        decode_entry(entry_number, &buf)
    }

    /// Bulk read up to `count` entries starting at `start`
    ///
    /// Entries that fail their checksum are logged and left out, so the
    /// result may be shorter than requested even before end-of-file. Each
    /// returned entry carries its own entry number.
    pub fn read_indexes(&mut self, start: u32, count: usize) -> StorageResult<Vec<IndexEntry>> {
        let available = self.num_entries()?.saturating_sub(start) as usize;
        let count = count.min(available);
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; count * ENTRY_LEN];
        self.file
            .seek(SeekFrom::Start(start as u64 * ENTRY_LEN as u64))?;
        self.file.read_exact(&mut buf)?;

        let mut entries = Vec::with_capacity(count);
        for (i, chunk) in buf.chunks_exact(ENTRY_LEN).enumerate() {
            let entry_number = start + i as u32;
            match decode_entry(entry_number, chunk) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable index entry {} in {:?}: {}",
                        entry_number,
                        self.path,
                        e
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Flush and reopen read-only
    pub fn make_read_only(&mut self) -> StorageResult<()> {
        if self.writable {
            self.file.sync_all()?;
            self.file = open_file(&self.path, false)?;
            self.writable = false;
        }
        Ok(())
    }

    pub fn sync(&self) -> StorageResult<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn open_file(path: &Path, writable: bool) -> StorageResult<File> {
    if writable {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    } else {
        Ok(File::open(path)?)
    }
}

fn encode_entry(entry: &IndexEntry) -> [u8; ENTRY_LEN] {
    let mut buf = [0u8; ENTRY_LEN];
    let (prev_period, prev_entry) = match entry.prev {
        Some(h) => (h.period_start, h.entry_number),
        None => (NONE_TIME, 0),
    };

    buf[0..8].copy_from_slice(&entry.local_recv_time.to_le_bytes());
    buf[8..16].copy_from_slice(&entry.source_time.to_le_bytes());
    buf[16..24].copy_from_slice(&entry.relay_time.unwrap_or(NONE_TIME).to_le_bytes());
    buf[24..32].copy_from_slice(&entry.record_offset.to_le_bytes());
    buf[32..40].copy_from_slice(&prev_period.to_le_bytes());
    buf[40..44].copy_from_slice(&entry.flags.to_le_bytes());
    buf[44..48].copy_from_slice(&entry.sequence_num.to_le_bytes());
    buf[48..52].copy_from_slice(&entry.dcp_address.0.to_le_bytes());
    buf[52..56].copy_from_slice(&entry.data_source_id.0.to_le_bytes());
    buf[56..60].copy_from_slice(&prev_entry.to_le_bytes());
    buf[60] = entry.merge_code;

    let crc = crc32fast::hash(&buf[0..CRC_AT]);
    buf[CRC_AT..ENTRY_LEN].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_entry(entry_number: u32, buf: &[u8]) -> StorageResult<IndexEntry> {
    let stored = u32::from_le_bytes([buf[64], buf[65], buf[66], buf[67]]);
    let computed = crc32fast::hash(&buf[0..CRC_AT]);
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "index checksum mismatch: stored={}, computed={}",
            stored, computed
        )));
    }

    let i64_at = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[at..at + 8]);
        i64::from_le_bytes(b)
    };
    let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

    let relay = i64_at(16);
    let prev_period = i64_at(32);

    Ok(IndexEntry {
        entry_number,
        local_recv_time: i64_at(0),
        source_time: i64_at(8),
        flags: u32_at(40),
        sequence_num: u32_at(44),
        relay_time: (relay != NONE_TIME).then_some(relay),
        dcp_address: DcpAddress(u32_at(48)),
        data_source_id: DataSourceId(u32_at(52) as i32),
        merge_code: buf[60],
        record_offset: i64_at(24),
        prev: (prev_period != NONE_TIME).then(|| EntryHandle::new(prev_period, u32_at(56))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{flags, Message};
    use tempfile::tempdir;

    fn entry(n: u32) -> IndexEntry {
        let msg = Message::new(DcpAddress(0xABCD_0000 + n), 10_000 + n as i64, b"x".to_vec())
            .received_at(20_000 + n as i64);
        let prev = (n > 0).then(|| EntryHandle::new(86_400_000, n - 1));
        IndexEntry::from_message(&msg, n, n as i64 * 100, prev)
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let mut store = IndexStore::open(dir.path().join("p.idx"), true).unwrap();
        for n in 0..10 {
            store.write_index(&entry(n)).unwrap();
        }

        assert_eq!(store.num_entries().unwrap(), 10);
        assert_eq!(store.read_index(3).unwrap(), entry(3));
        assert_eq!(store.read_index(0).unwrap().prev, None);

        let batch = store.read_indexes(4, 100).unwrap();
        assert_eq!(batch.len(), 6);
        assert_eq!(batch[0], entry(4));
        assert_eq!(batch[5].entry_number, 9);

        assert!(store.read_indexes(10, 5).unwrap().is_empty());
        assert!(matches!(
            store.read_index(10),
            Err(StorageError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_overwrite_in_place() {
        let dir = tempdir().unwrap();
        let mut store = IndexStore::open(dir.path().join("p.idx"), true).unwrap();
        for n in 0..3 {
            store.write_index(&entry(n)).unwrap();
        }

        let mut e = store.read_index(1).unwrap();
        e.flags |= flags::DELETED;
        store.write_index(&e).unwrap();

        assert_eq!(store.num_entries().unwrap(), 3);
        assert!(store.read_index(1).unwrap().is_deleted());
        assert!(!store.read_index(2).unwrap().is_deleted());
    }

    #[test]
    fn test_corrupt_entry_skipped_in_bulk_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.idx");
        let mut store = IndexStore::open(&path, true).unwrap();
        for n in 0..5 {
            store.write_index(&entry(n)).unwrap();
        }

        // Flip a byte inside entry 2
        let mut raw = std::fs::read(&path).unwrap();
        raw[2 * ENTRY_LEN + 10] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut store = IndexStore::open(&path, false).unwrap();
        let numbers: Vec<u32> = store
            .read_indexes(0, 5)
            .unwrap()
            .iter()
            .map(|e| e.entry_number)
            .collect();
        assert_eq!(numbers, vec![0, 1, 3, 4]);
        assert!(matches!(store.read_index(2), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_trailing_partial_record_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.idx");
        {
            let mut store = IndexStore::open(&path, true).unwrap();
            store.write_index(&entry(0)).unwrap();
            store.write_index(&entry(1)).unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[7u8; 20]);
        std::fs::write(&path, &raw).unwrap();

        let mut store = IndexStore::open(&path, true).unwrap();
        assert_eq!(store.num_entries().unwrap(), 2);

        store.write_index(&entry(2)).unwrap();
        assert_eq!(store.num_entries().unwrap(), 3);
        assert_eq!(store.read_index(2).unwrap(), entry(2));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let mut store = IndexStore::open(dir.path().join("p.idx"), true).unwrap();
        store.write_index(&entry(0)).unwrap();
        store.make_read_only().unwrap();

        assert!(matches!(
            store.write_index(&entry(1)),
            Err(StorageError::PeriodFinalized(_))
        ));
        assert_eq!(store.read_index(0).unwrap(), entry(0));
    }
}
