//! Minute Index - 1440 per-minute buckets used to prune period scans
//!
//! Each bucket records the first entry number received in that minute and
//! the oldest source time seen there. Buckets are hints: an entry that
//! arrives late for an earlier minute lowers that minute's start but never
//! rewrites the ranges of the minutes around it.
//!
//! # File format
//! ```text
//!   magic        [u8; 4] = "DMIN"
//!   version      u16
//!   period start i64 ms
//!   buckets      1440 x (start entry i32, oldest source time i64)
//!   crc32        u32 over everything above
//! ```

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{MINUTES_PER_DAY, MS_PER_DAY, MS_PER_MINUTE};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

const MINUTE_MAGIC: [u8; 4] = *b"DMIN";
const MINUTE_VERSION: u16 = 1;
const BUCKET_LEN: usize = 12;
const FILE_LEN: usize = 4 + 2 + 8 + MINUTES_PER_DAY * BUCKET_LEN + 4;

/// One minute of the day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteBucket {
    /// First entry number received in this minute, -1 when empty
    pub start_entry: i32,
    /// Oldest source time seen in this minute
    pub oldest_source_time: i64,
}

impl MinuteBucket {
    pub const EMPTY: MinuteBucket = MinuteBucket {
        start_entry: -1,
        oldest_source_time: i64::MAX,
    };

    pub fn is_empty(&self) -> bool {
        self.start_entry < 0
    }
}

/// Per-minute skip index for one period
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteIndex {
    period_start: i64,
    buckets: Vec<MinuteBucket>,
    dirty: bool,
}

impl MinuteIndex {
    /// Create an empty index for the period starting at `period_start`
    pub fn new(period_start: i64) -> Self {
        Self {
            period_start,
            buckets: vec![MinuteBucket::EMPTY; MINUTES_PER_DAY],
            dirty: false,
        }
    }

    pub fn period_start(&self) -> i64 {
        self.period_start
    }

    /// Minute of the period for a receive time, clamped to the day
    pub fn minute_for(&self, recv_time: i64) -> usize {
        let offset = (recv_time - self.period_start).clamp(0, MS_PER_DAY - 1);
        (offset / MS_PER_MINUTE) as usize
    }

    /// Record a newly archived entry
    pub fn update_bucket(&mut self, entry_number: u32, recv_time: i64, source_time: i64) {
        let minute = self.minute_for(recv_time);
        let bucket = &mut self.buckets[minute];
        let entry = entry_number as i32;

        if bucket.is_empty() || entry < bucket.start_entry {
            bucket.start_entry = entry;
            self.dirty = true;
        }
        if source_time < bucket.oldest_source_time {
            bucket.oldest_source_time = source_time;
            self.dirty = true;
        }
    }

    pub fn bucket(&self, minute: usize) -> MinuteBucket {
        self.buckets
            .get(minute)
            .copied()
            .unwrap_or(MinuteBucket::EMPTY)
    }

    /// First non-empty minute at or after `minute`
    pub fn first_non_empty_from(&self, minute: usize) -> Option<usize> {
        (minute..MINUTES_PER_DAY).find(|&m| !self.buckets[m].is_empty())
    }

    /// First non-empty minute at or after `minute` that can hold a source
    /// time earlier than `until`
    pub fn first_candidate_from(&self, minute: usize, until: Option<i64>) -> Option<usize> {
        (minute..MINUTES_PER_DAY).find(|&m| {
            let b = &self.buckets[m];
            !b.is_empty() && until.map_or(true, |u| b.oldest_source_time < u)
        })
    }

    /// Exclusive end entry number of `minute`: the start of the next
    /// non-empty minute, or `num_entries` when there is none
    pub fn minute_end(&self, minute: usize, num_entries: u32) -> u32 {
        self.first_non_empty_from(minute + 1)
            .map(|m| self.buckets[m].start_entry as u32)
            .unwrap_or(num_entries)
    }

    /// Highest entry number recorded as a bucket start
    pub fn highest_start(&self) -> Option<u32> {
        self.buckets
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.start_entry as u32)
            .max()
    }

    pub fn non_empty_count(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the index to `path`
    pub fn save(&mut self, path: &Path) -> StorageResult<()> {
        let mut buf = Vec::with_capacity(FILE_LEN);
        buf.extend_from_slice(&MINUTE_MAGIC);
        buf.extend_from_slice(&MINUTE_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.period_start.to_le_bytes());
        for b in &self.buckets {
            buf.extend_from_slice(&b.start_entry.to_le_bytes());
            buf.extend_from_slice(&b.oldest_source_time.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&buf)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        self.dirty = false;
        Ok(())
    }

    /// Load an index from `path`. Returns `Ok(None)` when the file does
    /// not exist.
    pub fn load(path: &Path) -> StorageResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = Vec::with_capacity(FILE_LEN);
        File::open(path)?.read_to_end(&mut buf)?;

        if buf.len() != FILE_LEN {
            return Err(StorageError::Corruption(format!(
                "minute index {:?} has length {}, expected {}",
                path,
                buf.len(),
                FILE_LEN
            )));
        }
        let body = &buf[..FILE_LEN - 4];
        let stored = u32::from_le_bytes([
            buf[FILE_LEN - 4],
            buf[FILE_LEN - 3],
            buf[FILE_LEN - 2],
            buf[FILE_LEN - 1],
        ]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "minute index {:?} checksum mismatch: stored={}, computed={}",
                path, stored, computed
            )));
        }
        if body[0..4] != MINUTE_MAGIC {
            return Err(StorageError::Corruption(format!(
                "minute index {:?} has bad magic",
                path
            )));
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        if version != MINUTE_VERSION {
            return Err(StorageError::Corruption(format!(
                "minute index {:?} has unsupported version {}",
                path, version
            )));
        }

        let mut start = [0u8; 8];
        start.copy_from_slice(&body[6..14]);
        let period_start = i64::from_le_bytes(start);

        let buckets = body[14..]
            .chunks_exact(BUCKET_LEN)
            .map(|c| {
                let mut oldest = [0u8; 8];
                oldest.copy_from_slice(&c[4..12]);
                MinuteBucket {
                    start_entry: i32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    oldest_source_time: i64::from_le_bytes(oldest),
                }
            })
            .collect();

        Ok(Some(Self {
            period_start,
            buckets,
            dirty: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DAY: i64 = 1_704_412_800_000; // 2024-01-05

    fn at(minute: i64, secs: i64) -> i64 {
        DAY + minute * MS_PER_MINUTE + secs * 1000
    }

    #[test]
    fn test_update_bucket_keeps_lowest() {
        let mut idx = MinuteIndex::new(DAY);
        idx.update_bucket(0, at(0, 10), at(0, 5));
        idx.update_bucket(1, at(0, 20), at(0, 1));
        idx.update_bucket(2, at(0, 30), at(0, 9));

        let b = idx.bucket(0);
        assert_eq!(b.start_entry, 0);
        assert_eq!(b.oldest_source_time, at(0, 1));
        assert!(idx.bucket(1).is_empty());
        assert!(idx.is_dirty());
    }

    #[test]
    fn test_out_of_order_lowers_start() {
        let mut idx = MinuteIndex::new(DAY);
        idx.update_bucket(7, at(3, 0), at(3, 0));
        idx.update_bucket(4, at(3, 30), at(3, 30));
        assert_eq!(idx.bucket(3).start_entry, 4);
    }

    #[test]
    fn test_minute_end_and_candidates() {
        let mut idx = MinuteIndex::new(DAY);
        for (n, minute) in [(0u32, 5i64), (1, 5), (2, 300), (3, 900), (4, 900)] {
            idx.update_bucket(n, at(minute, 1), at(minute, 0));
        }

        assert_eq!(idx.first_non_empty_from(0), Some(5));
        assert_eq!(idx.first_non_empty_from(6), Some(300));
        assert_eq!(idx.minute_end(5, 5), 2);
        assert_eq!(idx.minute_end(300, 5), 3);
        assert_eq!(idx.minute_end(900, 5), 5);
        assert_eq!(idx.highest_start(), Some(3));

        // Minute 900 cannot hold anything older than minute 300's data
        assert_eq!(idx.first_candidate_from(301, Some(at(300, 0) + 1)), None);
        assert_eq!(idx.first_candidate_from(301, None), Some(900));
    }

    #[test]
    fn test_clamps_out_of_day_times() {
        let idx = MinuteIndex::new(DAY);
        assert_eq!(idx.minute_for(DAY - 5000), 0);
        assert_eq!(idx.minute_for(DAY + MS_PER_DAY + 5000), MINUTES_PER_DAY - 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.min");
        let mut idx = MinuteIndex::new(DAY);
        idx.update_bucket(0, at(1, 0), at(0, 59));
        idx.update_bucket(1, at(1439, 0), at(1439, 0));
        idx.save(&path).unwrap();
        assert!(!idx.is_dirty());

        let loaded = MinuteIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded, idx);
        assert_eq!(loaded.period_start(), DAY);

        assert!(MinuteIndex::load(&dir.path().join("missing.min"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.min");
        let mut idx = MinuteIndex::new(DAY);
        idx.update_bucket(0, at(2, 0), at(2, 0));
        idx.save(&path).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[100] ^= 0x55;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(
            MinuteIndex::load(&path),
            Err(StorageError::Corruption(_))
        ));

        std::fs::write(&path, b"short").unwrap();
        assert!(MinuteIndex::load(&path).is_err());
    }
}
