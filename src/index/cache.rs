//! Recent-entry cache for the current period
//!
//! Holds a contiguous run of the newest index entries so real-time
//! searches never touch the index file. When full, the oldest entries are
//! dropped in one bulk trim rather than one at a time.

use crate::storage::types::IndexEntry;
use std::collections::VecDeque;

/// Bounded cache of the most recent index entries of one period
#[derive(Debug)]
pub struct RecentCache {
    /// Entry number of `entries[0]`
    start: u32,
    entries: VecDeque<IndexEntry>,
    capacity: usize,
    trim: usize,
}

impl RecentCache {
    /// Create a cache whose first entry will be `start`
    pub fn new(start: u32, capacity: usize, trim: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            start,
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            trim: trim.clamp(1, capacity),
        }
    }

    /// First cached entry number
    pub fn start(&self) -> u32 {
        self.start
    }

    /// One past the last cached entry number
    pub fn end(&self) -> u32 {
        self.start + self.entries.len() as u32
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the next entry. An entry that does not continue the cached
    /// run restarts the cache at that entry.
    pub fn push(&mut self, entry: IndexEntry) {
        if entry.entry_number != self.end() {
            tracing::debug!(
                "Cache restart at entry {} (expected {})",
                entry.entry_number,
                self.end()
            );
            self.entries.clear();
            self.start = entry.entry_number;
        }
        if self.entries.len() >= self.capacity {
            self.entries.drain(..self.trim);
            self.start += self.trim as u32;
        }
        self.entries.push_back(entry);
    }

    pub fn get(&self, entry_number: u32) -> Option<&IndexEntry> {
        if entry_number < self.start {
            return None;
        }
        self.entries.get((entry_number - self.start) as usize)
    }

    pub fn get_mut(&mut self, entry_number: u32) -> Option<&mut IndexEntry> {
        if entry_number < self.start {
            return None;
        }
        self.entries.get_mut((entry_number - self.start) as usize)
    }

    /// Copy out `[start, end)` if the whole range is cached
    pub fn range(&self, start: u32, end: u32) -> Option<Vec<IndexEntry>> {
        if start < self.start || end > self.end() || start > end {
            return None;
        }
        let from = (start - self.start) as usize;
        let to = (end - self.start) as usize;
        Some(self.entries.range(from..to).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{DcpAddress, Message};

    fn entry(n: u32) -> IndexEntry {
        let msg = Message::new(DcpAddress(n), n as i64, Vec::new()).received_at(n as i64);
        IndexEntry::from_message(&msg, n, 0, None)
    }

    #[test]
    fn test_push_and_get() {
        let mut cache = RecentCache::new(10, 100, 20);
        for n in 10..15 {
            cache.push(entry(n));
        }
        assert_eq!(cache.start(), 10);
        assert_eq!(cache.end(), 15);
        assert_eq!(cache.get(12).unwrap().entry_number, 12);
        assert!(cache.get(9).is_none());
        assert!(cache.get(15).is_none());
    }

    #[test]
    fn test_bulk_trim() {
        let mut cache = RecentCache::new(0, 10, 4);
        for n in 0..10 {
            cache.push(entry(n));
        }
        assert_eq!(cache.len(), 10);

        cache.push(entry(10));
        assert_eq!(cache.start(), 4);
        assert_eq!(cache.len(), 7);
        assert!(cache.get(3).is_none());
        assert_eq!(cache.get(10).unwrap().entry_number, 10);
    }

    #[test]
    fn test_range_requires_full_coverage() {
        let mut cache = RecentCache::new(5, 100, 10);
        for n in 5..10 {
            cache.push(entry(n));
        }
        let got = cache.range(6, 9).unwrap();
        assert_eq!(
            got.iter().map(|e| e.entry_number).collect::<Vec<_>>(),
            vec![6, 7, 8]
        );
        assert!(cache.range(4, 8).is_none());
        assert!(cache.range(8, 11).is_none());
        assert_eq!(cache.range(9, 9).unwrap().len(), 0);
    }

    #[test]
    fn test_gap_restarts_cache() {
        let mut cache = RecentCache::new(0, 100, 10);
        cache.push(entry(0));
        cache.push(entry(5));
        assert_eq!(cache.start(), 5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut cache = RecentCache::new(0, 10, 2);
        cache.push(entry(0));
        cache.get_mut(0).unwrap().flags |= crate::storage::types::flags::DELETED;
        assert!(cache.get(0).unwrap().is_deleted());
    }
}
