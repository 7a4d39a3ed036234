//! PeriodArchive: one calendar day of messages
//!
//! Combines a RecordStore, an IndexStore and a MinuteIndex for a single
//! day. A period is either current (writable) or finalized (read-only);
//! the only transition is `finish()`.
//!
//! All mutation goes through one per-period lock. Searches take the same
//! lock only to resolve their position and bulk-read index entries; record
//! bodies are read after the lock is released.

use crate::archive::naming::PeriodFiles;
use crate::archive::search::{SearchCursor, SearchStatus};
use crate::archive::ArchiveConfig;
use crate::index::{MinuteIndex, RecentCache};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::index_file::IndexStore;
use crate::storage::record::RecordStore;
use crate::storage::types::{
    flags, fmt_time, now_millis, ArchivedMessage, EntryHandle, IndexEntry, Message,
    MINUTES_PER_DAY, MS_PER_DAY,
};
use std::sync::Mutex;
use std::time::Instant;

struct PeriodState {
    index: IndexStore,
    minutes: MinuteIndex,
    cache: Option<RecentCache>,
    num_entries: u32,
    current: bool,
}

/// One day of archived messages
pub struct PeriodArchive {
    start: i64,
    files: PeriodFiles,
    records: RecordStore,
    state: Mutex<PeriodState>,
    config: ArchiveConfig,
}

impl PeriodArchive {
    /// Create (or reopen) the current period for the day starting at
    /// `start`, using the configured layout
    pub fn create(start: i64, config: &ArchiveConfig) -> StorageResult<Self> {
        let files = PeriodFiles::new(&config.dir, config.layout, start);
        Self::open(files, true, config)
    }

    /// Open a period's files. Finalized periods are opened read-only.
    pub fn open(files: PeriodFiles, current: bool, config: &ArchiveConfig) -> StorageResult<Self> {
        let start = files.period_start;
        tracing::info!(
            "Opening period {} ({}, current={})",
            files.name(),
            files.layout,
            current
        );

        let index = IndexStore::open(files.idx_path(), current)?;
        let records = RecordStore::open(
            files.msg_path(),
            files.layout,
            current,
            config.resync_window,
        )?;
        let num_entries = index.num_entries()?;

        let minutes = match MinuteIndex::load(&files.min_path()) {
            Ok(Some(m)) if m.period_start() == start => m,
            Ok(Some(_)) => {
                tracing::warn!("Minute index for {} belongs to another day, rebuilding", files.name());
                MinuteIndex::new(start)
            }
            Ok(None) => MinuteIndex::new(start),
            Err(e) => {
                tracing::warn!("Cannot load minute index for {}: {}, rebuilding", files.name(), e);
                MinuteIndex::new(start)
            }
        };

        let cache = current.then(|| {
            RecentCache::new(num_entries, config.cache_capacity, config.cache_trim)
        });

        let period = Self {
            start,
            files,
            records,
            state: Mutex::new(PeriodState {
                index,
                minutes,
                cache,
                num_entries,
                current,
            }),
            config: config.clone(),
        };
        period.reconcile_minutes()?;
        Ok(period)
    }

    /// Replay index entries the minute index has not seen yet. Only the
    /// current period writes the result back.
    fn reconcile_minutes(&self) -> StorageResult<()> {
        let mut state = self.state.lock()?;
        let total = state.num_entries;
        let mut next = state.minutes.highest_start().unwrap_or(0);
        let from = next;

        while next < total {
            let batch = state.index.read_indexes(next, self.config.index_batch)?;
            for e in &batch {
                state
                    .minutes
                    .update_bucket(e.entry_number, e.local_recv_time, e.source_time);
            }
            next = next.saturating_add(self.config.index_batch as u32);
        }

        if state.minutes.is_dirty() {
            tracing::info!(
                "Reconciled minute index of {} from entry {} to {}",
                self.files.name(),
                from,
                total
            );
            // Finalized periods keep the rebuilt index in memory only
            if state.current {
                if let Err(e) = state.minutes.save(&self.files.min_path()) {
                    tracing::warn!("Cannot save minute index for {}: {}", self.files.name(), e);
                }
            }
        }
        Ok(())
    }

    /// Day-start of this period
    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.start + MS_PER_DAY
    }

    pub fn files(&self) -> &PeriodFiles {
        &self.files
    }

    pub fn name(&self) -> String {
        self.files.name()
    }

    pub fn is_current(&self) -> StorageResult<bool> {
        Ok(self.state.lock()?.current)
    }

    pub fn num_entries(&self) -> StorageResult<u32> {
        Ok(self.state.lock()?.num_entries)
    }

    /// Oldest source time recorded in any minute
    pub fn oldest_source_time(&self) -> StorageResult<Option<i64>> {
        let state = self.state.lock()?;
        Ok((0..MINUTES_PER_DAY)
            .map(|m| state.minutes.bucket(m))
            .filter(|b| !b.is_empty())
            .map(|b| b.oldest_source_time)
            .min())
    }

    /// Snapshot of the in-memory minute index
    pub fn minute_index(&self) -> StorageResult<MinuteIndex> {
        Ok(self.state.lock()?.minutes.clone())
    }

    /// Append a message and return its entry number
    ///
    /// `prev` links to the previous message from the same platform. A
    /// failed record or index write is logged and the entry number is
    /// still consumed, so numbering stays dense.
    pub fn archive_msg(&self, msg: &Message, prev: Option<EntryHandle>) -> StorageResult<u32> {
        let mut state = self.state.lock()?;
        if !state.current {
            return Err(StorageError::PeriodFinalized(self.name()));
        }

        let mut msg = msg.clone();
        msg.flags &= !flags::FORCE_SAVE;

        let entry_number = state.num_entries;
        let offset = match self.records.append(&msg) {
            Ok(offset) => offset as i64,
            Err(e) => {
                tracing::warn!(
                    "{}: cannot write record for entry {}: {}",
                    self.name(),
                    entry_number,
                    e
                );
                -1
            }
        };

        let entry = IndexEntry::from_message(&msg, entry_number, offset, prev);
        if let Err(e) = state.index.write_index(&entry) {
            tracing::warn!(
                "{}: cannot save index entry {}, index file will be corrupt: {}",
                self.name(),
                entry_number,
                e
            );
        }
        state.num_entries += 1;
        state
            .minutes
            .update_bucket(entry_number, msg.local_recv_time, msg.source_time);
        if let Some(cache) = state.cache.as_mut() {
            cache.push(entry);
        }

        Ok(entry_number)
    }

    fn entry_locked(&self, state: &mut PeriodState, entry_number: u32) -> StorageResult<IndexEntry> {
        if entry_number >= state.num_entries {
            return Err(StorageError::EntryNotFound(format!(
                "{} entry {}",
                self.name(),
                entry_number
            )));
        }
        if let Some(e) = state.cache.as_ref().and_then(|c| c.get(entry_number)) {
            return Ok(e.clone());
        }
        state.index.read_index(entry_number)
    }

    /// Write a modified entry to the cache and the index file
    fn store_entry_locked(&self, state: &mut PeriodState, entry: &IndexEntry) -> StorageResult<()> {
        if let Some(cached) = state.cache.as_mut().and_then(|c| c.get_mut(entry.entry_number)) {
            *cached = entry.clone();
        }
        state.index.write_index(entry).map_err(|e| {
            tracing::warn!(
                "{}: cannot rewrite index entry {}: {}",
                self.name(),
                entry.entry_number,
                e
            );
            e
        })
    }

    /// Tombstone an entry in the cache, the index file and the record
    pub fn delete_entry(&self, entry_number: u32) -> StorageResult<()> {
        let mut state = self.state.lock()?;
        if !state.current {
            return Err(StorageError::PeriodFinalized(self.name()));
        }

        let mut entry = self.entry_locked(&mut state, entry_number)?;
        entry.flags |= flags::DELETED;
        let index_result = self.store_entry_locked(&mut state, &entry);

        if entry.has_valid_offset() {
            if let Err(e) = self.records.mark_deleted(entry.record_offset as u64) {
                tracing::warn!(
                    "{}: cannot mark record deleted at offset {}: {}",
                    self.name(),
                    entry.record_offset,
                    e
                );
                return Err(e);
            }
        }
        index_result
    }

    /// Attach a late sequence number to an entry, returning the updated
    /// index entry
    pub fn patch_sequence(
        &self,
        entry_number: u32,
        sequence_num: u32,
        relay_time: Option<i64>,
    ) -> StorageResult<IndexEntry> {
        let mut state = self.state.lock()?;
        if !state.current {
            return Err(StorageError::PeriodFinalized(self.name()));
        }

        let mut entry = self.entry_locked(&mut state, entry_number)?;
        entry.flags &= !flags::NO_SEQNUM;
        entry.sequence_num = sequence_num;
        entry.relay_time = relay_time;
        let index_result = self.store_entry_locked(&mut state, &entry);

        if entry.has_valid_offset() {
            if let Err(e) =
                self.records
                    .patch_sequence(entry.record_offset as u64, sequence_num, relay_time)
            {
                tracing::warn!(
                    "{}: cannot patch sequence of record at offset {}: {}",
                    self.name(),
                    entry.record_offset,
                    e
                );
                return Err(e);
            }
        }
        index_result.map(|_| entry)
    }

    /// Finalize: save the minute index and reopen the files read-only
    pub fn finish(&self) -> StorageResult<()> {
        let mut state = self.state.lock()?;
        if !state.current {
            return Ok(());
        }
        tracing::info!("Period {} is finished, reopening read-only", self.name());

        if let Err(e) = state.minutes.save(&self.files.min_path()) {
            tracing::warn!("Cannot save minute index for {}: {}", self.name(), e);
        }
        state.index.make_read_only()?;
        self.records.make_read_only()?;
        state.current = false;
        Ok(())
    }

    /// Periodic maintenance: save the minute index of the current period
    /// and drop the cache of a finalized one once it is well past its end
    pub fn checkpoint(&self, now: i64) -> StorageResult<()> {
        let mut state = self.state.lock()?;
        if state.current {
            if state.minutes.is_dirty() {
                state.minutes.save(&self.files.min_path())?;
            }
            self.records.sync()?;
            state.index.sync()?;
        } else if state.cache.is_some()
            && now > self.end() + self.config.cache_retention_after_period_ms
        {
            tracing::debug!("Dropping recent-entry cache of {}", self.name());
            state.cache = None;
        }
        Ok(())
    }

    pub fn has_cache(&self) -> StorageResult<bool> {
        Ok(self.state.lock()?.cache.is_some())
    }

    /// Remove this period's files from disk
    pub fn delete_files(&self) -> StorageResult<()> {
        tracing::info!("Deleting period {}", self.name());
        self.files.delete()
    }

    /// One index entry, from the cache when possible
    pub fn get_index_entry(&self, entry_number: u32) -> StorageResult<IndexEntry> {
        let mut state = self.state.lock()?;
        self.entry_locked(&mut state, entry_number)
    }

    /// Bulk read of index entries (corrupt ones are left out)
    pub fn read_entries(&self, start: u32, count: usize) -> StorageResult<Vec<IndexEntry>> {
        let mut state = self.state.lock()?;
        let end = start.saturating_add(count as u32).min(state.num_entries);
        if start >= end {
            return Ok(Vec::new());
        }
        if let Some(cached) = state.cache.as_ref().and_then(|c| c.range(start, end)) {
            return Ok(cached);
        }
        state.index.read_indexes(start, (end - start) as usize)
    }

    /// Read the full message for an index entry
    pub fn read_message(&self, entry: &IndexEntry) -> StorageResult<ArchivedMessage> {
        let handle = EntryHandle::new(self.start, entry.entry_number);
        if !entry.has_valid_offset() {
            return Err(StorageError::EntryNotFound(format!("{} has no record", handle)));
        }
        match self.records.read_at(entry.record_offset as u64)? {
            Some(message) => Ok(ArchivedMessage { handle, message }),
            None => Err(StorageError::EntryNotFound(format!(
                "{}: no record near offset {}",
                handle, entry.record_offset
            ))),
        }
    }

    /// Read a message by entry number
    pub fn get_message(&self, entry_number: u32) -> StorageResult<ArchivedMessage> {
        let entry = self.get_index_entry(entry_number)?;
        self.read_message(&entry)
    }

    /// Position a cursor in this period from its `since` time
    pub fn start_search(&self, cursor: &mut SearchCursor) -> StorageResult<()> {
        let state = self.state.lock()?;
        cursor.period_start = Some(self.start);
        cursor.positioned = true;

        match cursor.criteria().since {
            None => {
                cursor.minute = 0;
                cursor.next_entry = 0;
            }
            Some(since) => {
                let minute = state.minutes.minute_for(since);
                match state.minutes.first_non_empty_from(minute) {
                    Some(m) => {
                        cursor.minute = m;
                        cursor.next_entry = state.minutes.bucket(m).start_entry as u32;
                    }
                    None => {
                        cursor.minute = MINUTES_PER_DAY - 1;
                        cursor.next_entry = state.num_entries;
                    }
                }
                tracing::debug!(
                    "{}: search {} since {} starts at minute {}, entry {} of {}",
                    self.name(),
                    cursor.id(),
                    fmt_time(since),
                    cursor.minute,
                    cursor.next_entry,
                    state.num_entries
                );
            }
        }
        Ok(())
    }

    /// Resolve the cursor's position and bulk-read the next run of index
    /// entries, at most up to the end of the cursor's minute. Returns
    /// `None` at the end of the period.
    fn next_index_run(
        &self,
        cursor: &mut SearchCursor,
    ) -> StorageResult<Option<(u32, Vec<IndexEntry>)>> {
        let mut state = self.state.lock()?;
        let total = state.num_entries;
        if cursor.next_entry >= total {
            return Ok(None);
        }

        let until = cursor.criteria().until;
        let mut end = state.minutes.minute_end(cursor.minute, total);
        if cursor.minute < MINUTES_PER_DAY - 1 && cursor.next_entry >= end {
            match state.minutes.first_candidate_from(cursor.minute + 1, until) {
                Some(m) => {
                    cursor.minute = m;
                    cursor.next_entry = state.minutes.bucket(m).start_entry as u32;
                    end = state.minutes.minute_end(m, total);
                }
                None => {
                    cursor.minute = MINUTES_PER_DAY - 1;
                    cursor.next_entry = total;
                    return Ok(None);
                }
            }
        }

        // Buckets are hints; never let a stale bucket stall the cursor
        let start = cursor.next_entry;
        let end = end.max(start + 1).min(total);
        if start >= end {
            return Ok(None);
        }
        let count = ((end - start) as usize).min(self.config.index_batch);
        let end = start + count as u32;

        let entries = match state.cache.as_ref().and_then(|c| c.range(start, end)) {
            Some(cached) => cached,
            None => state.index.read_indexes(start, count)?,
        };
        Ok(Some((end, entries)))
    }

    /// Continue a search in this period, appending to `out` until it
    /// holds `max_batch` messages
    pub fn continue_search(
        &self,
        cursor: &mut SearchCursor,
        deadline: Instant,
        out: &mut Vec<ArchivedMessage>,
    ) -> StorageResult<SearchStatus> {
        if !cursor.positioned || cursor.period_start != Some(self.start) {
            self.start_search(cursor)?;
        }

        let max_batch = cursor.criteria().max_batch;
        let settling = cursor.criteria().is_real_time() && cursor.criteria().settling_delay;
        let now = now_millis();
        let mut added = 0usize;
        let mut settling_hit = false;

        'scan: while out.len() < max_batch && Instant::now() < deadline {
            let Some((end, entries)) = self.next_index_run(cursor)? else {
                break;
            };

            let mut consumed_all = true;
            for entry in entries {
                if out.len() >= max_batch {
                    consumed_all = false;
                    break;
                }
                if settling && entry.local_recv_time > now - self.config.settling_delay_ms {
                    settling_hit = true;
                    break 'scan;
                }

                cursor.next_entry = entry.entry_number + 1;
                cursor.entries_examined += 1;

                if entry.is_deleted()
                    || !entry.has_valid_offset()
                    || !cursor.criteria().passes(&entry)
                {
                    continue;
                }
                match self.read_message(&entry) {
                    Ok(msg) if !msg.message.is_deleted() => {
                        out.push(msg);
                        added += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            "{}: skipping entry {}: {}",
                            self.name(),
                            entry.entry_number,
                            e
                        );
                    }
                }
            }

            // Corrupt entries are absent from the run; step over them
            if consumed_all && cursor.next_entry < end {
                cursor.next_entry = end;
            }
        }
        cursor.returned += added as u64;

        if out.len() >= max_batch {
            return Ok(SearchStatus::More);
        }
        if Instant::now() >= deadline {
            return Ok(SearchStatus::TimeLimit);
        }
        if settling_hit {
            return Ok(SearchStatus::Pause);
        }

        // End of this period
        if !self.is_current()? {
            tracing::debug!(
                "{}: search {} reached end of period, moving to {}",
                self.name(),
                cursor.id(),
                fmt_time(self.end())
            );
            cursor.enter_period(self.end());
            return Ok(SearchStatus::More);
        }
        if added > 0 {
            Ok(SearchStatus::More)
        } else if cursor.criteria().is_real_time() {
            Ok(SearchStatus::Pause)
        } else {
            Ok(SearchStatus::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::search::SearchCriteria;
    use crate::storage::layout::RecordLayout;
    use crate::storage::types::{DcpAddress, MessageClass, MS_PER_MINUTE};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    const DAY: i64 = 1_704_412_800_000; // 2024-01-05

    fn config(dir: &std::path::Path) -> ArchiveConfig {
        ArchiveConfig::new(dir)
    }

    fn msg_at(recv: i64, addr: u32) -> Message {
        Message::new(DcpAddress(addr), recv - 500, format!("msg {}", addr))
            .received_at(recv)
            .class(MessageClass::GoesSelfTimed)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    /// Drive a search to completion, collecting handles
    fn run_search(period: &PeriodArchive, criteria: SearchCriteria) -> Vec<u32> {
        let mut cursor = SearchCursor::new(criteria);
        let mut got = Vec::new();
        for _ in 0..1000 {
            let mut batch = Vec::new();
            let status = period
                .continue_search(&mut cursor, far_deadline(), &mut batch)
                .unwrap();
            got.extend(batch.iter().map(|m| m.handle.entry_number));
            if status != SearchStatus::More {
                break;
            }
        }
        got
    }

    #[test]
    fn test_delete_excluded_from_search() {
        let dir = tempdir().unwrap();
        let period = PeriodArchive::create(DAY, &config(dir.path())).unwrap();
        for i in 0..5 {
            let n = period.archive_msg(&msg_at(DAY + 10_000 * (i + 1), i as u32), None).unwrap();
            assert_eq!(n, i as u32);
        }
        let bucket = period.minute_index().unwrap().bucket(0);
        assert_eq!(bucket.start_entry, 0);

        period.delete_entry(2).unwrap();

        let got = run_search(
            &period,
            SearchCriteria::new().since(DAY).until(DAY + MS_PER_MINUTE),
        );
        assert_eq!(got, vec![0, 1, 3, 4]);

        // Record still readable, only flagged
        let deleted = period.get_message(2).unwrap();
        assert!(deleted.message.is_deleted());
        assert_eq!(deleted.message.payload, b"msg 2");
    }

    #[test]
    fn test_entry_numbers_dense_under_concurrency() {
        let dir = tempdir().unwrap();
        let period = Arc::new(PeriodArchive::create(DAY, &config(dir.path())).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let period = Arc::clone(&period);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| {
                            period
                                .archive_msg(&msg_at(DAY + 1000 * i, t * 100 + i as u32), None)
                                .unwrap()
                        })
                        .collect::<Vec<u32>>()
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<u32>>());
        assert_eq!(period.num_entries().unwrap(), 200);
    }

    #[test]
    fn test_resumable_search_matches_single_pass() {
        let dir = tempdir().unwrap();
        let period = PeriodArchive::create(DAY, &config(dir.path())).unwrap();
        for i in 0..120i64 {
            period
                .archive_msg(&msg_at(DAY + i * 37_000, i as u32), None)
                .unwrap();
        }
        period.delete_entry(17).unwrap();

        let window = SearchCriteria::new()
            .since(DAY + 5 * MS_PER_MINUTE)
            .until(DAY + 60 * MS_PER_MINUTE);

        let single = run_search(&period, window.clone().max_batch(10_000));
        let split = run_search(&period, window.max_batch(3));
        assert!(!single.is_empty());
        assert_eq!(single, split);
        assert!(!single.contains(&17));
    }

    #[test]
    fn test_minute_pruning_skips_late_minutes() {
        let dir = tempdir().unwrap();
        let period = PeriodArchive::create(DAY, &config(dir.path())).unwrap();
        for minute in [5i64, 300, 900] {
            for s in 0..3 {
                let t = DAY + minute * MS_PER_MINUTE + s * 1000;
                period
                    .archive_msg(&Message::new(DcpAddress(1), t, Vec::new()).received_at(t), None)
                    .unwrap();
            }
        }

        let oldest_300 = period.minute_index().unwrap().bucket(300).oldest_source_time;
        let mut cursor =
            SearchCursor::new(SearchCriteria::new().since(DAY).until(oldest_300 - 1));
        let mut batch = Vec::new();
        loop {
            let status = period
                .continue_search(&mut cursor, far_deadline(), &mut batch)
                .unwrap();
            if status != SearchStatus::More {
                assert_eq!(status, SearchStatus::Done);
                break;
            }
        }

        assert_eq!(batch.len(), 3);
        // Only minute 5's entries were ever examined
        assert_eq!(cursor.entries_examined(), 3);
    }

    #[test]
    fn test_finish_rejects_writes_and_saves_minutes() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let period = PeriodArchive::create(DAY, &cfg).unwrap();
        period.archive_msg(&msg_at(DAY + 61_000, 1), None).unwrap();
        period.archive_msg(&msg_at(DAY + 3_600_000, 2), None).unwrap();

        let in_memory = period.minute_index().unwrap();
        period.finish().unwrap();

        assert!(!period.is_current().unwrap());
        assert!(matches!(
            period.archive_msg(&msg_at(DAY + 7_200_000, 3), None),
            Err(StorageError::PeriodFinalized(_))
        ));
        assert!(matches!(
            period.delete_entry(0),
            Err(StorageError::PeriodFinalized(_))
        ));

        let on_disk = MinuteIndex::load(&period.files().min_path())
            .unwrap()
            .unwrap();
        assert_eq!(on_disk.bucket(1), in_memory.bucket(1));
        assert_eq!(on_disk.bucket(60), in_memory.bucket(60));
        assert_eq!(on_disk.non_empty_count(), in_memory.non_empty_count());
    }

    #[test]
    fn test_finalized_period_search_moves_to_next_day() {
        let dir = tempdir().unwrap();
        let period = PeriodArchive::create(DAY, &config(dir.path())).unwrap();
        period.archive_msg(&msg_at(DAY + 1000, 1), None).unwrap();
        period.finish().unwrap();

        let mut cursor = SearchCursor::new(SearchCriteria::new().since(DAY));
        let mut batch = Vec::new();
        let status = period
            .continue_search(&mut cursor, far_deadline(), &mut batch)
            .unwrap();
        assert_eq!(status, SearchStatus::More);
        assert_eq!(batch.len(), 1);
        assert_eq!(cursor.period_start(), Some(DAY + MS_PER_DAY));
        assert_eq!(cursor.next_entry(), 0);
    }

    #[test]
    fn test_real_time_search_pauses() {
        let dir = tempdir().unwrap();
        let today = crate::storage::types::day_start(now_millis());
        let period = PeriodArchive::create(today, &config(dir.path())).unwrap();

        // Nothing yet: real-time search pauses
        let mut cursor = SearchCursor::new(SearchCriteria::new().settling_delay(true));
        let mut batch = Vec::new();
        let status = period
            .continue_search(&mut cursor, far_deadline(), &mut batch)
            .unwrap();
        assert_eq!(status, SearchStatus::Pause);

        // A message received just now is withheld by the settling delay
        let now = now_millis();
        period
            .archive_msg(&Message::new(DcpAddress(5), now, b"fresh".to_vec()).received_at(now), None)
            .unwrap();
        let status = period
            .continue_search(&mut cursor, far_deadline(), &mut batch)
            .unwrap();
        assert_eq!(status, SearchStatus::Pause);
        assert!(batch.is_empty());
        assert_eq!(cursor.next_entry(), 0);

        // Without the delay it is returned at once
        let mut cursor = SearchCursor::new(SearchCriteria::new());
        let status = period
            .continue_search(&mut cursor, far_deadline(), &mut batch)
            .unwrap();
        assert_eq!(status, SearchStatus::More);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_expired_deadline_is_time_limit() {
        let dir = tempdir().unwrap();
        let period = PeriodArchive::create(DAY, &config(dir.path())).unwrap();
        period.archive_msg(&msg_at(DAY + 1000, 1), None).unwrap();

        let mut cursor = SearchCursor::new(SearchCriteria::new().since(DAY));
        let mut batch = Vec::new();
        let status = period
            .continue_search(&mut cursor, Instant::now(), &mut batch)
            .unwrap();
        assert_eq!(status, SearchStatus::TimeLimit);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_patch_sequence_updates_index_and_record() {
        let dir = tempdir().unwrap();
        for layout in [RecordLayout::Legacy, RecordLayout::Extended, RecordLayout::Structured] {
            let mut cfg = config(&dir.path().join(layout.to_string()));
            cfg.layout = layout;
            let period = PeriodArchive::create(DAY, &cfg).unwrap();
            period.archive_msg(&msg_at(DAY + 1000, 1), None).unwrap();

            let entry = period.patch_sequence(0, 4321, Some(DAY + 900)).unwrap();
            assert_eq!(entry.sequence_number(), Some(4321));

            let stored = period.get_message(0).unwrap().message;
            assert_eq!(stored.sequence_number(), Some(4321));
            assert_eq!(period.get_index_entry(0).unwrap().relay_time, Some(DAY + 900));
        }
    }

    #[test]
    fn test_reopen_reconciles_missing_minute_file() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let prev = EntryHandle::new(DAY - MS_PER_DAY, 4);
        {
            let period = PeriodArchive::create(DAY, &cfg).unwrap();
            period.archive_msg(&msg_at(DAY + 2 * MS_PER_MINUTE, 1), Some(prev)).unwrap();
            period.archive_msg(&msg_at(DAY + 10 * MS_PER_MINUTE, 2), None).unwrap();
            // Dropped without finish(): no minute file written
        }
        let files = PeriodFiles::new(dir.path(), cfg.layout, DAY);
        assert!(!files.min_path().exists());

        let period = PeriodArchive::open(files, true, &cfg).unwrap();
        assert_eq!(period.num_entries().unwrap(), 2);
        let minutes = period.minute_index().unwrap();
        assert_eq!(minutes.bucket(2).start_entry, 0);
        assert_eq!(minutes.bucket(10).start_entry, 1);
        assert_eq!(period.get_index_entry(0).unwrap().prev, Some(prev));

        // Appends continue the numbering
        assert_eq!(period.archive_msg(&msg_at(DAY + 11 * MS_PER_MINUTE, 3), None).unwrap(), 2);
    }

    /// Flip a byte inside index entry `n` so its checksum no longer matches
    fn corrupt_index_entry(path: &std::path::Path, n: u32) {
        use crate::storage::index_file::ENTRY_LEN;
        use std::io::{Read, Seek, SeekFrom, Write};

        let at = n as u64 * ENTRY_LEN as u64 + 8;
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(at)).unwrap();
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(at)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    }

    #[test]
    fn test_search_steps_over_corrupt_index_entries() {
        // Minute 0 holds entries 0..=2, minute 1 holds 3..=4
        let recv = [10_000, 20_000, 30_000, 70_000, 80_000];
        let cases: Vec<(Vec<u32>, Vec<u32>)> = vec![
            (vec![1], vec![0, 2, 3, 4]),
            (vec![2], vec![0, 1, 3, 4]),
            (vec![4], vec![0, 1, 2, 3]),
            (vec![2, 4], vec![0, 1, 3]),
        ];

        for (i, (corrupt, expected)) in cases.iter().enumerate() {
            let dir = tempdir().unwrap();
            let cfg = config(&dir.path().join(i.to_string()));
            let files = {
                let period = PeriodArchive::create(DAY, &cfg).unwrap();
                for (n, t) in recv.iter().enumerate() {
                    period.archive_msg(&msg_at(DAY + t, n as u32), None).unwrap();
                }
                period.finish().unwrap();
                period.files().clone()
            };
            for &n in corrupt {
                corrupt_index_entry(&files.idx_path(), n);
            }

            let period = PeriodArchive::open(files, false, &cfg).unwrap();
            assert_eq!(period.num_entries().unwrap(), 5);

            let mut cursor = SearchCursor::new(
                SearchCriteria::new().since(DAY).until(DAY + 2 * MS_PER_MINUTE),
            );
            let mut batch = Vec::new();
            let status = period
                .continue_search(&mut cursor, far_deadline(), &mut batch)
                .unwrap();
            let got: Vec<u32> = batch.iter().map(|m| m.handle.entry_number).collect();
            assert_eq!(&got, expected, "corrupt entries {:?}", corrupt);
            // Reached the end of the day instead of stalling on the bad entry
            assert_eq!(status, SearchStatus::More);
            assert_eq!(cursor.period_start(), Some(DAY + MS_PER_DAY));
            assert!(matches!(
                period.get_index_entry(corrupt[0]),
                Err(StorageError::Corruption(_))
            ));
        }
    }

    #[test]
    fn test_current_period_search_done_past_corrupt_last_entry() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let files = {
            let period = PeriodArchive::create(DAY, &cfg).unwrap();
            for (n, t) in [10_000i64, 20_000, 70_000, 80_000].iter().enumerate() {
                period.archive_msg(&msg_at(DAY + t, n as u32), None).unwrap();
            }
            period.files().clone()
        };
        corrupt_index_entry(&files.idx_path(), 3);

        let period = PeriodArchive::open(files, true, &cfg).unwrap();
        let mut cursor = SearchCursor::new(
            SearchCriteria::new().since(DAY).until(DAY + 2 * MS_PER_MINUTE),
        );
        let mut got = Vec::new();
        let mut status = SearchStatus::More;
        for _ in 0..10 {
            let mut batch = Vec::new();
            status = period
                .continue_search(&mut cursor, far_deadline(), &mut batch)
                .unwrap();
            got.extend(batch.iter().map(|m| m.handle.entry_number));
            if status != SearchStatus::More {
                break;
            }
        }
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(status, SearchStatus::Done);
        assert_eq!(cursor.next_entry(), 4);
    }

    #[test]
    fn test_checkpoint_drops_cache_after_retention() {
        let dir = tempdir().unwrap();
        let period = PeriodArchive::create(DAY, &config(dir.path())).unwrap();
        period.archive_msg(&msg_at(DAY + 1000, 1), None).unwrap();
        period.finish().unwrap();

        period.checkpoint(DAY + MS_PER_DAY + 60_000).unwrap();
        assert!(period.has_cache().unwrap());

        period
            .checkpoint(DAY + MS_PER_DAY + 2 * 3_600_000)
            .unwrap();
        assert!(!period.has_cache().unwrap());
        assert_eq!(period.get_message(0).unwrap().message.payload, b"msg 1");
    }
}
