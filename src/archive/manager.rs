//! ArchiveManager: the set of day-periods covering the retention window
//!
//! Owns every open [`PeriodArchive`], routes appends to the current one,
//! rolls over to a new period at the day boundary, evicts periods beyond
//! retention and drives multi-period searches.
//!
//! # Locking
//! ```text
//! append (Mutex)        serializes appends with rollover; taken first
//! periods (RwLock)      coarse; held only to look up, add or remove periods
//! last_msgs (Mutex)     held across an append so back-links stay ordered
//! outage maps           own per-day locks, independent of the periods
//! per-period state      see PeriodArchive
//! ```

use crate::archive::naming::scan_dir;
use crate::archive::period::PeriodArchive;
use crate::archive::search::{SearchCriteria, SearchCursor, SearchStatus};
use crate::index::{LastMessage, LastMessageIndex, OutageSequenceIndex, SequenceRange};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::layout::RecordLayout;
use crate::storage::record::DEFAULT_RESYNC_WINDOW;
use crate::storage::types::{
    day_start, fmt_time, now_millis, ArchivedMessage, DataSourceId, DcpAddress, EntryHandle,
    Message, MS_PER_DAY,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Archive engine configuration
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Directory holding all period files
    pub dir: PathBuf,
    /// Number of day-periods to keep (default: 31)
    pub retention_days: usize,
    /// Layout for newly created periods
    pub layout: RecordLayout,
    /// Real-time settling window in milliseconds (default: 30s)
    pub settling_delay_ms: i64,
    /// Recent-entry cache capacity (default: 25000)
    pub cache_capacity: usize,
    /// Entries dropped when the cache is full (default: 5000)
    pub cache_trim: usize,
    /// Index entries read per bulk read (default: 100)
    pub index_batch: usize,
    /// Bytes a record read may skip looking for a start pattern
    pub resync_window: usize,
    /// Outage query padding on both sides in milliseconds (default: 15s)
    pub outage_padding_ms: i64,
    /// Maintenance interval in seconds (default: 60)
    pub checkpoint_interval_secs: u64,
    /// How long a finalized period keeps its cache (default: 1 hour)
    pub cache_retention_after_period_ms: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("dcp_archive"),
            retention_days: 31,
            layout: RecordLayout::Structured,
            settling_delay_ms: 30_000,
            cache_capacity: 25_000,
            cache_trim: 5_000,
            index_batch: 100,
            resync_window: DEFAULT_RESYNC_WINDOW,
            outage_padding_ms: 15_000,
            checkpoint_interval_secs: 60,
            cache_retention_after_period_ms: 3_600_000,
        }
    }
}

impl ArchiveConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

/// Archive statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveStats {
    pub period_count: usize,
    pub total_messages: u64,
    pub oldest_source_time: Option<i64>,
    pub newest_period: Option<i64>,
    pub bytes_on_disk: u64,
}

impl std::fmt::Display for ArchiveStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Periods: {}, Messages: {}, Oldest: {}, Newest period: {}, Size: {:.2} MB",
            self.period_count,
            self.total_messages,
            self.oldest_source_time
                .map(fmt_time)
                .unwrap_or_else(|| "-".to_string()),
            self.newest_period
                .map(fmt_time)
                .unwrap_or_else(|| "-".to_string()),
            self.bytes_on_disk as f64 / (1024.0 * 1024.0)
        )
    }
}

struct PeriodSet {
    periods: BTreeMap<i64, Arc<PeriodArchive>>,
    current: Arc<PeriodArchive>,
}

/// The archive engine
pub struct ArchiveManager {
    config: ArchiveConfig,
    set: RwLock<PeriodSet>,
    append: Mutex<()>,
    last_msgs: Mutex<LastMessageIndex>,
    outage: OutageSequenceIndex,
    /// Added to the wall clock; non-zero only when opened with `open_at`
    clock_offset: i64,
    read_only: bool,
    pub(crate) shutdown: AtomicBool,
}

impl ArchiveManager {
    /// Open the archive for the current wall-clock day
    pub fn open(config: ArchiveConfig) -> StorageResult<Self> {
        Self::open_at(config, now_millis())
    }

    /// Open the archive as if the time were `now`
    ///
    /// Existing periods are reopened (the one containing `now` writable,
    /// all others read-only) and the current period is created if missing.
    /// Failing to open or create the current period is fatal.
    pub fn open_at(config: ArchiveConfig, now: i64) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let today = day_start(now);
        tracing::info!(
            "Opening archive in {:?}, current day {}",
            config.dir,
            fmt_time(today)
        );

        let mut periods = BTreeMap::new();
        for files in scan_dir(&config.dir)? {
            let start = files.period_start;
            let is_today = start == today;
            match PeriodArchive::open(files, is_today, &config) {
                Ok(p) => {
                    periods.insert(start, Arc::new(p));
                }
                Err(e) if is_today => {
                    tracing::error!("Cannot open current period {}: {}", fmt_time(start), e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable period {}: {}", fmt_time(start), e);
                }
            }
        }

        let current = match periods.get(&today) {
            Some(p) => Arc::clone(p),
            None => {
                let p = Arc::new(PeriodArchive::create(today, &config).map_err(|e| {
                    tracing::error!("Cannot create current period {}: {}", fmt_time(today), e);
                    StorageError::ArchiveUnavailable(format!(
                        "cannot create current period {}: {}",
                        fmt_time(today),
                        e
                    ))
                })?);
                periods.insert(today, Arc::clone(&p));
                p
            }
        };

        let last_msgs = LastMessageIndex::new(&config.dir)?;
        let outage = OutageSequenceIndex::new(today, config.outage_padding_ms);

        let manager = Self {
            set: RwLock::new(PeriodSet { periods, current }),
            append: Mutex::new(()),
            last_msgs: Mutex::new(last_msgs),
            outage,
            clock_offset: now - now_millis(),
            read_only: false,
            shutdown: AtomicBool::new(false),
            config,
        };
        manager.evict()?;
        manager.rebuild_last_messages()?;
        manager.rebuild_outage_maps()?;
        Ok(manager)
    }

    /// Open an existing archive for inspection
    ///
    /// Every period is opened read-only and nothing in the directory is
    /// created, evicted or rewritten, so this is safe next to a running
    /// host. The newest period stands in as current for searches. Fails
    /// when the directory holds no readable period.
    pub fn open_read_only(config: ArchiveConfig) -> StorageResult<Self> {
        tracing::info!("Opening archive in {:?} read-only", config.dir);

        let mut periods = BTreeMap::new();
        for files in scan_dir(&config.dir)? {
            let start = files.period_start;
            match PeriodArchive::open(files, false, &config) {
                Ok(p) => {
                    periods.insert(start, Arc::new(p));
                }
                Err(e) => tracing::warn!("Skipping unreadable period {}: {}", fmt_time(start), e),
            }
        }

        let Some(current) = periods.values().next_back().cloned() else {
            return Err(StorageError::ArchiveUnavailable(format!(
                "no readable period in {:?}",
                config.dir
            )));
        };

        let last_msgs = LastMessageIndex::open_read_only(&config.dir)?;
        let outage = OutageSequenceIndex::new(current.start(), config.outage_padding_ms);

        let manager = Self {
            set: RwLock::new(PeriodSet { periods, current }),
            append: Mutex::new(()),
            last_msgs: Mutex::new(last_msgs),
            outage,
            clock_offset: 0,
            read_only: true,
            shutdown: AtomicBool::new(false),
            config,
        };
        manager.rebuild_last_messages()?;
        manager.rebuild_outage_maps()?;
        Ok(manager)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self, op: &str) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly(op.to_string()));
        }
        Ok(())
    }

    /// The archive's notion of now
    pub fn now(&self) -> i64 {
        now_millis() + self.clock_offset
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// The writable period
    pub fn current_period(&self) -> StorageResult<Arc<PeriodArchive>> {
        Ok(Arc::clone(&self.set.read()?.current))
    }

    /// All open periods, oldest first
    pub fn periods(&self) -> StorageResult<Vec<Arc<PeriodArchive>>> {
        Ok(self.set.read()?.periods.values().cloned().collect())
    }

    /// Period by its day-start
    pub fn period(&self, start: i64) -> StorageResult<Option<Arc<PeriodArchive>>> {
        Ok(self.set.read()?.periods.get(&start).cloned())
    }

    fn period_for(&self, handle: EntryHandle) -> StorageResult<Arc<PeriodArchive>> {
        self.period(handle.period_start)?.ok_or_else(|| {
            StorageError::ArchiveUnavailable(format!(
                "no period for {}",
                fmt_time(handle.period_start)
            ))
        })
    }

    /// Bring the per-platform pointers up to date with the current period
    fn rebuild_last_messages(&self) -> StorageResult<()> {
        let oldest = self.set.read()?.periods.keys().next().copied();
        let current = self.current_period()?;
        let mut last_msgs = self.last_msgs.lock()?;

        if let Some(oldest) = oldest {
            last_msgs.remove_before(oldest);
        }

        let total = current.num_entries()?;
        let mut next = 0u32;
        while next < total {
            for e in current.read_entries(next, self.config.index_batch)? {
                last_msgs.update(
                    e.dcp_address,
                    LastMessage {
                        handle: EntryHandle::new(current.start(), e.entry_number),
                        source_time: e.source_time,
                        flags: e.flags,
                    },
                );
            }
            next = next.saturating_add(self.config.index_batch as u32);
        }
        tracing::info!(
            "Platform pointers: {} platforms after scanning {} entries",
            last_msgs.len(),
            total
        );
        Ok(())
    }

    /// Refill today's and yesterday's outage maps from the index
    fn rebuild_outage_maps(&self) -> StorageResult<()> {
        let today = self.outage.today_start()?;
        let mut mapped = 0usize;
        for start in [today - MS_PER_DAY, today] {
            let Some(period) = self.period(start)? else {
                continue;
            };
            let total = period.num_entries()?;
            let mut next = 0u32;
            while next < total {
                for e in period.read_entries(next, self.config.index_batch)? {
                    if let (Some(seq), Some(relay)) = (e.sequence_number(), e.relay_time) {
                        if !e.is_deleted()
                            && self
                                .outage
                                .add(relay, seq, EntryHandle::new(start, e.entry_number))?
                        {
                            mapped += 1;
                        }
                    }
                }
                next = next.saturating_add(self.config.index_batch as u32);
            }
        }
        tracing::info!("Outage maps rebuilt with {} sequence numbers", mapped);
        Ok(())
    }

    /// Archive a message received from `source`
    pub fn archive_msg(&self, msg: Message, source: DataSourceId) -> StorageResult<EntryHandle> {
        self.archive_msg_at(msg, source, self.now())
    }

    /// Archive a message as if the time were `now`, first rolling over to
    /// a new period when `now` has crossed the day boundary
    pub fn archive_msg_at(
        &self,
        msg: Message,
        source: DataSourceId,
        now: i64,
    ) -> StorageResult<EntryHandle> {
        self.check_writable("archive_msg")?;
        let mut msg = msg;
        msg.data_source_id = source;

        let handle = {
            let _append = self.append.lock()?;
            let mut current = self.current_period()?;
            let today = day_start(now);
            if today > current.start() && !self.is_shut_down() {
                self.rollover_locked(today)?;
                current = self.current_period()?;
            }

            let mut last_msgs = self.last_msgs.lock()?;
            let prev = last_msgs.get(msg.dcp_address).map(|l| l.handle);
            let entry_number = current.archive_msg(&msg, prev)?;
            let handle = EntryHandle::new(current.start(), entry_number);
            last_msgs.update(
                msg.dcp_address,
                LastMessage {
                    handle,
                    source_time: msg.source_time,
                    flags: msg.flags,
                },
            );
            handle
        };

        if let (Some(seq), Some(relay)) = (msg.sequence_number(), msg.relay_time) {
            self.outage.add(relay, seq, handle)?;
        }
        Ok(handle)
    }

    /// Tombstone a message (it is superseded by a better copy)
    pub fn delete_entry(&self, handle: EntryHandle) -> StorageResult<()> {
        self.check_writable("delete_entry")?;
        self.period_for(handle)?.delete_entry(handle.entry_number)
    }

    /// Attach a sequence number that arrived after the message was
    /// archived. Only the current period accepts this.
    pub fn attach_sequence(
        &self,
        handle: EntryHandle,
        sequence_num: u32,
        relay_time: i64,
    ) -> StorageResult<()> {
        self.check_writable("attach_sequence")?;
        let period = self.period_for(handle)?;
        let entry = period.patch_sequence(handle.entry_number, sequence_num, Some(relay_time))?;
        self.outage.add(relay_time, sequence_num, handle)?;
        self.last_msgs.lock()?.mark_sequenced(entry.dcp_address, handle);
        Ok(())
    }

    /// Read one archived message
    pub fn get_message(&self, handle: EntryHandle) -> StorageResult<ArchivedMessage> {
        self.period_for(handle)?.get_message(handle.entry_number)
    }

    /// Newest pointer for a platform
    pub fn last_message(&self, addr: DcpAddress) -> StorageResult<Option<LastMessage>> {
        Ok(self.last_msgs.lock()?.get(addr))
    }

    /// Start a search; nothing is read until `continue_search`
    pub fn open_search(&self, criteria: SearchCriteria) -> SearchCursor {
        let cursor = SearchCursor::new(criteria);
        tracing::debug!("Opened search {}", cursor.id());
        cursor
    }

    /// Choose the period a cursor should scan next, moving the cursor to
    /// the earliest available period at or after its position when its
    /// own period is gone
    fn period_for_cursor(
        &self,
        cursor: &mut SearchCursor,
    ) -> StorageResult<Option<Arc<PeriodArchive>>> {
        let set = self.set.read()?;
        let target = match cursor.period_start() {
            Some(start) => start,
            None => match cursor.criteria().since {
                Some(since) => {
                    let day = day_start(since);
                    let first = set.periods.keys().next().copied().unwrap_or(day);
                    day.max(first).min(set.current.start())
                }
                None => set.periods.keys().next().copied().unwrap_or(set.current.start()),
            },
        };

        let found = set.periods.range(target..).next().map(|(_, p)| Arc::clone(p));
        if let Some(p) = &found {
            if cursor.period_start() != Some(p.start()) {
                cursor.enter_period(p.start());
            }
        }
        Ok(found)
    }

    /// Continue a search until the batch is full, the deadline passes or
    /// the scan has to stop
    pub fn continue_search(
        &self,
        cursor: &mut SearchCursor,
        deadline: Instant,
    ) -> StorageResult<(Vec<ArchivedMessage>, SearchStatus)> {
        let mut batch = Vec::new();
        if cursor.criteria().is_empty_window() {
            return Ok((batch, SearchStatus::Done));
        }

        loop {
            let Some(period) = self.period_for_cursor(cursor)? else {
                let status = if cursor.criteria().is_real_time() {
                    SearchStatus::Pause
                } else {
                    SearchStatus::Done
                };
                return Ok((batch, status));
            };

            let status = period.continue_search(cursor, deadline, &mut batch)?;
            let moved_on = cursor.period_start() != Some(period.start());
            if status == SearchStatus::More
                && moved_on
                && batch.len() < cursor.criteria().max_batch
                && Instant::now() < deadline
            {
                continue;
            }
            return Ok((batch, status));
        }
    }

    /// Messages with sequence numbers in `range` relayed between `from` and
    /// `until` (padded), oldest first
    pub fn get_by_sequence_range(
        &self,
        from: i64,
        until: i64,
        range: SequenceRange,
    ) -> StorageResult<Vec<ArchivedMessage>> {
        let mut found = Vec::new();
        for hit in self.outage.get_by_sequence_range(from, until, range)? {
            let Some(period) = self.period(hit.handle.period_start)? else {
                continue;
            };
            match period.get_message(hit.handle.entry_number) {
                Ok(msg) if !msg.message.is_deleted() => found.push(msg),
                Ok(_) => {}
                Err(e) => tracing::warn!("Outage lookup cannot read {}: {}", hit.handle, e),
            }
        }
        Ok(found)
    }

    /// Walk a platform's messages newest-first through the back-links,
    /// stopping at `since` or after `max` messages
    pub fn platform_history(
        &self,
        addr: DcpAddress,
        since: i64,
        max: usize,
    ) -> StorageResult<Vec<ArchivedMessage>> {
        let mut found = Vec::new();
        let mut next = self.last_message(addr)?.map(|l| l.handle);

        while let Some(handle) = next {
            if found.len() >= max {
                break;
            }
            let Some(period) = self.period(handle.period_start)? else {
                break;
            };
            let entry = match period.get_index_entry(handle.entry_number) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Broken history link {} for {}: {}", handle, addr, e);
                    break;
                }
            };
            if entry.dcp_address != addr || entry.source_time < since {
                break;
            }
            if !entry.is_deleted() {
                match period.read_message(&entry) {
                    Ok(msg) => found.push(msg),
                    Err(e) => tracing::warn!("Cannot read {}: {}", handle, e),
                }
            }
            next = entry.prev;
        }
        Ok(found)
    }

    /// Periodic maintenance: checkpoint every period, persist platform
    /// pointers, roll over when the day changes and evict old periods
    pub fn checkpoint(&self, now: i64) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        for period in self.periods()? {
            if let Err(e) = period.checkpoint(now) {
                tracing::warn!("Checkpoint of {} failed: {}", period.name(), e);
            }
        }
        if let Err(e) = self.persist_last_messages() {
            tracing::warn!("Cannot save platform pointers: {}", e);
        }

        let today = day_start(now);
        if today > self.current_period()?.start() {
            self.rollover(today)?;
        }
        self.evict()?;
        Ok(())
    }

    pub(crate) fn persist_last_messages(&self) -> StorageResult<()> {
        self.last_msgs.lock()?.persist()
    }

    /// Finalize the current period and start a new one at `new_start`
    pub fn rollover(&self, new_start: i64) -> StorageResult<()> {
        self.check_writable("rollover")?;
        let _append = self.append.lock()?;
        self.rollover_locked(new_start)
    }

    /// Rollover with the append lock already held
    fn rollover_locked(&self, new_start: i64) -> StorageResult<()> {
        let mut set = self.set.write()?;
        if new_start <= set.current.start() {
            return Ok(());
        }

        let next = match set.periods.get(&new_start) {
            Some(existing) => {
                tracing::warn!("Period {} already exists, reopening writable", existing.name());
                let files = existing.files().clone();
                Arc::new(PeriodArchive::open(files, true, &self.config)?)
            }
            None => Arc::new(PeriodArchive::create(new_start, &self.config)?),
        };

        let old = std::mem::replace(&mut set.current, Arc::clone(&next));
        set.periods.insert(new_start, next);
        drop(set);

        old.finish()?;
        self.outage.rotate(new_start)?;
        tracing::info!(
            "Rolled over from {} to {}",
            fmt_time(old.start()),
            fmt_time(new_start)
        );
        Ok(())
    }

    /// Delete periods beyond the retention count, oldest first
    pub fn evict(&self) -> StorageResult<usize> {
        self.check_writable("evict")?;
        let mut evicted = Vec::new();
        {
            let mut set = self.set.write()?;
            let keep = self.config.retention_days.max(1);
            while set.periods.len() > keep {
                let Some((&start, _)) = set.periods.iter().next() else {
                    break;
                };
                if start == set.current.start() {
                    break;
                }
                if let Some(p) = set.periods.remove(&start) {
                    evicted.push(p);
                }
            }
        }

        for period in &evicted {
            if let Err(e) = period.delete_files() {
                tracing::warn!("Cannot delete period {}: {}", period.name(), e);
            }
        }
        if !evicted.is_empty() {
            let oldest = self.set.read()?.periods.keys().next().copied();
            if let Some(oldest) = oldest {
                self.last_msgs.lock()?.remove_before(oldest);
            }
            tracing::info!("Evicted {} period(s) beyond retention", evicted.len());
        }
        Ok(evicted.len())
    }

    /// Archive statistics
    pub fn stats(&self) -> StorageResult<ArchiveStats> {
        let periods = self.periods()?;
        let mut stats = ArchiveStats {
            period_count: periods.len(),
            newest_period: periods.last().map(|p| p.start()),
            ..Default::default()
        };
        for p in &periods {
            stats.total_messages += p.num_entries()? as u64;
            stats.bytes_on_disk += p.files().size_on_disk();
            if let Some(oldest) = p.oldest_source_time()? {
                stats.oldest_source_time =
                    Some(stats.oldest_source_time.map_or(oldest, |o| o.min(oldest)));
            }
        }
        Ok(stats)
    }

    /// Number of sequence numbers mapped (yesterday, today)
    pub fn outage_map_sizes(&self) -> StorageResult<(usize, usize)> {
        self.outage.sizes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{MessageClass, MS_PER_MINUTE};
    use std::time::Duration;
    use tempfile::tempdir;

    const DAY: i64 = 1_704_412_800_000; // 2024-01-05

    fn open(dir: &std::path::Path, now: i64) -> ArchiveManager {
        ArchiveManager::open_at(ArchiveConfig::new(dir), now).unwrap()
    }

    fn msg(addr: u32, recv: i64) -> Message {
        Message::new(DcpAddress(addr), recv - 1000, format!("{}@{}", addr, recv))
            .received_at(recv)
            .class(MessageClass::GoesSelfTimed)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn drain(manager: &ArchiveManager, criteria: SearchCriteria) -> (Vec<EntryHandle>, SearchStatus) {
        let mut cursor = manager.open_search(criteria);
        let mut handles = Vec::new();
        for _ in 0..1000 {
            let (batch, status) = manager.continue_search(&mut cursor, deadline()).unwrap();
            handles.extend(batch.iter().map(|m| m.handle));
            if status != SearchStatus::More {
                return (handles, status);
            }
        }
        panic!("search did not finish");
    }

    #[test]
    fn test_open_creates_current_period() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY + 5000);
        let current = manager.current_period().unwrap();
        assert_eq!(current.start(), DAY);
        assert!(current.is_current().unwrap());
        assert!(dir.path().join("archv-20240105.msg").exists());
        assert!(dir.path().join("archv-20240105.idx").exists());
    }

    #[test]
    fn test_archive_and_search_across_rollover() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        for i in 0..3 {
            manager
                .archive_msg(msg(1, DAY + 10_000 * (i + 1)), DataSourceId(7))
                .unwrap();
        }

        let next_day = DAY + MS_PER_DAY;
        manager.checkpoint(next_day + 1000).unwrap();
        assert_eq!(manager.current_period().unwrap().start(), next_day);
        assert!(!manager.period(DAY).unwrap().unwrap().is_current().unwrap());

        for i in 0..2 {
            manager
                .archive_msg(msg(1, next_day + 10_000 * (i + 1)), DataSourceId(7))
                .unwrap();
        }

        let (handles, status) = drain(
            &manager,
            SearchCriteria::new().since(DAY).until(next_day + MS_PER_MINUTE),
        );
        assert_eq!(status, SearchStatus::Done);
        assert_eq!(
            handles,
            vec![
                EntryHandle::new(DAY, 0),
                EntryHandle::new(DAY, 1),
                EntryHandle::new(DAY, 2),
                EntryHandle::new(next_day, 0),
                EntryHandle::new(next_day, 1),
            ]
        );

        // Finalized period rejects mutation
        assert!(matches!(
            manager.delete_entry(EntryHandle::new(DAY, 0)),
            Err(StorageError::PeriodFinalized(_))
        ));
    }

    #[test]
    fn test_append_after_midnight_rolls_over_first() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        let before = manager.archive_msg(msg(1, DAY + 1000), DataSourceId(1)).unwrap();

        // No maintenance pass has run since midnight
        let next_day = DAY + MS_PER_DAY;
        let now = next_day + 5000;
        let handle = manager.archive_msg_at(msg(1, now), DataSourceId(1), now).unwrap();

        assert_eq!(handle, EntryHandle::new(next_day, 0));
        assert_eq!(manager.current_period().unwrap().start(), next_day);
        assert!(!manager.period(DAY).unwrap().unwrap().is_current().unwrap());

        let (handles, status) = drain(
            &manager,
            SearchCriteria::new().since(next_day).until(next_day + MS_PER_MINUTE),
        );
        assert_eq!(handles, vec![handle]);
        assert_eq!(status, SearchStatus::Done);

        // The back-link crosses the day boundary
        let history = manager.platform_history(DcpAddress(1), 0, 10).unwrap();
        let got: Vec<EntryHandle> = history.iter().map(|m| m.handle).collect();
        assert_eq!(got, vec![handle, before]);
    }

    #[test]
    fn test_archive_msg_follows_opening_clock() {
        let dir = tempdir().unwrap();
        let next_day = DAY + MS_PER_DAY;
        let manager = open(dir.path(), next_day - 1);
        assert_eq!(manager.current_period().unwrap().start(), DAY);

        std::thread::sleep(Duration::from_millis(20));
        let handle = manager.archive_msg(msg(3, next_day + 10), DataSourceId(1)).unwrap();
        assert_eq!(handle.period_start, next_day);
        assert!(manager.now() >= next_day);
    }

    #[test]
    fn test_rollover_during_appends_loses_nothing() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(open(dir.path(), DAY));
        let next_day = DAY + MS_PER_DAY;

        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    (0..100u32)
                        .map(|i| {
                            let recv = DAY + 1000 * (i as i64 + 1);
                            manager.archive_msg(msg(t * 1000 + i, recv), DataSourceId(1))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(2));
        manager.rollover(next_day).unwrap();

        let mut handles = Vec::new();
        for writer in writers {
            for result in writer.join().unwrap() {
                handles.push(result.unwrap());
            }
        }
        assert_eq!(handles.len(), 400);
        handles.sort_by_key(|h| (h.period_start, h.entry_number));
        handles.dedup();
        assert_eq!(handles.len(), 400);

        let old = manager.period(DAY).unwrap().unwrap().num_entries().unwrap();
        let new = manager.period(next_day).unwrap().unwrap().num_entries().unwrap();
        assert_eq!(old + new, 400);
    }

    fn snapshot(dir: &std::path::Path) -> BTreeMap<String, Vec<u8>> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.file_name().to_string_lossy().into_owned(),
                    std::fs::read(e.path()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_read_only_open_changes_nothing() {
        let dir = tempdir().unwrap();
        let next_day = DAY + MS_PER_DAY;
        {
            let manager = open(dir.path(), DAY);
            for i in 0..3i64 {
                let recv = DAY + 10_000 * (i + 1);
                manager
                    .archive_msg(msg(7, recv).sequence(i as u32, recv), DataSourceId(1))
                    .unwrap();
            }
            manager.checkpoint(next_day + 1000).unwrap();
            manager
                .archive_msg_at(msg(7, next_day + 2000), DataSourceId(1), next_day + 2000)
                .unwrap();
        }
        // A missing minute file is rebuilt in memory only
        std::fs::remove_file(period_files(dir.path(), DAY).min_path()).unwrap();
        let before = snapshot(dir.path());

        let mut config = ArchiveConfig::new(dir.path());
        config.retention_days = 1;
        let manager = ArchiveManager::open_read_only(config).unwrap();
        assert!(manager.is_read_only());

        let starts: Vec<i64> = manager.periods().unwrap().iter().map(|p| p.start()).collect();
        assert_eq!(starts, vec![DAY, next_day]);
        let current = manager.current_period().unwrap();
        assert_eq!(current.start(), next_day);
        assert!(!current.is_current().unwrap());

        let (handles, status) = drain(
            &manager,
            SearchCriteria::new().since(DAY).until(next_day + MS_PER_MINUTE),
        );
        assert_eq!(handles.len(), 4);
        assert_eq!(status, SearchStatus::Done);
        assert_eq!(
            manager.last_message(DcpAddress(7)).unwrap().unwrap().handle,
            EntryHandle::new(next_day, 0)
        );
        assert_eq!(manager.platform_history(DcpAddress(7), 0, 10).unwrap().len(), 4);
        assert_eq!(manager.stats().unwrap().total_messages, 4);

        assert!(matches!(
            manager.archive_msg(msg(7, next_day + 3000), DataSourceId(1)),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(
            manager.delete_entry(EntryHandle::new(DAY, 0)),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(
            manager.attach_sequence(EntryHandle::new(next_day, 0), 9, next_day),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(manager.evict(), Err(StorageError::ReadOnly(_))));
        manager.checkpoint(next_day + 3 * MS_PER_DAY).unwrap();
        manager.shutdown().unwrap();
        drop(manager);

        assert_eq!(snapshot(dir.path()), before);
    }

    fn period_files(dir: &std::path::Path, start: i64) -> crate::archive::naming::PeriodFiles {
        crate::archive::naming::PeriodFiles::new(dir, ArchiveConfig::default().layout, start)
    }

    #[test]
    fn test_read_only_open_needs_a_period() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ArchiveManager::open_read_only(ArchiveConfig::new(dir.path())),
            Err(StorageError::ArchiveUnavailable(_))
        ));
        assert!(snapshot(dir.path()).is_empty());
    }

    #[test]
    fn test_empty_window_is_done() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        manager.archive_msg(msg(1, DAY + 1000), DataSourceId(1)).unwrap();

        let mut cursor = manager.open_search(SearchCriteria::new().since(DAY + 5000).until(DAY));
        let (batch, status) = manager.continue_search(&mut cursor, deadline()).unwrap();
        assert!(batch.is_empty());
        assert_eq!(status, SearchStatus::Done);
    }

    #[test]
    fn test_source_filter_and_delete() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        let a = manager.archive_msg(msg(1, DAY + 1000), DataSourceId(1)).unwrap();
        let b = manager.archive_msg(msg(2, DAY + 2000), DataSourceId(2)).unwrap();
        let c = manager.archive_msg(msg(3, DAY + 3000), DataSourceId(1)).unwrap();
        manager.delete_entry(c).unwrap();

        let (handles, _) = drain(
            &manager,
            SearchCriteria::new()
                .since(DAY)
                .until(DAY + MS_PER_MINUTE)
                .source(DataSourceId(1)),
        );
        assert_eq!(handles, vec![a]);
        assert_eq!(manager.get_message(b).unwrap().message.data_source_id, DataSourceId(2));
    }

    #[test]
    fn test_platform_history_follows_back_links() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        let mut own = Vec::new();
        for i in 0..6i64 {
            own.push(manager.archive_msg(msg(0xAA, DAY + 60_000 * i), DataSourceId(1)).unwrap());
            manager.archive_msg(msg(0xBB, DAY + 60_000 * i + 500), DataSourceId(1)).unwrap();
        }
        manager.delete_entry(own[4]).unwrap();

        let history = manager.platform_history(DcpAddress(0xAA), 0, 3).unwrap();
        let got: Vec<EntryHandle> = history.iter().map(|m| m.handle).collect();
        assert_eq!(got, vec![own[5], own[3], own[2]]);

        // `since` stops the walk
        let recent = manager
            .platform_history(DcpAddress(0xAA), DAY + 60_000 * 3 - 1000, 100)
            .unwrap();
        let got: Vec<EntryHandle> = recent.iter().map(|m| m.handle).collect();
        assert_eq!(got, vec![own[5], own[3]]);
    }

    #[test]
    fn test_outage_recovery_through_manager() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        let t = DAY + 3_600_000;
        for (i, seq) in (100u32..=110).enumerate() {
            let recv = t + i as i64 * 1000;
            manager
                .archive_msg(msg(seq, recv).sequence(seq, recv), DataSourceId(1))
                .unwrap();
        }

        let hits = manager
            .get_by_sequence_range(t + 5000, t + 5000, SequenceRange::new(102, 105))
            .unwrap();
        let seqs: Vec<Option<u32>> = hits.iter().map(|m| m.message.sequence_number()).collect();
        assert_eq!(seqs, vec![Some(102), Some(103), Some(104), Some(105)]);

        assert!(manager
            .get_by_sequence_range(t + 5000, t + 5000, SequenceRange::new(200, 210))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_attach_sequence_maps_late_number() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        let t = DAY + 7_200_000;
        let handle = manager.archive_msg(msg(5, t), DataSourceId(1)).unwrap();
        assert!(!manager.last_message(DcpAddress(5)).unwrap().unwrap().has_sequence());

        manager.attach_sequence(handle, 777, t + 200).unwrap();

        let stored = manager.get_message(handle).unwrap();
        assert_eq!(stored.message.sequence_number(), Some(777));
        assert!(manager.last_message(DcpAddress(5)).unwrap().unwrap().has_sequence());
        let hits = manager
            .get_by_sequence_range(t, t, SequenceRange::new(777, 777))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].handle, handle);
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = tempdir().unwrap();
        let t = DAY + 600_000;
        {
            let manager = open(dir.path(), DAY);
            manager
                .archive_msg(msg(9, t).sequence(55, t), DataSourceId(1))
                .unwrap();
            manager.archive_msg(msg(9, t + 1000), DataSourceId(1)).unwrap();
            manager.checkpoint(DAY + 700_000).unwrap();
        }

        let manager = open(dir.path(), DAY + 800_000);
        assert_eq!(manager.current_period().unwrap().num_entries().unwrap(), 2);
        assert_eq!(
            manager.last_message(DcpAddress(9)).unwrap().unwrap().handle,
            EntryHandle::new(DAY, 1)
        );
        assert_eq!(manager.outage_map_sizes().unwrap(), (0, 1));

        let next = manager.archive_msg(msg(9, t + 2000), DataSourceId(1)).unwrap();
        assert_eq!(next, EntryHandle::new(DAY, 2));
        let history = manager.platform_history(DcpAddress(9), 0, 10).unwrap();
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_eviction_beyond_retention() {
        let dir = tempdir().unwrap();
        let mut config = ArchiveConfig::new(dir.path());
        config.retention_days = 2;
        let manager = ArchiveManager::open_at(config, DAY).unwrap();
        manager.archive_msg(msg(1, DAY + 1000), DataSourceId(1)).unwrap();

        manager.checkpoint(DAY + MS_PER_DAY).unwrap();
        manager.checkpoint(DAY + 2 * MS_PER_DAY).unwrap();

        let starts: Vec<i64> = manager.periods().unwrap().iter().map(|p| p.start()).collect();
        assert_eq!(starts, vec![DAY + MS_PER_DAY, DAY + 2 * MS_PER_DAY]);
        assert!(!dir.path().join("archv-20240105.msg").exists());
        assert!(manager.last_message(DcpAddress(1)).unwrap().is_none());

        // A cursor positioned in the evicted day jumps forward
        let (handles, status) = drain(&manager, SearchCriteria::new().since(DAY).until(DAY + 3 * MS_PER_DAY));
        assert!(handles.is_empty());
        assert_eq!(status, SearchStatus::Done);
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path(), DAY);
        for i in 0..4 {
            manager.archive_msg(msg(i, DAY + 1000 * (i as i64 + 1)), DataSourceId(1)).unwrap();
        }
        let stats = manager.stats().unwrap();
        assert_eq!(stats.period_count, 1);
        assert_eq!(stats.total_messages, 4);
        assert_eq!(stats.newest_period, Some(DAY));
        assert_eq!(stats.oldest_source_time, Some(DAY + 1000 - 1000));
        assert!(stats.bytes_on_disk > 0);
        assert!(stats.to_string().contains("Messages: 4"));
    }
}
