//! Outage Sequence Index - recover missed messages by sequence number
//!
//! Each day keeps a flat array of entries threaded into one singly linked
//! chain ordered by relay time, plus 1440 minute heads pointing at the
//! earliest entry of each minute. Insertion starts from the nearest minute
//! head at or before the new time and walks forward, so in-order arrival
//! costs O(1) and late arrivals walk at most a few links.
//!
//! Two days are kept (today and yesterday) so an outage that straddles
//! midnight can still be recovered.

use crate::storage::error::StorageResult;
use crate::storage::types::{
    day_start, fmt_time, EntryHandle, TimeRange, MINUTES_PER_DAY, MS_PER_DAY, MS_PER_MINUTE,
};
use std::sync::{Arc, Mutex, RwLock};

/// Default tolerance added to both ends of a query window
pub const DEFAULT_PADDING_MS: i64 = 15_000;

/// One sequence-numbered message in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutageEntry {
    /// Relay time of the message, unix ms
    pub relay_time: i64,
    pub sequence_num: u32,
    /// Where the message is archived
    pub handle: EntryHandle,
    next: Option<u32>,
}

/// Inclusive sequence range, possibly wrapping past `u32::MAX`-style
/// rollover (start > end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub start: u32,
    pub end: u32,
}

impl SequenceRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, seq: u32) -> bool {
        if self.start <= self.end {
            seq >= self.start && seq <= self.end
        } else {
            seq >= self.start || seq <= self.end
        }
    }
}

/// Sequence chain for one day
#[derive(Debug)]
pub struct DailySequenceMap {
    day_start: i64,
    entries: Vec<OutageEntry>,
    minute_heads: Vec<Option<u32>>,
    head: Option<u32>,
}

impl DailySequenceMap {
    pub fn new(day_start: i64) -> Self {
        Self {
            day_start,
            entries: Vec::new(),
            minute_heads: vec![None; MINUTES_PER_DAY],
            head: None,
        }
    }

    pub fn day_start(&self) -> i64 {
        self.day_start
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn covers(&self, time: i64) -> bool {
        TimeRange::day_of(self.day_start).contains(time)
    }

    fn minute_of(&self, time: i64) -> usize {
        ((time - self.day_start).clamp(0, MS_PER_DAY - 1) / MS_PER_MINUTE) as usize
    }

    fn time_of(&self, idx: u32) -> i64 {
        self.entries[idx as usize].relay_time
    }

    /// Latest chain position whose time is <= `time`, starting from the
    /// nearest earlier minute head
    fn predecessor(&self, time: i64) -> Option<u32> {
        let minute = self.minute_of(time);
        let mut cur = (0..=minute)
            .rev()
            .filter_map(|m| self.minute_heads[m])
            .find(|&idx| self.time_of(idx) <= time)?;

        while let Some(next) = self.entries[cur as usize].next {
            if self.time_of(next) > time {
                break;
            }
            cur = next;
        }
        Some(cur)
    }

    /// Insert a message into the time-ordered chain
    pub fn add(&mut self, relay_time: i64, sequence_num: u32, handle: EntryHandle) {
        let idx = self.entries.len() as u32;
        let mut entry = OutageEntry {
            relay_time,
            sequence_num,
            handle,
            next: None,
        };

        match self.predecessor(relay_time) {
            Some(prev) => {
                entry.next = self.entries[prev as usize].next;
                self.entries.push(entry);
                self.entries[prev as usize].next = Some(idx);
            }
            None => {
                entry.next = self.head;
                self.entries.push(entry);
                self.head = Some(idx);
            }
        }

        let minute = self.minute_of(relay_time);
        let replace = match self.minute_heads[minute] {
            Some(h) => self.time_of(h) > relay_time,
            None => true,
        };
        if replace {
            self.minute_heads[minute] = Some(idx);
        }
    }

    /// Entries in `window` whose sequence number is in `range`, in time order
    pub fn find(&self, window: TimeRange, range: SequenceRange) -> Vec<OutageEntry> {
        let mut found = Vec::new();
        let start_minute = self.minute_of(window.start);
        let mut cur = (0..=start_minute)
            .rev()
            .find_map(|m| self.minute_heads[m])
            .or(self.head);

        while let Some(idx) = cur {
            let e = &self.entries[idx as usize];
            if e.relay_time >= window.end {
                break;
            }
            if e.relay_time >= window.start && range.contains(e.sequence_num) {
                found.push(*e);
            }
            cur = e.next;
        }
        found
    }

    /// All entries in chain order
    pub fn iter(&self) -> impl Iterator<Item = &OutageEntry> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let idx = cur?;
            let e = &self.entries[idx as usize];
            cur = e.next;
            Some(e)
        })
    }
}

struct DayMaps {
    today: Arc<Mutex<DailySequenceMap>>,
    yesterday: Arc<Mutex<DailySequenceMap>>,
}

/// Today + yesterday sequence maps
pub struct OutageSequenceIndex {
    maps: RwLock<DayMaps>,
    padding_ms: i64,
}

impl OutageSequenceIndex {
    /// Create maps for the day containing `now` and the day before
    pub fn new(now: i64, padding_ms: i64) -> Self {
        let today = day_start(now);
        Self {
            maps: RwLock::new(DayMaps {
                today: Arc::new(Mutex::new(DailySequenceMap::new(today))),
                yesterday: Arc::new(Mutex::new(DailySequenceMap::new(today - MS_PER_DAY))),
            }),
            padding_ms,
        }
    }

    pub fn today_start(&self) -> StorageResult<i64> {
        Ok(self.maps.read()?.today.lock()?.day_start())
    }

    /// Map a sequence-numbered message. Returns false when its relay time
    /// falls outside both days.
    pub fn add(&self, relay_time: i64, sequence_num: u32, handle: EntryHandle) -> StorageResult<bool> {
        let map = {
            let maps = self.maps.read()?;
            if maps.today.lock()?.covers(relay_time) {
                Arc::clone(&maps.today)
            } else if maps.yesterday.lock()?.covers(relay_time) {
                Arc::clone(&maps.yesterday)
            } else {
                tracing::debug!(
                    "Relay time {} outside outage maps, seq {} not mapped",
                    fmt_time(relay_time),
                    sequence_num
                );
                return Ok(false);
            }
        };
        map.lock()?.add(relay_time, sequence_num, handle);
        Ok(true)
    }

    /// Advance to a new day. Today becomes yesterday when the days are
    /// adjacent; otherwise both maps start empty.
    pub fn rotate(&self, new_day_start: i64) -> StorageResult<()> {
        let mut maps = self.maps.write()?;
        let current = maps.today.lock()?.day_start();
        if new_day_start <= current {
            return Ok(());
        }

        tracing::info!("Rotating outage sequence maps to {}", fmt_time(new_day_start));
        let yesterday = if new_day_start - current == MS_PER_DAY {
            Arc::clone(&maps.today)
        } else {
            Arc::new(Mutex::new(DailySequenceMap::new(new_day_start - MS_PER_DAY)))
        };
        maps.yesterday = yesterday;
        maps.today = Arc::new(Mutex::new(DailySequenceMap::new(new_day_start)));
        Ok(())
    }

    /// Find archived messages with sequence numbers in `range` relayed
    /// between `from` and `until`, padded on both sides
    pub fn get_by_sequence_range(
        &self,
        from: i64,
        until: i64,
        range: SequenceRange,
    ) -> StorageResult<Vec<OutageEntry>> {
        let window = TimeRange {
            start: from.min(until),
            end: from.max(until) + 1,
        }
        .expand(self.padding_ms);

        let (yesterday, today) = {
            let maps = self.maps.read()?;
            (Arc::clone(&maps.yesterday), Arc::clone(&maps.today))
        };

        let mut found = Vec::new();
        for map in [yesterday, today] {
            let map = map.lock()?;
            if TimeRange::day_of(map.day_start()).overlaps(&window) {
                found.extend(map.find(window, range));
            }
        }
        Ok(found)
    }

    /// Number of mapped entries (yesterday, today)
    pub fn sizes(&self) -> StorageResult<(usize, usize)> {
        let maps = self.maps.read()?;
        let y = maps.yesterday.lock()?.len();
        let t = maps.today.lock()?.len();
        Ok((y, t))
    }
}
