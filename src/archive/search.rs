//! Search criteria and the resumable search cursor
//!
//! A search never blocks indefinitely. Each `continue_search` call is given
//! a deadline and returns a bounded batch together with a [`SearchStatus`]
//! telling the caller what to do next. All scan state lives in the
//! [`SearchCursor`], which only ever moves forward.

use crate::storage::types::{DataSourceId, DcpAddress, IndexEntry, MessageClass, TimeRange};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default number of messages returned per call
pub const DEFAULT_MAX_BATCH: usize = 100;

/// Outcome of one `continue_search` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    /// More results may be available immediately
    More,
    /// Caught up with real-time data; retry after a short wait
    Pause,
    /// The deadline passed; call again to resume
    TimeLimit,
    /// The search window is exhausted
    Done,
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStatus::More => write!(f, "MORE"),
            SearchStatus::Pause => write!(f, "PAUSE"),
            SearchStatus::TimeLimit => write!(f, "TIMELIMIT"),
            SearchStatus::Done => write!(f, "DONE"),
        }
    }
}

/// What a search should return
///
/// `since`/`until` bound the source time as a half-open window
/// `[since, until)`. Empty filter lists accept everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Lower bound; `None` starts at the oldest retained period
    pub since: Option<i64>,
    /// Upper bound; `None` makes this a real-time search
    pub until: Option<i64>,
    /// Withhold very recent entries of a real-time search
    pub settling_delay: bool,
    pub sources: Vec<DataSourceId>,
    pub classes: Vec<MessageClass>,
    pub platforms: Vec<DcpAddress>,
    /// Messages returned per call
    pub max_batch: usize,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            settling_delay: false,
            sources: Vec::new(),
            classes: Vec::new(),
            platforms: Vec::new(),
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Historical search over a closed window
    pub fn between(range: TimeRange) -> Self {
        Self {
            since: Some(range.start),
            until: Some(range.end),
            ..Self::default()
        }
    }

    /// Builder method: set lower bound
    pub fn since(mut self, ms: i64) -> Self {
        self.since = Some(ms);
        self
    }

    /// Builder method: set upper bound
    pub fn until(mut self, ms: i64) -> Self {
        self.until = Some(ms);
        self
    }

    /// Builder method: enable or disable the real-time settling delay
    pub fn settling_delay(mut self, enabled: bool) -> Self {
        self.settling_delay = enabled;
        self
    }

    /// Builder method: accept a data source
    pub fn source(mut self, id: DataSourceId) -> Self {
        self.sources.push(id);
        self
    }

    /// Builder method: accept a message class
    pub fn class(mut self, class: MessageClass) -> Self {
        self.classes.push(class);
        self
    }

    /// Builder method: accept a platform
    pub fn platform(mut self, addr: DcpAddress) -> Self {
        self.platforms.push(addr);
        self
    }

    /// Builder method: set batch size
    pub fn max_batch(mut self, n: usize) -> Self {
        self.max_batch = n.max(1);
        self
    }

    pub fn is_real_time(&self) -> bool {
        self.until.is_none()
    }

    /// True when the window cannot contain anything (until <= since)
    pub fn is_empty_window(&self) -> bool {
        matches!((self.since, self.until), (Some(s), Some(u)) if u <= s)
    }

    /// Full criteria predicate, evaluated before any record is read
    pub fn passes(&self, entry: &IndexEntry) -> bool {
        if let Some(since) = self.since {
            if entry.source_time < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.source_time >= until {
                return false;
            }
        }
        if !self.sources.is_empty() && !self.sources.contains(&entry.data_source_id) {
            return false;
        }
        if !self.classes.is_empty() && !self.classes.contains(&entry.message_class()) {
            return false;
        }
        if !self.platforms.is_empty() && !self.platforms.contains(&entry.dcp_address) {
            return false;
        }
        true
    }
}

/// Resumable scan state
///
/// Owned by the caller between calls. A cursor holds no locks and no
/// period references, so dropping it is all the cleanup there is.
#[derive(Debug, Clone)]
pub struct SearchCursor {
    id: Uuid,
    criteria: SearchCriteria,
    /// Period being scanned; `None` until the first call positions it
    pub(crate) period_start: Option<i64>,
    /// Whether `minute`/`next_entry` are valid for `period_start`
    pub(crate) positioned: bool,
    pub(crate) minute: usize,
    pub(crate) next_entry: u32,
    pub(crate) entries_examined: u64,
    pub(crate) returned: u64,
}

impl SearchCursor {
    pub fn new(criteria: SearchCriteria) -> Self {
        Self {
            id: Uuid::new_v4(),
            criteria,
            period_start: None,
            positioned: false,
            minute: 0,
            next_entry: 0,
            entries_examined: 0,
            returned: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn criteria(&self) -> &SearchCriteria {
        &self.criteria
    }

    /// Day-start of the period the cursor is in
    pub fn period_start(&self) -> Option<i64> {
        self.period_start
    }

    /// Next entry number to examine in the current period
    pub fn next_entry(&self) -> u32 {
        self.next_entry
    }

    pub fn minute(&self) -> usize {
        self.minute
    }

    /// Index entries examined so far (including ones filtered out)
    pub fn entries_examined(&self) -> u64 {
        self.entries_examined
    }

    /// Messages returned so far
    pub fn returned(&self) -> u64 {
        self.returned
    }

    /// Move to the start of another period
    pub(crate) fn enter_period(&mut self, period_start: i64) {
        self.period_start = Some(period_start);
        self.positioned = false;
        self.minute = 0;
        self.next_entry = 0;
    }
}
