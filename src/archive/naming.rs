//! Period file naming
//!
//! Every period is three files sharing one stem, `<prefix>YYYYMMDD`:
//! `.msg` (RecordStore), `.idx` (IndexStore) and `.min` (MinuteIndex).
//! The prefix names the record layout so a reader never has to guess:
//!
//! | prefix   | layout     |
//! |----------|------------|
//! | `arc-`   | legacy     |
//! | `arch-`  | extended   |
//! | `archv-` | structured |

use crate::storage::error::StorageResult;
use crate::storage::layout::RecordLayout;
use crate::storage::types::{fmt_time, MS_PER_DAY};
use chrono::{NaiveDate, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MSG_EXT: &str = "msg";
pub const IDX_EXT: &str = "idx";
pub const MIN_EXT: &str = "min";

/// File name prefix for a layout
pub fn layout_prefix(layout: RecordLayout) -> &'static str {
    match layout {
        RecordLayout::Legacy => "arc-",
        RecordLayout::Extended => "arch-",
        RecordLayout::Structured => "archv-",
    }
}

/// Paths of the three files of one period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodFiles {
    pub period_start: i64,
    pub layout: RecordLayout,
    stem: PathBuf,
}

impl PeriodFiles {
    pub fn new(dir: &Path, layout: RecordLayout, period_start: i64) -> Self {
        let day = Utc
            .timestamp_millis_opt(period_start)
            .single()
            .map(|dt| dt.format("%Y%m%d").to_string())
            .unwrap_or_else(|| format!("{}", period_start / MS_PER_DAY));
        Self {
            period_start,
            layout,
            stem: dir.join(format!("{}{}", layout_prefix(layout), day)),
        }
    }

    fn with_ext(&self, ext: &str) -> PathBuf {
        self.stem.with_extension(ext)
    }

    pub fn msg_path(&self) -> PathBuf {
        self.with_ext(MSG_EXT)
    }

    pub fn idx_path(&self) -> PathBuf {
        self.with_ext(IDX_EXT)
    }

    pub fn min_path(&self) -> PathBuf {
        self.with_ext(MIN_EXT)
    }

    /// Base name, e.g. `archv-20240105`
    pub fn name(&self) -> String {
        self.stem
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.msg_path().exists() && self.idx_path().exists()
    }

    /// Bytes used by all three files
    pub fn size_on_disk(&self) -> u64 {
        [self.msg_path(), self.idx_path(), self.min_path()]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Remove all three files, ignoring ones already gone
    pub fn delete(&self) -> StorageResult<()> {
        for path in [self.msg_path(), self.idx_path(), self.min_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Parse a message file name into its layout and period start
pub fn parse_msg_file_name(name: &str) -> Option<(RecordLayout, i64)> {
    let stem = name.strip_suffix(".msg")?;

    let (layout, date) = [
        RecordLayout::Structured,
        RecordLayout::Extended,
        RecordLayout::Legacy,
    ]
    .into_iter()
    .find_map(|layout| {
        stem.strip_prefix(layout_prefix(layout))
            .map(|rest| (layout, rest))
    })?;

    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let start = day.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    Some((layout, start))
}

/// Find all periods in `dir`, oldest first
///
/// Names that do not parse are skipped. When two layouts exist for the
/// same day the first one found wins and the other is reported.
pub fn scan_dir(dir: &Path) -> StorageResult<Vec<PeriodFiles>> {
    let mut found: BTreeMap<i64, PeriodFiles> = BTreeMap::new();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.ends_with(".msg"))
        .collect();
    names.sort();

    for name in names {
        let Some((layout, start)) = parse_msg_file_name(&name) else {
            tracing::debug!("Ignoring unrecognized file {:?} in archive dir", name);
            continue;
        };
        let files = PeriodFiles::new(dir, layout, start);
        if !files.idx_path().exists() {
            tracing::warn!("Period {} has no index file, skipping", files.name());
            continue;
        }
        if let Some(existing) = found.get(&start) {
            tracing::warn!(
                "Duplicate period for {}: keeping {}, ignoring {}",
                fmt_time(start),
                existing.name(),
                files.name()
            );
            continue;
        }
        found.insert(start, files);
    }

    Ok(found.into_values().collect())
}
