//! DCP Archive CLI
//!
//! Read-only inspection of an archive directory, safe next to a running
//! host:
//! - Show statistics
//! - Dump the index of one period
//! - Run a time-window search
//! - Look up messages by sequence number
//! - Walk one platform's history

use anyhow::{bail, Context};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dcp_archive::storage::types::{fmt_time, MS_PER_DAY};
use dcp_archive::{
    ArchiveManager, ArchivedMessage, Config, DataSourceId, DcpAddress, MessageClass,
    SearchCriteria, SearchStatus, SequenceRange,
};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "dcp-archive-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect a DCP message archive")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Archive directory, overriding the config
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show archive statistics
    Stats,

    /// Dump index entries of one period
    Dump {
        /// Day of the period (YYYY-MM-DD)
        day: String,
        /// First entry number
        #[arg(long, default_value = "0")]
        start: u32,
        /// Maximum entries to print
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,
    },

    /// Search by source time. Times accept "now", "yesterday", RFC 3339,
    /// YYYY-MM-DD or unix milliseconds.
    Search {
        #[arg(long)]
        since: String,
        #[arg(long, default_value = "now")]
        until: String,
        /// Data source ids to accept
        #[arg(long)]
        source: Vec<i32>,
        /// Message classes to accept (goes-st, goes-rd, iridium, netdcp, other)
        #[arg(long)]
        class: Vec<MessageClass>,
        /// Platform addresses to accept (hex)
        #[arg(long)]
        platform: Vec<DcpAddress>,
        /// Stop after this many messages
        #[arg(short = 'n', long, default_value = "1000")]
        limit: usize,
    },

    /// Find messages by sequence number around a time
    Outage {
        /// Approximate relay time of the first missing message
        from: String,
        /// Approximate relay time of the last missing message
        until: String,
        /// First sequence number
        first_seq: u32,
        /// Last sequence number (may be below first_seq when it wrapped)
        last_seq: u32,
    },

    /// Newest-first history of one platform
    History {
        platform: DcpAddress,
        #[arg(long, default_value = "7d")]
        last: String,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let json = cli.format == "json";
    let open = || open_archive(cli.config.as_deref(), cli.dir.as_ref());

    match cli.command {
        Commands::Stats => {
            let archive = open()?;
            let stats = archive.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("DCP Archive v{}", env!("CARGO_PKG_VERSION"));
                println!("Directory: {:?}", archive.config().dir);
                println!("{}", stats);
                println!();
                println!("{:<18} {:<12} {:>10} {:>12}", "Period", "Layout", "Messages", "Bytes");
                println!("{}", "-".repeat(56));
                let newest = archive.current_period()?.start();
                for p in archive.periods()? {
                    println!(
                        "{:<18} {:<12} {:>10} {:>12}{}",
                        p.name(),
                        p.files().layout,
                        p.num_entries()?,
                        p.files().size_on_disk(),
                        if p.start() == newest { "  (newest)" } else { "" }
                    );
                }
            }
        }

        Commands::Dump { day, start, limit } => {
            let period_start = parse_day(&day)?;
            let archive = open()?;
            let Some(period) = archive.period(period_start)? else {
                bail!("no period for {}", day);
            };
            let entries = period.read_entries(start, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!(
                    "{:>7} {:<9} {:<20} {:<20} {:>8} {:>5} {:<8} {:>10}",
                    "Entry", "Platform", "Source time", "Received", "Seq", "Src", "Class", "Offset"
                );
                println!("{}", "-".repeat(96));
                for e in entries {
                    println!(
                        "{:>7} {:<9} {:<20} {:<20} {:>8} {:>5} {:<8} {:>10}{}",
                        e.entry_number,
                        e.dcp_address,
                        fmt_time(e.source_time),
                        fmt_time(e.local_recv_time),
                        e.sequence_number()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        e.data_source_id,
                        e.message_class(),
                        e.record_offset,
                        if e.is_deleted() { "  deleted" } else { "" }
                    );
                }
            }
        }

        Commands::Search {
            since,
            until,
            source,
            class,
            platform,
            limit,
        } => {
            let mut criteria = SearchCriteria::new()
                .since(parse_time(&since)?)
                .until(parse_time(&until)?);
            criteria.sources = source.into_iter().map(DataSourceId).collect();
            criteria.classes = class;
            criteria.platforms = platform;

            let archive = open()?;
            let mut cursor = archive.open_search(criteria);
            let mut found = Vec::new();
            loop {
                let deadline = Instant::now() + std::time::Duration::from_secs(5);
                let (batch, status) = archive.continue_search(&mut cursor, deadline)?;
                found.extend(batch);
                if found.len() >= limit || matches!(status, SearchStatus::Done | SearchStatus::Pause) {
                    break;
                }
            }
            found.truncate(limit);
            print_messages(&found, json)?;
            if !json {
                println!(
                    "{} message(s), {} index entries examined",
                    found.len(),
                    cursor.entries_examined()
                );
            }
        }

        Commands::Outage {
            from,
            until,
            first_seq,
            last_seq,
        } => {
            let archive = open()?;
            let found = archive.get_by_sequence_range(
                parse_time(&from)?,
                parse_time(&until)?,
                SequenceRange::new(first_seq, last_seq),
            )?;
            print_messages(&found, json)?;
        }

        Commands::History {
            platform,
            last,
            limit,
        } => {
            let since = Utc::now() - parse_duration(&last)?;
            let archive = open()?;
            let found = archive.platform_history(platform, since.timestamp_millis(), limit)?;
            print_messages(&found, json)?;
        }

        Commands::Config { output } => {
            let config = dcp_archive::config::generate_default_config();
            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", config),
            }
        }
    }

    Ok(())
}

fn open_archive(config: Option<&Path>, dir: Option<&PathBuf>) -> anyhow::Result<ArchiveManager> {
    let config = Config::load_from(config)?;
    config.logging.init();
    let mut archive_config = config.to_archive_config();
    if let Some(dir) = dir {
        archive_config.dir = dir.clone();
    }
    if !archive_config.dir.exists() {
        bail!("archive directory {:?} does not exist", archive_config.dir);
    }
    let dir = archive_config.dir.clone();
    // Never open writable: a host may own the current period
    ArchiveManager::open_read_only(archive_config)
        .with_context(|| format!("cannot open archive in {:?}", dir))
}

fn print_messages(messages: &[ArchivedMessage], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        println!("No messages");
        return Ok(());
    }
    println!(
        "{:<22} {:<9} {:<20} {:>8} {:<8} {}",
        "Handle", "Platform", "Source time", "Seq", "Class", "Payload"
    );
    println!("{}", "-".repeat(90));
    for m in messages {
        let payload = String::from_utf8_lossy(&m.message.payload);
        let payload: String = payload.chars().take(40).collect();
        println!(
            "{:<22} {:<9} {:<20} {:>8} {:<8} {}",
            m.handle.to_string(),
            m.message.dcp_address,
            fmt_time(m.message.source_time),
            m.message
                .sequence_number()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            m.message.message_class(),
            payload.escape_debug()
        );
    }
    Ok(())
}

fn parse_day(s: &str) -> anyhow::Result<i64> {
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid day {:?}, expected YYYY-MM-DD", s))?;
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .with_context(|| format!("invalid day {:?}", s))
}

fn parse_time(s: &str) -> anyhow::Result<i64> {
    match s {
        "now" => Ok(Utc::now().timestamp_millis()),
        "yesterday" => Ok(Utc::now().timestamp_millis() - MS_PER_DAY),
        _ => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                Ok(dt.timestamp_millis())
            } else if let Ok(ms) = s.parse::<i64>() {
                Ok(ms)
            } else {
                parse_day(s).with_context(|| format!("invalid time {:?}", s))
            }
        }
    }
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(minutes) = s.strip_suffix("min") {
        Ok(Duration::minutes(minutes.parse()?))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::hours(hours.parse()?))
    } else if let Some(days) = s.strip_suffix('d') {
        Ok(Duration::days(days.parse()?))
    } else if let Some(weeks) = s.strip_suffix('w') {
        Ok(Duration::weeks(weeks.parse()?))
    } else {
        bail!("Invalid duration format: {}. Use: 30min, 6h, 7d, 2w", s)
    }
}
