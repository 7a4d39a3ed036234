//! DCP Archive host
//!
//! Opens the archive, runs periodic maintenance and reports statistics
//! until interrupted. Ingestion adapters and retrieval servers attach to
//! the same `ArchiveManager` through the library.

use anyhow::Context;
use dcp_archive::{ArchiveManager, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load_from(explicit.as_deref())?;
    config.logging.init();

    tracing::info!("DCP Archive v{}", env!("CARGO_PKG_VERSION"));

    let archive_config = config.to_archive_config();
    tracing::info!(
        "Archive directory: {:?}, retention {} days, layout {}",
        archive_config.dir,
        archive_config.retention_days,
        archive_config.layout
    );

    let dir = archive_config.dir.clone();
    let manager = tokio::task::spawn_blocking(move || ArchiveManager::open(archive_config))
        .await?
        .with_context(|| format!("cannot open archive in {:?}", dir))?;
    let manager = Arc::new(manager);

    let maintenance = manager.start_maintenance();
    tracing::info!("Archive stats: {}", manager.stats()?);

    let mut report = tokio::time::interval(Duration::from_secs(300));
    report.tick().await;
    loop {
        tokio::select! {
            _ = report.tick() => {
                match manager.stats() {
                    Ok(stats) => tracing::info!("Archive stats: {}", stats),
                    Err(e) => tracing::warn!("Cannot collect stats: {}", e),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("cannot listen for Ctrl-C")?;
                break;
            }
        }
    }

    tracing::info!("Shutting down...");
    let m = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || m.shutdown()).await??;
    maintenance.abort();

    tracing::info!("DCP Archive shutdown complete");
    Ok(())
}
