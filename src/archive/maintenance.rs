//! Periodic maintenance task

use crate::archive::manager::ArchiveManager;
use crate::storage::error::StorageResult;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

impl ArchiveManager {
    /// Spawn the maintenance loop: checkpoint, rollover and eviction every
    /// `checkpoint_interval_secs` until [`ArchiveManager::shutdown`]
    pub fn start_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_secs(manager.config().checkpoint_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if manager.is_shut_down() {
                    break;
                }

                let m = Arc::clone(&manager);
                let result = tokio::task::spawn_blocking(move || m.checkpoint(m.now())).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("Maintenance pass failed: {}", e),
                    Err(e) => tracing::error!("Maintenance task panicked: {}", e),
                }
            }
            tracing::debug!("Maintenance loop stopped");
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop maintenance, checkpoint everything and finalize the current
    /// period. Appends fail afterwards.
    pub fn shutdown(&self) -> StorageResult<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Shutting down archive");

        let now = self.now();
        for period in self.periods()? {
            if let Err(e) = period.checkpoint(now) {
                tracing::warn!("Final checkpoint of {} failed: {}", period.name(), e);
            }
        }
        self.persist_last_messages()?;
        self.current_period()?.finish()
    }
}
