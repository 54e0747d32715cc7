//! Best-effort background replication of local messages to a backup ledger.
//!
//! Entirely off the critical path: a slow or unreachable backup target only
//! delays the next scan, never a send or a read.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AppResult;
use crate::services::local_store::LocalMessageStore;
use crate::services::store::RemoteLedger;

const SCAN_BATCH: i64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: u32,
    pub failed_attempts: u32,
}

pub struct SyncCoordinator {
    local: Arc<LocalMessageStore>,
    backup: Option<Arc<dyn RemoteLedger>>,
    interval: Duration,
    max_attempts: u32,
}

impl SyncCoordinator {
    pub fn new(
        local: Arc<LocalMessageStore>,
        backup: Option<Arc<dyn RemoteLedger>>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            backup,
            interval: config.sync_interval,
            max_attempts: config.sync_max_attempts.max(1),
        })
    }

    /// One scan pass. Public so tests and a manual "sync now" action can
    /// drive it deterministically.
    pub async fn run_once(&self) -> AppResult<SyncReport> {
        let Some(backup) = &self.backup else {
            return Ok(SyncReport::default());
        };

        let mut report = SyncReport::default();
        let pending = self.local.pending_messages(SCAN_BATCH).await?;
        for message in pending {
            match backup.backup(&message).await {
                Ok(()) => {
                    if self.local.mark_synced(message.id).await? {
                        report.synced += 1;
                    }
                }
                Err(e) => {
                    warn!(message = %message.id, error = %e, "backup push failed");
                    self.local
                        .record_sync_failure(message.id, self.max_attempts)
                        .await?;
                    report.failed_attempts += 1;
                }
            }
        }
        if report != SyncReport::default() {
            debug!(synced = report.synced, failed = report.failed_attempts, "sync pass done");
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let coordinator = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.run_once().await {
                            warn!(error = %e, "sync pass errored");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        SyncHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}
