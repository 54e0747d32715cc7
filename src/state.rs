//! Wiring: connects the database, builds every service and starts the
//! background workers.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::error::AppResult;
use crate::events::MessageEventBus;
use crate::services::audit_trail::{spawn_audit_worker, AuditSink, DisputeAuditTrail};
use crate::services::cloud_store::CloudMessageStore;
use crate::services::local_store::LocalMessageStore;
use crate::services::presence::PresenceTracker;
use crate::services::router::StorageRouter;
use crate::services::store::{InMemoryRemoteLedger, RemoteLedger};
use crate::services::sync::{SyncCoordinator, SyncHandle};

/// Shared handles to every service. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: SqlitePool,
    pub local: Arc<LocalMessageStore>,
    pub cloud: Arc<CloudMessageStore>,
    pub router: Arc<StorageRouter>,
    pub presence: Arc<PresenceTracker>,
    pub audit: Arc<DisputeAuditTrail>,
    pub audit_sink: AuditSink,
    pub events: MessageEventBus,
}

/// Handles to the long-running tasks, kept so a shutdown can stop them.
pub struct BackgroundTasks {
    pub sync: SyncHandle,
    pub audit_worker: JoinHandle<()>,
}

impl AppState {
    /// Builds the full stack against an in-memory remote ledger. The same
    /// ledger doubles as the backup target so personal messages replicate
    /// to it in the background.
    pub async fn build(config: Config) -> AppResult<(Self, BackgroundTasks)> {
        let ledger: Arc<dyn RemoteLedger> = Arc::new(InMemoryRemoteLedger::new());
        Self::build_with_ledger(config, ledger.clone(), Some(ledger)).await
    }

    /// Builds the full stack against caller-supplied remote endpoints.
    /// `backup` may be `None` to disable background replication.
    pub async fn build_with_ledger(
        config: Config,
        ledger: Arc<dyn RemoteLedger>,
        backup: Option<Arc<dyn RemoteLedger>>,
    ) -> AppResult<(Self, BackgroundTasks)> {
        let pool = db::connect(&config.device_db_url).await?;
        db::bootstrap(&pool).await?;

        let local = LocalMessageStore::new(pool.clone(), config.read_page_cap);
        let cloud = CloudMessageStore::new(ledger, config.read_page_cap);
        let audit = DisputeAuditTrail::new(pool.clone(), config.device_fingerprint.clone());
        let (audit_sink, audit_worker) = spawn_audit_worker(audit.clone(), config.send_retry.clone());
        let events = MessageEventBus::new();
        let router = StorageRouter::new(
            local.clone(),
            cloud.clone(),
            audit_sink.clone(),
            events.clone(),
            config.send_retry.clone(),
        );
        let presence = PresenceTracker::new(&config);
        let sync = SyncCoordinator::new(local.clone(), backup, &config).spawn();

        info!(
            device = %config.device_fingerprint,
            db = %config.device_db_url,
            "message core started"
        );

        Ok((
            Self {
                config,
                db: pool,
                local,
                cloud,
                router,
                presence,
                audit,
                audit_sink,
                events,
            },
            BackgroundTasks {
                sync,
                audit_worker,
            },
        ))
    }
}
