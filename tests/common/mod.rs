#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use guild_chat_core::config::Config;
use guild_chat_core::services::store::InMemoryRemoteLedger;
use guild_chat_core::services::store::RemoteLedger;
use guild_chat_core::state::{AppState, BackgroundTasks};
use uuid::Uuid;

/// Fast config for tests: in-memory device database, short timers.
pub fn test_config() -> Config {
    Config {
        device_db_url: "sqlite::memory:".into(),
        device_fingerprint: "test-device".into(),
        sync_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

pub struct Harness {
    pub state: AppState,
    pub tasks: BackgroundTasks,
    pub ledger: InMemoryRemoteLedger,
}

/// Full stack wired against one shared in-memory ledger, with the
/// background sync loop parked (tests drive syncing explicitly).
pub async fn harness() -> Harness {
    let h = harness_with_config(test_config()).await;
    h.tasks.sync.stop();
    h
}

/// Same stack with the sync loop left running on its configured interval.
pub async fn running_harness() -> Harness {
    harness_with_config(test_config()).await
}

pub async fn harness_with_config(config: Config) -> Harness {
    let ledger = InMemoryRemoteLedger::new();
    let shared: Arc<dyn RemoteLedger> = Arc::new(ledger.clone());
    let (state, tasks) = AppState::build_with_ledger(config, shared.clone(), Some(shared))
        .await
        .expect("state should build");
    Harness {
        state,
        tasks,
        ledger,
    }
}

pub fn user() -> Uuid {
    Uuid::new_v4()
}
