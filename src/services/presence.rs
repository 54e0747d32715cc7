//! Online/offline presence and ephemeral typing indicators.
//!
//! Both maps are purely in-memory: presence is reconstructed from heartbeats
//! after a restart and typing state is worthless after its TTL anyway, so
//! nothing here touches the database. Subscribers receive updates over
//! unbounded channels and are pruned lazily when a send fails.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::events::SubscriptionId;
use crate::models::{ConversationId, PresenceRecord, PresenceStatus, TypingState};

type TypingKey = (ConversationId, Uuid);

struct PresenceSub {
    id: SubscriptionId,
    users: HashSet<Uuid>,
    tx: UnboundedSender<PresenceRecord>,
}

struct TypingSub {
    id: SubscriptionId,
    conversation_id: ConversationId,
    tx: UnboundedSender<Vec<Uuid>>,
}

/// Tracks who is online and who is typing in which conversation.
///
/// Typing freshness is enforced twice: readers filter by TTL on every
/// lookup, and (optionally) a writer-side timer clears the state shortly
/// after the TTL so subscribers get an explicit "stopped" broadcast even
/// when the typist's client goes silent. The reader-side check alone is
/// sufficient for correctness; the timer only improves broadcast latency.
pub struct PresenceTracker {
    presence: RwLock<HashMap<Uuid, PresenceRecord>>,
    typing: RwLock<HashMap<TypingKey, TypingState>>,
    // Std mutex: held only for map surgery, never across an await.
    timers: StdMutex<HashMap<TypingKey, JoinHandle<()>>>,
    presence_subs: RwLock<Vec<PresenceSub>>,
    typing_subs: RwLock<Vec<TypingSub>>,
    ttl: Duration,
    writer_timer: bool,
}

impl PresenceTracker {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            presence: RwLock::new(HashMap::new()),
            typing: RwLock::new(HashMap::new()),
            timers: StdMutex::new(HashMap::new()),
            presence_subs: RwLock::new(Vec::new()),
            typing_subs: RwLock::new(Vec::new()),
            ttl: config.typing_ttl,
            writer_timer: config.typing_writer_timer,
        })
    }

    /// Marks the user online. Subscribers are notified only when the status
    /// actually changes; a heartbeat from an already-online user just
    /// refreshes `last_seen_at`.
    pub async fn connect(&self, user_id: Uuid) {
        self.update_status(user_id, PresenceStatus::Online).await;
    }

    /// Same transition rules as [`connect`](Self::connect): clients send
    /// these periodically and we only broadcast the offline-to-online edge.
    pub async fn heartbeat(&self, user_id: Uuid) {
        self.update_status(user_id, PresenceStatus::Online).await;
    }

    pub async fn set_away(&self, user_id: Uuid) {
        self.update_status(user_id, PresenceStatus::Away).await;
    }

    /// Marks the user offline and clears any typing indicators they left
    /// behind, so a dropped connection never shows a ghost typist.
    pub async fn disconnect(&self, user_id: Uuid) {
        self.update_status(user_id, PresenceStatus::Offline).await;

        let stale: Vec<TypingKey> = {
            let guard = self.typing.read().await;
            guard
                .keys()
                .filter(|(_, uid)| *uid == user_id)
                .copied()
                .collect()
        };
        for (conversation_id, uid) in stale {
            self.clear_typing(conversation_id, uid).await;
        }
    }

    async fn update_status(&self, user_id: Uuid, status: PresenceStatus) {
        let record = PresenceRecord {
            user_id,
            status,
            last_seen_at: Utc::now(),
        };
        let changed = {
            let mut guard = self.presence.write().await;
            let previous = guard.insert(user_id, record.clone());
            previous.map(|p| p.status != status).unwrap_or(true)
        };
        if changed {
            debug!(%user_id, ?status, "presence transition");
            self.broadcast_presence(&record).await;
        }
    }

    /// Current presence for a user, degrading to offline for users that
    /// have never connected.
    pub async fn presence(&self, user_id: Uuid) -> PresenceRecord {
        self.presence
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| PresenceRecord::offline(user_id))
    }

    /// Subscribes to presence transitions for a set of users. The current
    /// record of every watched user is delivered immediately so the caller
    /// never starts from a blank screen.
    pub async fn subscribe(
        &self,
        users: Vec<Uuid>,
    ) -> (SubscriptionId, UnboundedReceiver<PresenceRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let guard = self.presence.read().await;
            for user_id in &users {
                let record = guard
                    .get(user_id)
                    .cloned()
                    .unwrap_or_else(|| PresenceRecord::offline(*user_id));
                let _ = tx.send(record);
            }
        }
        let id = SubscriptionId::new();
        self.presence_subs.write().await.push(PresenceSub {
            id,
            users: users.into_iter().collect(),
            tx,
        });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.presence_subs.write().await.retain(|sub| sub.id != id);
    }

    async fn broadcast_presence(&self, record: &PresenceRecord) {
        let mut subs = self.presence_subs.write().await;
        subs.retain(|sub| {
            if sub.users.contains(&record.user_id) {
                sub.tx.send(record.clone()).is_ok()
            } else {
                true
            }
        });
    }

    /// Records that a user started (or kept) typing and broadcasts the
    /// conversation's fresh typist list. Re-calling within the TTL restarts
    /// the clock, which is how clients keep the indicator alive.
    pub async fn start_typing(self: &Arc<Self>, conversation_id: ConversationId, user_id: Uuid) {
        let key = (conversation_id, user_id);
        {
            let mut guard = self.typing.write().await;
            // Stale entries are invisible to readers already; reclaim them
            // here so the map does not grow with dead typists.
            guard.retain(|_, state| state.is_fresh(self.ttl));
            guard.insert(key, TypingState::started(conversation_id, user_id));
        }
        self.broadcast_typing(conversation_id).await;

        if self.writer_timer {
            let weak = Arc::downgrade(self);
            let ttl = self.ttl;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(tracker) = weak.upgrade() {
                    tracker.expire_typing(conversation_id, user_id).await;
                }
            });
            let mut timers = self.lock_timers();
            if let Some(old) = timers.insert(key, handle) {
                old.abort();
            }
        }
    }

    /// Explicit stop from the client. Idempotent.
    pub async fn stop_typing(&self, conversation_id: ConversationId, user_id: Uuid) {
        self.clear_typing(conversation_id, user_id).await;
    }

    async fn clear_typing(&self, conversation_id: ConversationId, user_id: Uuid) {
        let key = (conversation_id, user_id);
        if let Some(handle) = self.lock_timers().remove(&key) {
            handle.abort();
        }
        let removed = self.typing.write().await.remove(&key).is_some();
        if removed {
            self.broadcast_typing(conversation_id).await;
        }
    }

    /// Timer-driven clear. The timer detaches its own handle before touching
    /// state so the user-driven path never aborts a task mid-broadcast.
    async fn expire_typing(&self, conversation_id: ConversationId, user_id: Uuid) {
        self.lock_timers().remove(&(conversation_id, user_id));
        let removed = self
            .typing
            .write()
            .await
            .remove(&(conversation_id, user_id))
            .is_some();
        if removed {
            debug!(%conversation_id, %user_id, "typing indicator expired");
            self.broadcast_typing(conversation_id).await;
        }
    }

    /// Users currently typing in a conversation, TTL-filtered and sorted
    /// for deterministic output.
    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<Uuid> {
        let guard = self.typing.read().await;
        let mut users: Vec<Uuid> = guard
            .values()
            .filter(|state| state.conversation_id == conversation_id && state.is_fresh(self.ttl))
            .map(|state| state.user_id)
            .collect();
        users.sort();
        users
    }

    /// Subscribes to typist-list changes for one conversation, starting
    /// with the current list.
    pub async fn subscribe_typing(
        &self,
        conversation_id: ConversationId,
    ) -> (SubscriptionId, UnboundedReceiver<Vec<Uuid>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(self.typing_users(conversation_id).await);
        let id = SubscriptionId::new();
        self.typing_subs.write().await.push(TypingSub {
            id,
            conversation_id,
            tx,
        });
        (id, rx)
    }

    pub async fn unsubscribe_typing(&self, id: SubscriptionId) {
        self.typing_subs.write().await.retain(|sub| sub.id != id);
    }

    async fn broadcast_typing(&self, conversation_id: ConversationId) {
        let users = self.typing_users(conversation_id).await;
        let mut subs = self.typing_subs.write().await;
        subs.retain(|sub| {
            if sub.conversation_id == conversation_id {
                sub.tx.send(users.clone()).is_ok()
            } else {
                true
            }
        });
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<TypingKey, JoinHandle<()>>> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        for (_, handle) in self.lock_timers().drain() {
            handle.abort();
        }
    }
}
