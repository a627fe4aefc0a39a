//! Sliding-TTL session tracking.
//!
//! A session pins one hosting context for a stateful client conversation.
//! Unlike the pool's fixed-origin TTL, session expiry slides: every lookup
//! refreshes the deadline, so a session dies only after a full idle gap.
//! Each (tenant, connector) key holds at most `session_cap_per_key` live
//! sessions; opening one past the cap evicts that key's least recently
//! used session.

use crate::config::HostingConfig;
use crate::context::HostingContext;
use crate::descriptor::ConnectorKey;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct SessionEntry {
    pub id: String,
    pub key: ConnectorKey,
    pub context: Arc<HostingContext>,
    pub protocol_version: Option<String>,
    created_at: Instant,
    last_access: Mutex<Instant>,
}

impl SessionEntry {
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_access.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

pub struct SessionManager {
    config: HostingConfig,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: HostingConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    /// Open a session against a context, evicting the key's LRU session
    /// first when the per-key cap is already full.
    pub fn create(
        &self,
        key: &ConnectorKey,
        context: Arc<HostingContext>,
        protocol_version: Option<String>,
    ) -> Arc<SessionEntry> {
        let now = Instant::now();
        let entry = Arc::new(SessionEntry {
            id: Uuid::new_v4().to_string(),
            key: key.clone(),
            context,
            protocol_version,
            created_at: now,
            last_access: Mutex::new(now),
        });

        let mut sessions = self.sessions.write();
        let live: Vec<&Arc<SessionEntry>> =
            sessions.values().filter(|s| s.key == *key).collect();
        if live.len() >= self.config.session_cap_per_key {
            // Eviction is scoped to the key; other connectors' sessions
            // are never candidates.
            let victim = live
                .iter()
                .min_by_key(|s| *s.last_access.lock())
                .map(|s| s.id.clone());
            if let Some(id) = victim {
                tracing::debug!(key = %key, session_id = %id, "evicting session at per-key cap");
                sessions.remove(&id);
            }
        }
        sessions.insert(entry.id.clone(), Arc::clone(&entry));
        tracing::debug!(key = %key, session_id = %entry.id, "session opened");
        entry
    }

    /// Look up a live session and slide its deadline. An expired session
    /// is removed on sight and reported as absent.
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        let entry = self.sessions.read().get(session_id).cloned()?;
        if entry.idle_for() >= self.config.session_ttl {
            self.sessions.write().remove(session_id);
            tracing::debug!(session_id, "session expired");
            return None;
        }
        entry.touch();
        Some(entry)
    }

    /// Close a session. Closing an unknown or already-closed id is a no-op.
    pub fn close(&self, session_id: &str) {
        if self.sessions.write().remove(session_id).is_some() {
            tracing::debug!(session_id, "session closed");
        }
    }

    /// Drop every session bound to a connector key. Used when the key's
    /// context is invalidated.
    pub fn close_for_key(&self, key: &ConnectorKey) {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.key != *key);
        let dropped = before - sessions.len();
        if dropped > 0 {
            tracing::debug!(key = %key, dropped, "sessions closed with context");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Start the background idle sweep. Idempotent.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock();
        if slot.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let ct = self.shutdown.clone();
        let interval = self.config.session_reap_interval;
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    _ = tick.tick() => {}
                }
                manager.reap_idle();
            }
        }));
    }

    pub fn reap_idle(&self) {
        let ttl = self.config.session_ttl;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.idle_for() < ttl);
        let dropped = before - sessions.len();
        if dropped > 0 {
            tracing::debug!(dropped, "idle sessions reaped");
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let reaper = self.reaper.lock().take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }
        self.sessions.write().clear();
    }
}
