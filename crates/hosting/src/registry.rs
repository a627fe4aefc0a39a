//! Supervision of external connector processes.
//!
//! The registry owns exactly one [`ProcessBridge`] per (tenant, connector)
//! key. It decides when to (re)create a bridge, throttles protocol-level
//! health probes, and runs the bounded auto-restart loop. Every state
//! transition is mirrored to the [`ProcessStatusSink`] collaborator; sink
//! failures are logged and never block the in-memory state machine.

use crate::bridge::ProcessBridge;
use crate::config::HostingConfig;
use crate::descriptor::{ConnectorDescriptor, ConnectorKey, ProcessStatus};
use crate::error::{HostingError, Result};
use crate::traits::{CredentialProvider, ProcessStatusSink, StatusUpdate};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RegistryEntry {
    descriptor: ConnectorDescriptor,
    bridge: Arc<ProcessBridge>,
    /// Last protocol probe time (throttle), not the last OS liveness check.
    last_probe: Mutex<Option<tokio::time::Instant>>,
    consecutive_failures: AtomicU32,
    restart_count: AtomicU32,
}

pub struct ProcessRegistry {
    config: HostingConfig,
    status_sink: Arc<dyn ProcessStatusSink>,
    credentials: Arc<dyn CredentialProvider>,
    entries: Mutex<HashMap<ConnectorKey, Arc<RegistryEntry>>>,
    /// Per-key spawn locks: two concurrent get-or-create calls for one key
    /// must never race two processes into existence.
    key_locks: Mutex<HashMap<ConnectorKey, Arc<AsyncMutex<()>>>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new(
        config: HostingConfig,
        status_sink: Arc<dyn ProcessStatusSink>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            status_sink,
            credentials,
            entries: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Return the healthy bridge for this key, building one if needed.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid command vector, `Unavailable` when the process
    /// cannot be spawned or initialized.
    pub async fn get_or_create(
        &self,
        descriptor: &ConnectorDescriptor,
    ) -> Result<Arc<ProcessBridge>> {
        let key = descriptor.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if let Some(entry) = self.entry(&key) {
            if self.entry_healthy(&entry).await {
                return Ok(Arc::clone(&entry.bridge));
            }
            tracing::warn!(key = %key, "existing bridge unhealthy, replacing");
            self.entries.lock().remove(&key);
            entry.bridge.shutdown().await;
        }

        self.start_entry(descriptor, 0).await
    }

    /// Current restart count for a key (0 when absent). Exposed for
    /// status surfaces.
    #[must_use]
    pub fn restart_count(&self, key: &ConnectorKey) -> u32 {
        self.entry(key)
            .map_or(0, |e| e.restart_count.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn contains(&self, key: &ConnectorKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Start the background supervision loop. Idempotent.
    pub fn spawn_supervisor(self: &Arc<Self>) {
        let mut slot = self.supervisor.lock();
        if slot.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        let ct = self.shutdown.clone();
        let interval = self.config.supervise_interval;
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so a freshly
            // started registry does not probe before anything exists.
            tick.tick().await;
            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    _ = tick.tick() => {}
                }
                registry.supervise_once().await;
            }
            tracing::debug!("supervision loop stopped");
        }));
    }

    /// One supervision pass: restart or retire every unhealthy entry.
    pub async fn supervise_once(&self) {
        let keys: Vec<ConnectorKey> = self.entries.lock().keys().cloned().collect();
        for key in keys {
            let Some(entry) = self.entry(&key) else {
                continue;
            };
            if self.entry_healthy(&entry).await {
                continue;
            }

            let lock = self.key_lock(&key);
            let _guard = lock.lock().await;
            // Re-check under the key lock: a concurrent get-or-create may
            // already have replaced the entry.
            let Some(current) = self.entry(&key) else {
                continue;
            };
            if !Arc::ptr_eq(&current, &entry) {
                continue;
            }

            let count = entry.restart_count.load(Ordering::Relaxed);
            if count >= self.config.restart_cap {
                tracing::error!(
                    key = %key,
                    restart_count = count,
                    "restart cap reached, retiring connector process"
                );
                self.entries.lock().remove(&key);
                entry.bridge.shutdown().await;
                self.persist(
                    status_for(&entry.descriptor, ProcessStatus::Error)
                        .with_error(format!("restart cap ({}) reached", self.config.restart_cap))
                        .with_restart_count(count),
                )
                .await;
                continue;
            }

            let next = count + 1;
            tracing::warn!(key = %key, attempt = next, "restarting unhealthy connector process");
            self.entries.lock().remove(&key);
            entry.bridge.shutdown().await;
            self.persist(
                status_for(&entry.descriptor, ProcessStatus::Restarting).with_restart_count(next),
            )
            .await;

            // The attempt counts even if it fails; start_entry persists the
            // error with the incremented count.
            if let Err(e) = self.start_entry(&entry.descriptor, next).await {
                tracing::error!(key = %key, attempt = next, error = %e, "restart failed");
            }
        }
    }

    /// Stop one key: shut its bridge down and record `stopped`.
    pub async fn terminate(&self, key: &ConnectorKey) {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let Some(entry) = self.entries.lock().remove(key) else {
            return;
        };
        entry.bridge.shutdown().await;
        self.persist(status_for(&entry.descriptor, ProcessStatus::Stopped)).await;
        tracing::info!(key = %key, "connector process stopped");
    }

    /// Clean shutdown for the whole registry. Stops the supervision loop
    /// first so it cannot race a restart against the teardown.
    pub async fn terminate_all(&self) {
        self.shutdown.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let keys: Vec<ConnectorKey> = self.entries.lock().keys().cloned().collect();
        for key in keys {
            self.terminate(&key).await;
        }
    }

    fn entry(&self, key: &ConnectorKey) -> Option<Arc<RegistryEntry>> {
        self.entries.lock().get(key).cloned()
    }

    fn key_lock(&self, key: &ConnectorKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.key_locks
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn start_entry(
        &self,
        descriptor: &ConnectorDescriptor,
        restart_count: u32,
    ) -> Result<Arc<ProcessBridge>> {
        let key = descriptor.key();

        if let Err(e) = descriptor.validate_command() {
            self.persist(
                status_for(descriptor, ProcessStatus::Error)
                    .with_error(e.to_string())
                    .with_restart_count(restart_count),
            )
            .await;
            return Err(e);
        }

        self.persist(
            status_for(descriptor, ProcessStatus::Starting).with_restart_count(restart_count),
        )
        .await;

        // Always a fresh credential: a restart after token rotation must not
        // reuse the old one.
        let credential = match self
            .credentials
            .get_credential(&descriptor.tenant_id, &descriptor.kind)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "credential lookup failed, spawning without token");
                None
            }
        };

        match ProcessBridge::spawn(descriptor, credential.as_ref(), &self.config).await {
            Ok(bridge) => {
                let bridge = Arc::new(bridge);
                let entry = Arc::new(RegistryEntry {
                    descriptor: descriptor.clone(),
                    bridge: Arc::clone(&bridge),
                    last_probe: Mutex::new(Some(tokio::time::Instant::now())),
                    consecutive_failures: AtomicU32::new(0),
                    restart_count: AtomicU32::new(restart_count),
                });
                self.entries.lock().insert(key.clone(), entry);
                self.persist(
                    status_for(descriptor, ProcessStatus::Running)
                        .with_pid(bridge.pid())
                        .with_restart_count(restart_count)
                        .with_checked_now(),
                )
                .await;
                Ok(bridge)
            }
            Err(e) => {
                self.persist(
                    status_for(descriptor, ProcessStatus::Error)
                        .with_error(e.to_string())
                        .with_restart_count(restart_count),
                )
                .await;
                Err(HostingError::Unavailable(format!(
                    "{key}: connector process failed to start: {e}"
                )))
            }
        }
    }

    /// Health determination: cheap OS liveness first, then a throttled
    /// protocol probe. A single probe failure does not mark the entry
    /// unhealthy; only `failure_threshold` consecutive ones do.
    async fn entry_healthy(&self, entry: &Arc<RegistryEntry>) -> bool {
        if !entry.bridge.is_alive().await {
            return false;
        }

        let due = {
            let last = entry.last_probe.lock();
            last.is_none_or(|t| t.elapsed() >= self.config.probe_interval)
        };
        if !due {
            return entry.consecutive_failures.load(Ordering::Relaxed)
                < self.config.failure_threshold;
        }
        *entry.last_probe.lock() = Some(tokio::time::Instant::now());

        let probed = self.probe(&entry.bridge).await;
        if probed {
            entry.consecutive_failures.store(0, Ordering::Relaxed);
            self.persist(
                status_for(&entry.descriptor, ProcessStatus::Running)
                    .with_pid(entry.bridge.pid())
                    .with_restart_count(entry.restart_count.load(Ordering::Relaxed))
                    .with_checked_now(),
            )
            .await;
            return true;
        }

        let failures = entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            key = %entry.bridge.key(),
            failures,
            threshold = self.config.failure_threshold,
            "health probe failed"
        );
        failures < self.config.failure_threshold
    }

    /// Lightweight protocol probe: `resources/list`, falling back to
    /// `tools/list` for servers that do not implement resources.
    async fn probe(&self, bridge: &ProcessBridge) -> bool {
        let timeout = self.config.probe_timeout;
        if bridge.request("resources/list", json!({}), timeout).await.is_ok() {
            return true;
        }
        bridge.request("tools/list", json!({}), timeout).await.is_ok()
    }

    async fn persist(&self, update: StatusUpdate) {
        if let Err(e) = self.status_sink.upsert_status(update).await {
            tracing::warn!(error = %e, "failed to persist process status");
        }
    }
}

fn status_for(descriptor: &ConnectorDescriptor, status: ProcessStatus) -> StatusUpdate {
    let mut update = StatusUpdate::new(&descriptor.tenant_id, &descriptor.connector_id, status);
    update.runtime = Some(descriptor.mode);
    update
}

impl StatusUpdate {
    #[must_use]
    fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    #[must_use]
    fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    fn with_restart_count(mut self, count: u32) -> Self {
        self.restart_count = Some(count);
        self
    }

    #[must_use]
    fn with_checked_now(mut self) -> Self {
        self.checked_at = Some(Utc::now());
        self
    }
}
