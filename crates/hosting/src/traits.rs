//! Collaborator seams between the hosting core and the rest of the system.
//!
//! The core consumes configuration, credentials, status persistence and
//! tool-enablement through these traits and tolerates their absence or
//! failure; concrete implementations live at the composition root.

use crate::descriptor::{ConnectorDescriptor, ExecutionMode, ProcessStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A tool exposed by a connector.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A resource exposed by a connector.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A pluggable connector backend: native in-process code, or the external
/// process adapter in [`crate::external`].
#[async_trait]
pub trait ConnectorPlugin: Send + Sync {
    fn kind(&self) -> &str;

    /// External plugins run behind a process bridge; this affects resource
    /// URI routing (external servers may define their own URI schemes).
    fn is_external(&self) -> bool {
        false
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Execute a tool and return its result value. `bearer` is the per-call
    /// end-user token, if any.
    async fn call_tool(&self, name: &str, arguments: Value, bearer: Option<&str>)
        -> Result<Value>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>>;

    async fn read_resource(&self, uri: &str) -> Result<String>;
}

/// OAuth credential attached to a (tenant, provider) pair.
#[derive(Debug, Clone)]
pub struct Credential {
    pub bearer_token: String,
    pub active: bool,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch the stored credential for a tenant + provider kind, if any.
    async fn get_credential(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> anyhow::Result<Option<Credential>>;
}

/// Resolves connector kinds to plugin instances.
#[async_trait]
pub trait PluginResolver: Send + Sync {
    /// Look up a native plugin by kind.
    async fn resolve(&self, kind: &str) -> Option<Arc<dyn ConnectorPlugin>>;

    /// Resolve a descriptor to a plugin: a native plugin for
    /// [`ExecutionMode::Native`], or a process-registry-backed adapter for
    /// external modes.
    async fn resolve_for_descriptor(
        &self,
        descriptor: &ConnectorDescriptor,
    ) -> Result<Arc<dyn ConnectorPlugin>>;
}

/// One persisted supervision-state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub tenant_id: String,
    pub connector_id: String,
    pub status: ProcessStatus,
    /// Only present while the process is running; cleared otherwise so stale
    /// success metadata never survives a failed restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ExecutionMode>,
    /// Last successful health check; cleared whenever status is not running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    #[must_use]
    pub fn new(tenant_id: &str, connector_id: &str, status: ProcessStatus) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            connector_id: connector_id.to_string(),
            status,
            pid: None,
            error: None,
            restart_count: None,
            runtime: None,
            checked_at: None,
        }
    }
}

/// Persistence for process supervision state. Called on every registry
/// transition; a failing sink is logged, never allowed to block the
/// in-memory state machine.
#[async_trait]
pub trait ProcessStatusSink: Send + Sync {
    async fn upsert_status(&self, update: StatusUpdate) -> anyhow::Result<()>;
}

/// Per-connector tool-enablement flags. Tools absent from the map default to
/// enabled.
#[async_trait]
pub trait ToolEnablementSource: Send + Sync {
    async fn get_enabled_map(
        &self,
        tenant_id: &str,
        connector_id: &str,
    ) -> anyhow::Result<HashMap<String, bool>>;
}

/// Source of connector configuration records.
#[async_trait]
pub trait ConnectorConfigSource: Send + Sync {
    /// All connector instances attached to a hosting context key. Usually a
    /// single descriptor; aggregated contexts may return several.
    async fn get_attached(
        &self,
        tenant_id: &str,
        connector_id: &str,
    ) -> anyhow::Result<Vec<ConnectorDescriptor>>;
}

/// Builds a fully initialized hosting context for a (tenant, connector) key.
/// The server pool calls this on cache misses.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn build(
        &self,
        tenant_id: &str,
        connector_id: &str,
    ) -> Result<Arc<crate::context::HostingContext>>;
}
