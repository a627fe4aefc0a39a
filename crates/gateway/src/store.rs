//! Config-file-backed implementations of the hosting collaborator traits.
//!
//! The gateway runs from a static YAML document, so configuration,
//! credentials, and tool enablement all read from the parsed config;
//! process supervision status lives in an in-memory map served by the
//! HTTP status route.

use crate::config::GatewayConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use sagemcp_hosting::{
    ConnectorConfigSource, ConnectorDescriptor, ConnectorKey, Credential, CredentialProvider,
    ProcessStatusSink, StatusUpdate, ToolEnablementSource,
};
use std::collections::HashMap;

pub struct ConfigStore {
    config: GatewayConfig,
    statuses: RwLock<HashMap<ConnectorKey, StatusUpdate>>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn tenant_exists(&self, tenant_id: &str) -> bool {
        self.config.tenants.contains_key(tenant_id)
    }

    /// Every external-mode descriptor in the config. Used at startup to
    /// pre-warm connector processes.
    pub fn external_descriptors(&self) -> Vec<ConnectorDescriptor> {
        let mut out = Vec::new();
        for (tenant_id, tenant) in &self.config.tenants {
            for (connector_id, connector) in &tenant.connectors {
                if connector.enabled && connector.mode.is_external() {
                    out.push(connector.to_descriptor(tenant_id, connector_id));
                }
            }
        }
        out
    }

    /// Supervision status snapshot for one tenant's connectors.
    pub fn statuses_for_tenant(&self, tenant_id: &str) -> Vec<StatusUpdate> {
        let mut out: Vec<StatusUpdate> = self
            .statuses
            .read()
            .iter()
            .filter(|(k, _)| k.tenant_id == tenant_id)
            .map(|(_, v)| v.clone())
            .collect();
        out.sort_by(|a, b| a.connector_id.cmp(&b.connector_id));
        out
    }
}

#[async_trait]
impl ConnectorConfigSource for ConfigStore {
    async fn get_attached(
        &self,
        tenant_id: &str,
        connector_id: &str,
    ) -> anyhow::Result<Vec<ConnectorDescriptor>> {
        let Some(tenant) = self.config.tenants.get(tenant_id) else {
            return Ok(vec![]);
        };
        Ok(tenant
            .connectors
            .get(connector_id)
            .map(|c| c.to_descriptor(tenant_id, connector_id))
            .into_iter()
            .collect())
    }
}

#[async_trait]
impl CredentialProvider for ConfigStore {
    async fn get_credential(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> anyhow::Result<Option<Credential>> {
        let Some(tenant) = self.config.tenants.get(tenant_id) else {
            return Ok(None);
        };
        // Credentials are keyed by connector kind: any connector of the
        // requested kind carrying an active credential satisfies the lookup.
        for (connector_id, connector) in &tenant.connectors {
            if connector.kind_or(connector_id) != provider {
                continue;
            }
            if let Some(credential) = connector.credential() {
                if credential.active {
                    return Ok(Some(credential));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ToolEnablementSource for ConfigStore {
    async fn get_enabled_map(
        &self,
        tenant_id: &str,
        connector_id: &str,
    ) -> anyhow::Result<HashMap<String, bool>> {
        Ok(self
            .config
            .tenants
            .get(tenant_id)
            .and_then(|t| t.connectors.get(connector_id))
            .map(|c| c.tools.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ProcessStatusSink for ConfigStore {
    async fn upsert_status(&self, update: StatusUpdate) -> anyhow::Result<()> {
        let key = ConnectorKey::new(&update.tenant_id, &update.connector_id);
        self.statuses.write().insert(key, update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagemcp_hosting::ProcessStatus;

    fn store() -> ConfigStore {
        let config = crate::config::parse(
            r#"
tenants:
  t1:
    connectors:
      github:
        mode: node
        command: ["npx", "@example/github-mcp"]
        credential:
          bearerToken: gh-token
      stale:
        kind: jira
        mode: binary
        command: ["jira-mcp"]
        credential:
          bearerToken: expired
          active: false
      search:
        kind: websearch
        tools:
          deep_search: false
"#,
        )
        .expect("parse");
        ConfigStore::new(config)
    }

    #[tokio::test]
    async fn attached_lookup_scopes_by_tenant_and_connector() {
        let store = store();
        let attached = store.get_attached("t1", "github").await.expect("lookup");
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].kind, "github");

        assert!(store.get_attached("t1", "nope").await.expect("lookup").is_empty());
        assert!(store.get_attached("t2", "github").await.expect("lookup").is_empty());
    }

    #[tokio::test]
    async fn credential_lookup_skips_inactive_tokens() {
        let store = store();
        let cred = store.get_credential("t1", "github").await.expect("lookup");
        assert_eq!(cred.expect("present").bearer_token, "gh-token");

        assert!(store.get_credential("t1", "jira").await.expect("lookup").is_none());
        assert!(store.get_credential("t1", "websearch").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn enablement_map_round_trips_from_config() {
        let store = store();
        let map = store.get_enabled_map("t1", "search").await.expect("lookup");
        assert_eq!(map.get("deep_search"), Some(&false));
        assert!(store.get_enabled_map("t1", "github").await.expect("lookup").is_empty());
    }

    #[tokio::test]
    async fn status_upserts_replace_and_snapshot_by_tenant() {
        let store = store();
        store
            .upsert_status(StatusUpdate::new("t1", "github", ProcessStatus::Starting))
            .await
            .expect("upsert");
        store
            .upsert_status(StatusUpdate::new("t1", "github", ProcessStatus::Running))
            .await
            .expect("upsert");
        store
            .upsert_status(StatusUpdate::new("t2", "other", ProcessStatus::Running))
            .await
            .expect("upsert");

        let statuses = store.statuses_for_tenant("t1");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, ProcessStatus::Running);
    }
}
