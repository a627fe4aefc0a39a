//! The hosting context: one tenant-scoped MCP surface.
//!
//! A context bundles the connectors attached to a (tenant, connector) key
//! behind a single tool/resource namespace. With a single attachment the
//! namespace is transparent; with several, tool names are prefixed with
//! the connector kind and routed back through [`crate::router`].

use crate::descriptor::ConnectorDescriptor;
use crate::error::{HostingError, Result};
use crate::router::{self, TargetMeta};
use crate::traits::{ConnectorPlugin, ResourceDescriptor, ToolDescriptor};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AttachedConnector {
    pub descriptor: ConnectorDescriptor,
    pub plugin: Arc<dyn ConnectorPlugin>,
}

pub struct HostingContext {
    pub tenant_id: String,
    pub connector_id: String,
    attached: Vec<AttachedConnector>,
    /// Per-tool enablement keyed by connector-local tool name. Tools not
    /// present in the map are enabled.
    enabled_tools: HashMap<String, bool>,
    bearer: RwLock<Option<String>>,
}

impl std::fmt::Debug for HostingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostingContext")
            .field("tenant_id", &self.tenant_id)
            .field("connector_id", &self.connector_id)
            .field("attached", &self.attached.len())
            .finish_non_exhaustive()
    }
}

impl HostingContext {
    #[must_use]
    pub fn new(
        tenant_id: &str,
        connector_id: &str,
        attached: Vec<AttachedConnector>,
        enabled_tools: HashMap<String, bool>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            connector_id: connector_id.to_string(),
            attached,
            enabled_tools,
            bearer: RwLock::new(None),
        }
    }

    /// Stamp the caller's bearer token onto the context. Called on every
    /// pool access so a cached context never serves a stale token.
    pub fn set_bearer(&self, bearer: Option<&str>) {
        *self.bearer.write() = bearer.map(String::from);
    }

    #[must_use]
    pub fn bearer(&self) -> Option<String> {
        self.bearer.read().clone()
    }

    #[must_use]
    pub fn attached(&self) -> &[AttachedConnector] {
        &self.attached
    }

    fn targets(&self) -> Vec<TargetMeta<'_>> {
        self.attached
            .iter()
            .map(|a| TargetMeta {
                kind: &a.descriptor.kind,
                enabled: a.descriptor.enabled,
                external: a.plugin.is_external(),
            })
            .collect()
    }

    fn prefixed(&self) -> bool {
        self.attached.iter().filter(|a| a.descriptor.enabled).count() > 1
    }

    fn tool_enabled(&self, local_name: &str) -> bool {
        self.enabled_tools.get(local_name).copied().unwrap_or(true)
    }

    /// Aggregate tool listing across attachments. Names are exposed with
    /// the `{kind}_` prefix only when more than one connector is enabled.
    /// A connector that fails to list contributes nothing; the rest of the
    /// context stays usable.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let prefixed = self.prefixed();
        let mut out = Vec::new();
        for attachment in self.attached.iter().filter(|a| a.descriptor.enabled) {
            let tools = match attachment.plugin.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(
                        kind = %attachment.descriptor.kind,
                        error = %e,
                        "connector failed to list tools"
                    );
                    continue;
                }
            };
            for mut tool in tools {
                if !self.tool_enabled(&tool.name) {
                    continue;
                }
                if prefixed {
                    tool.name = format!("{}_{}", attachment.descriptor.kind, tool.name);
                }
                out.push(tool);
            }
        }
        Ok(out)
    }

    /// Route and invoke a tool by its exposed name.
    ///
    /// # Errors
    ///
    /// `NotFound` when no attachment claims the name or the tool is
    /// disabled; connector errors pass through.
    pub async fn call_tool(&self, exposed: &str, arguments: Value) -> Result<Value> {
        let targets = self.targets();
        let Some((idx, local)) = router::resolve_tool(&targets, exposed) else {
            return Err(HostingError::NotFound(format!("tool {exposed} not found")));
        };
        if !self.tool_enabled(&local) {
            return Err(HostingError::NotFound(format!("tool {exposed} is disabled")));
        }
        let attachment = &self.attached[idx];
        tracing::debug!(
            tenant_id = %self.tenant_id,
            kind = %attachment.descriptor.kind,
            tool = %local,
            "invoking tool"
        );
        let bearer = self.bearer();
        attachment.plugin.call_tool(&local, arguments, bearer.as_deref()).await
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let mut out = Vec::new();
        for attachment in self.attached.iter().filter(|a| a.descriptor.enabled) {
            match attachment.plugin.list_resources().await {
                Ok(resources) => out.extend(resources),
                Err(e) => {
                    tracing::warn!(
                        kind = %attachment.descriptor.kind,
                        error = %e,
                        "connector failed to list resources"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Route and read a resource by URI.
    ///
    /// # Errors
    ///
    /// `NotFound` when no attachment claims the URI scheme.
    pub async fn read_resource(&self, uri: &str) -> Result<String> {
        let targets = self.targets();
        let Some(idx) = router::resolve_resource(&targets, uri) else {
            return Err(HostingError::NotFound(format!("resource {uri} not found")));
        };
        self.attached[idx].plugin.read_resource(uri).await
    }
}

pub use factory::DefaultContextFactory;

mod factory {
    use super::*;
    use crate::traits::{ConnectorConfigSource, ContextFactory, PluginResolver, ToolEnablementSource};
    use async_trait::async_trait;

    /// Standard context construction: configuration, plugin resolution,
    /// and tool enablement wired together from the injected sources.
    pub struct DefaultContextFactory {
        configs: Arc<dyn ConnectorConfigSource>,
        resolver: Arc<dyn PluginResolver>,
        enablement: Arc<dyn ToolEnablementSource>,
    }

    impl DefaultContextFactory {
        #[must_use]
        pub fn new(
            configs: Arc<dyn ConnectorConfigSource>,
            resolver: Arc<dyn PluginResolver>,
            enablement: Arc<dyn ToolEnablementSource>,
        ) -> Self {
            Self { configs, resolver, enablement }
        }
    }

    #[async_trait]
    impl ContextFactory for DefaultContextFactory {
        async fn build(
            &self,
            tenant_id: &str,
            connector_id: &str,
        ) -> Result<Arc<HostingContext>> {
            let descriptors = self
                .configs
                .get_attached(tenant_id, connector_id)
                .await
                .map_err(|e| HostingError::Unavailable(e.to_string()))?;
            if descriptors.is_empty() {
                return Err(HostingError::NotFound(format!(
                    "connector {tenant_id}/{connector_id} not configured"
                )));
            }
            if descriptors.iter().all(|d| !d.enabled) {
                return Err(HostingError::Unavailable(format!(
                    "connector {tenant_id}/{connector_id} is disabled"
                )));
            }

            let mut attached = Vec::with_capacity(descriptors.len());
            for descriptor in descriptors {
                let plugin = self.resolver.resolve_for_descriptor(&descriptor).await?;
                attached.push(AttachedConnector { descriptor, plugin });
            }

            // A missing enablement map is not fatal; tools default to on.
            let enabled_tools = match self
                .enablement
                .get_enabled_map(tenant_id, connector_id)
                .await
            {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(tenant_id, connector_id, error = %e, "tool enablement lookup failed");
                    HashMap::new()
                }
            };

            Ok(Arc::new(HostingContext::new(
                tenant_id,
                connector_id,
                attached,
                enabled_tools,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ExecutionMode;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakePlugin {
        kind: String,
        tools: Vec<String>,
    }

    #[async_trait]
    impl ConnectorPlugin for FakePlugin {
        fn kind(&self) -> &str {
            &self.kind
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            Ok(self
                .tools
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.clone(),
                    description: None,
                    input_schema: json!({"type": "object"}),
                })
                .collect())
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            bearer: Option<&str>,
        ) -> Result<Value> {
            // Behave like a real server: reject names we never advertised.
            if !self.tools.iter().any(|t| t == name) {
                return Err(HostingError::NotFound(format!("tool {name} not found")));
            }
            Ok(json!({"kind": self.kind, "tool": name, "authed": bearer.is_some()}))
        }

        async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
            Ok(vec![])
        }

        async fn read_resource(&self, uri: &str) -> Result<String> {
            Ok(format!("{}:{uri}", self.kind))
        }
    }

    fn attachment(kind: &str, tools: &[&str]) -> AttachedConnector {
        AttachedConnector {
            descriptor: ConnectorDescriptor {
                tenant_id: "t1".into(),
                connector_id: "c1".into(),
                kind: kind.into(),
                enabled: true,
                mode: ExecutionMode::Native,
                command: vec![],
                env: HashMap::new(),
                working_dir: None,
            },
            plugin: Arc::new(FakePlugin {
                kind: kind.into(),
                tools: tools.iter().map(|s| (*s).to_string()).collect(),
            }),
        }
    }

    #[tokio::test]
    async fn single_connector_exposes_unprefixed_names() {
        let ctx = HostingContext::new(
            "t1",
            "c1",
            vec![attachment("acme", &["list_widgets"])],
            HashMap::new(),
        );

        let tools = ctx.list_tools().await.expect("list");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "list_widgets");

        let result = ctx.call_tool("list_widgets", json!({})).await.expect("call");
        assert_eq!(result["tool"], "list_widgets");
    }

    #[tokio::test]
    async fn multiple_connectors_prefix_and_route() {
        let ctx = HostingContext::new(
            "t1",
            "c1",
            vec![
                attachment("git", &["commit"]),
                attachment("gitlab", &["list_projects"]),
            ],
            HashMap::new(),
        );

        let mut names: Vec<String> = ctx
            .list_tools()
            .await
            .expect("list")
            .into_iter()
            .map(|t| t.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["git_commit", "gitlab_list_projects"]);

        let result = ctx
            .call_tool("gitlab_list_projects", json!({}))
            .await
            .expect("call");
        assert_eq!(result["kind"], "gitlab");
        assert_eq!(result["tool"], "list_projects");
    }

    #[tokio::test]
    async fn disabled_tool_is_hidden_and_uncallable() {
        let mut enabled = HashMap::new();
        enabled.insert("delete_widget".to_string(), false);
        let ctx = HostingContext::new(
            "t1",
            "c1",
            vec![attachment("acme", &["list_widgets", "delete_widget"])],
            enabled,
        );

        let tools = ctx.list_tools().await.expect("list");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "list_widgets");

        let err = ctx
            .call_tool("delete_widget", json!({}))
            .await
            .expect_err("must refuse");
        assert!(matches!(err, HostingError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let ctx = HostingContext::new(
            "t1",
            "c1",
            vec![attachment("acme", &["list_widgets"])],
            HashMap::new(),
        );
        let err = ctx.call_tool("acme_nope", json!({})).await.expect_err("no such tool");
        assert!(matches!(err, HostingError::NotFound(_)));
    }

    #[tokio::test]
    async fn bearer_flows_to_the_plugin() {
        let ctx = HostingContext::new(
            "t1",
            "c1",
            vec![attachment("acme", &["whoami"])],
            HashMap::new(),
        );
        ctx.set_bearer(Some("tok"));
        let result = ctx.call_tool("whoami", json!({})).await.expect("call");
        assert_eq!(result["authed"], true);

        ctx.set_bearer(None);
        let result = ctx.call_tool("whoami", json!({})).await.expect("call");
        assert_eq!(result["authed"], false);
    }

    #[tokio::test]
    async fn read_resource_routes_by_scheme() {
        let ctx = HostingContext::new(
            "t1",
            "c1",
            vec![
                attachment("git", &[]),
                attachment("gitlab", &[]),
            ],
            HashMap::new(),
        );
        let body = ctx.read_resource("gitlab://projects/1").await.expect("read");
        assert_eq!(body, "gitlab:gitlab://projects/1");
    }
}
