//! Maps connector descriptors to plugin instances.
//!
//! Native kinds resolve to in-process plugins registered at startup;
//! external modes resolve to a process-registry-backed plugin speaking
//! MCP over stdio.

use async_trait::async_trait;
use sagemcp_hosting::{
    ConnectorDescriptor, ConnectorPlugin, ExternalProcessPlugin, HostingConfig, HostingError,
    PluginResolver, ProcessRegistry, ResourceDescriptor, Result, ToolDescriptor,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub struct HostedPluginResolver {
    registry: Arc<ProcessRegistry>,
    config: HostingConfig,
    native: HashMap<String, Arc<dyn ConnectorPlugin>>,
}

impl HostedPluginResolver {
    #[must_use]
    pub fn new(registry: Arc<ProcessRegistry>, config: HostingConfig) -> Self {
        let mut native: HashMap<String, Arc<dyn ConnectorPlugin>> = HashMap::new();
        let echo: Arc<dyn ConnectorPlugin> = Arc::new(EchoConnector);
        native.insert(echo.kind().to_string(), echo);
        Self { registry, config, native }
    }
}

#[async_trait]
impl PluginResolver for HostedPluginResolver {
    async fn resolve(&self, kind: &str) -> Option<Arc<dyn ConnectorPlugin>> {
        self.native.get(kind).cloned()
    }

    async fn resolve_for_descriptor(
        &self,
        descriptor: &ConnectorDescriptor,
    ) -> Result<Arc<dyn ConnectorPlugin>> {
        if descriptor.mode.is_external() {
            return Ok(Arc::new(ExternalProcessPlugin::new(
                Arc::clone(&self.registry),
                descriptor.clone(),
                self.config.call_timeout,
            )));
        }
        self.resolve(&descriptor.kind).await.ok_or_else(|| {
            HostingError::Config(format!(
                "no native plugin registered for kind '{}'",
                descriptor.kind
            ))
        })
    }
}

/// Built-in diagnostic connector: echoes tool arguments back. Useful for
/// verifying tenant wiring without standing up a real backend.
struct EchoConnector;

#[async_trait]
impl ConnectorPlugin for EchoConnector {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(vec![ToolDescriptor {
            name: "echo".to_string(),
            description: Some("Echo the provided arguments back".to_string()),
            input_schema: json!({
                "type": "object",
                "additionalProperties": true
            }),
        }])
    }

    async fn call_tool(&self, name: &str, arguments: Value, _bearer: Option<&str>) -> Result<Value> {
        if name != "echo" {
            return Err(HostingError::NotFound(format!("tool {name} not found")));
        }
        Ok(arguments)
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        Ok(vec![])
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        Err(HostingError::NotFound(format!("resource {uri} not found")))
    }
}
