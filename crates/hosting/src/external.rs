//! Connector plugin backed by an external MCP server process.
//!
//! Bridges the [`ConnectorPlugin`] trait to JSON-RPC calls over a
//! [`crate::bridge::ProcessBridge`] obtained from the process registry,
//! so externally hosted connectors look exactly like native ones to the
//! hosting context.

use crate::descriptor::ConnectorDescriptor;
use crate::error::{HostingError, Result};
use crate::registry::ProcessRegistry;
use crate::traits::{ConnectorPlugin, ResourceDescriptor, ToolDescriptor};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct ExternalProcessPlugin {
    registry: Arc<ProcessRegistry>,
    descriptor: ConnectorDescriptor,
    call_timeout: Duration,
}

impl ExternalProcessPlugin {
    #[must_use]
    pub fn new(
        registry: Arc<ProcessRegistry>,
        descriptor: ConnectorDescriptor,
        call_timeout: Duration,
    ) -> Self {
        Self { registry, descriptor, call_timeout }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let bridge = self.registry.get_or_create(&self.descriptor).await?;
        bridge.request(method, params, self.call_timeout).await
    }
}

#[async_trait]
impl ConnectorPlugin for ExternalProcessPlugin {
    fn kind(&self) -> &str {
        &self.descriptor.kind
    }

    fn is_external(&self) -> bool {
        true
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                Some(ToolDescriptor {
                    name,
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .map(String::from),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect())
    }

    /// Invoke a tool on the server. The bearer token is not forwarded;
    /// external processes receive their credential in the environment at
    /// spawn time.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        _bearer: Option<&str>,
    ) -> Result<Value> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;

        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(HostingError::ToolFailed(if text.is_empty() {
                format!("tool {name} reported an error")
            } else {
                text
            }));
        }

        // Servers frequently pack JSON into the text block; surface it
        // structured when it parses.
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            return Ok(parsed);
        }
        Ok(Value::String(text))
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let result = self.request("resources/list", json!({})).await?;
        let resources = result
            .get("resources")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(resources
            .into_iter()
            .filter_map(|res| {
                let uri = res.get("uri")?.as_str()?.to_string();
                Some(ResourceDescriptor {
                    name: res
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(&uri)
                        .to_string(),
                    uri,
                    description: res
                        .get("description")
                        .and_then(Value::as_str)
                        .map(String::from),
                    mime_type: res
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .map(String::from),
                })
            })
            .collect())
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        let result = self.request("resources/read", json!({"uri": uri})).await?;
        result
            .get("contents")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                HostingError::ToolFailed(format!("resource {uri} returned no text content"))
            })
    }
}
