//! YAML gateway configuration.
//!
//! One file declares every tenant and the connectors attached to each.
//! Hosting-core tunables (TTLs, caps, timeouts) are environment-driven via
//! [`sagemcp_hosting::HostingConfig::from_env`] and deliberately absent here.

use sagemcp_hosting::{ConnectorDescriptor, Credential, ExecutionMode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Connector kind; defaults to the connector id when omitted.
    pub kind: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Launch command for external modes; empty for native connectors.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub credential: Option<CredentialConfig>,
    /// Per-tool enablement, keyed by connector-local tool name. Tools not
    /// listed are enabled.
    #[serde(default)]
    pub tools: HashMap<String, bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CredentialConfig {
    pub bearer_token: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl ConnectorConfig {
    pub fn kind_or<'a>(&'a self, connector_id: &'a str) -> &'a str {
        self.kind.as_deref().unwrap_or(connector_id)
    }

    pub fn to_descriptor(&self, tenant_id: &str, connector_id: &str) -> ConnectorDescriptor {
        ConnectorDescriptor {
            tenant_id: tenant_id.to_string(),
            connector_id: connector_id.to_string(),
            kind: self.kind_or(connector_id).to_string(),
            enabled: self.enabled,
            mode: self.mode,
            command: self.command.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credential.as_ref().map(|c| Credential {
            bearer_token: c.bearer_token.clone(),
            active: c.active,
        })
    }
}

/// Parse and validate a YAML config document.
///
/// Credential tokens and connector env values support `${VAR}` references
/// resolved against the gateway's own environment, so secrets stay out of
/// the file.
///
/// # Errors
///
/// Unknown fields, malformed YAML, external connectors with an empty launch
/// command, and references to unset environment variables are all rejected.
pub fn parse(raw: &str) -> anyhow::Result<GatewayConfig> {
    let mut config: GatewayConfig = serde_yaml::from_str(raw)?;
    for (tenant_id, tenant) in &mut config.tenants {
        for (connector_id, connector) in &mut tenant.connectors {
            if connector.mode.is_external() && connector.command.is_empty() {
                anyhow::bail!(
                    "connector {tenant_id}/{connector_id}: mode '{}' requires a command",
                    connector.mode
                );
            }
            expand_connector(connector)
                .map_err(|e| anyhow::anyhow!("connector {tenant_id}/{connector_id}: {e}"))?;
        }
    }
    Ok(config)
}

fn expand_connector(connector: &mut ConnectorConfig) -> Result<(), String> {
    for value in connector.env.values_mut() {
        *value = sagemcp_env::expand_env_string(value)?;
    }
    if let Some(credential) = &mut connector.credential {
        credential.bearer_token = sagemcp_env::expand_env_string(&credential.bearer_token)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
tenants:
  acme-corp:
    connectors:
      github:
        mode: node
        command: ["npx", "@example/github-mcp"]
        env:
          GITHUB_API_URL: https://github.example.com
        credential:
          bearerToken: gh-token
        tools:
          delete_repo: false
      search:
        kind: websearch
        mode: native
"#;

    #[test]
    fn parses_full_document() {
        let config = parse(SAMPLE).expect("parse");
        let tenant = &config.tenants["acme-corp"];
        let github = &tenant.connectors["github"];

        assert_eq!(github.kind_or("github"), "github");
        assert_eq!(github.mode, ExecutionMode::Node);
        assert!(github.enabled);
        assert_eq!(github.tools.get("delete_repo"), Some(&false));

        let cred = github.credential().expect("credential");
        assert_eq!(cred.bearer_token, "gh-token");
        assert!(cred.active);

        let descriptor = github.to_descriptor("acme-corp", "github");
        assert_eq!(descriptor.command[0], "npx");
        assert_eq!(descriptor.env["GITHUB_API_URL"], "https://github.example.com");

        let search = &tenant.connectors["search"];
        assert_eq!(search.kind_or("search"), "websearch");
        assert_eq!(search.mode, ExecutionMode::Native);
    }

    #[test]
    fn external_connector_without_command_is_rejected() {
        let raw = r#"
tenants:
  t1:
    connectors:
      broken:
        mode: python
"#;
        let err = parse(raw).expect_err("must reject");
        assert!(err.to_string().contains("requires a command"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"
tenants:
  t1:
    connectors:
      c1:
        mode: native
        bogus: true
"#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse("{}").expect("parse");
        assert!(config.tenants.is_empty());
    }

    #[test]
    fn env_references_expand_from_the_process_environment() {
        std::env::set_var("SAGEMCP_CONF_TEST_TOKEN", "secret-1");
        let raw = r#"
tenants:
  t1:
    connectors:
      c1:
        mode: binary
        command: ["some-mcp"]
        env:
          API_TOKEN: ${SAGEMCP_CONF_TEST_TOKEN}
        credential:
          bearerToken: ${SAGEMCP_CONF_TEST_TOKEN}
"#;
        let config = parse(raw).expect("parse");
        let connector = &config.tenants["t1"].connectors["c1"];
        assert_eq!(connector.env["API_TOKEN"], "secret-1");
        assert_eq!(connector.credential().expect("cred").bearer_token, "secret-1");

        let missing = raw.replace("SAGEMCP_CONF_TEST_TOKEN", "SAGEMCP_CONF_TEST_UNSET");
        assert!(parse(&missing).is_err());
    }
}
