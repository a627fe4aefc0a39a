use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// How a connector instance is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In-process plugin code.
    #[default]
    Native,
    /// External Node.js MCP server (typically launched via `npx`).
    Node,
    /// External Python MCP server (typically launched via `uvx`).
    Python,
    /// External pre-built executable speaking MCP over stdio.
    Binary,
}

impl ExecutionMode {
    /// External modes run as an independent OS process behind a bridge.
    #[must_use]
    pub fn is_external(self) -> bool {
        !matches!(self, ExecutionMode::Native)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Native => write!(f, "native"),
            ExecutionMode::Node => write!(f, "node"),
            ExecutionMode::Python => write!(f, "python"),
            ExecutionMode::Binary => write!(f, "binary"),
        }
    }
}

/// Supervision status persisted on every process-registry transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Restarting,
    Stopped,
    Error,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Restarting => write!(f, "restarting"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Error => write!(f, "error"),
        }
    }
}

/// The (tenant, connector) pair every cache and registry is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectorKey {
    pub tenant_id: String,
    pub connector_id: String,
}

impl ConnectorKey {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, connector_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            connector_id: connector_id.into(),
        }
    }
}

impl fmt::Display for ConnectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.connector_id)
    }
}

/// Immutable snapshot of one connector instance's configuration.
///
/// Read from the configuration collaborator at context-build time; the core
/// never writes these back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    pub tenant_id: String,
    pub connector_id: String,
    /// Connector kind, e.g. `"github"` or `"gitlab"`. Doubles as the tool-name
    /// prefix and the resource URI scheme in multi-connector contexts.
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: ExecutionMode,
    /// Executable command vector for external modes (`command[0]` is the
    /// program, the rest are arguments). Empty for native connectors.
    #[serde(default)]
    pub command: Vec<String>,
    /// User-declared per-connector environment; wins over injected variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl ConnectorDescriptor {
    #[must_use]
    pub fn key(&self) -> ConnectorKey {
        ConnectorKey::new(self.tenant_id.clone(), self.connector_id.clone())
    }

    /// Validate the command vector for external execution.
    ///
    /// # Errors
    ///
    /// Returns `HostingError::Config` when the vector is empty or the program
    /// name is blank.
    pub fn validate_command(&self) -> crate::Result<()> {
        let Some(program) = self.command.first() else {
            return Err(crate::HostingError::Config(format!(
                "connector {} has an empty command vector",
                self.key()
            )));
        };
        if program.trim().is_empty() {
            return Err(crate::HostingError::Config(format!(
                "connector {} has a blank executable name",
                self.key()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(command: Vec<String>) -> ConnectorDescriptor {
        ConnectorDescriptor {
            tenant_id: "t1".into(),
            connector_id: "c1".into(),
            kind: "acme".into(),
            enabled: true,
            mode: ExecutionMode::Binary,
            command,
            env: HashMap::new(),
            working_dir: None,
        }
    }

    #[test]
    fn empty_command_vector_is_rejected() {
        assert!(descriptor(vec![]).validate_command().is_err());
        assert!(descriptor(vec![String::new()]).validate_command().is_err());
        assert!(descriptor(vec!["  ".into()]).validate_command().is_err());
        assert!(descriptor(vec!["mcp-acme".into()]).validate_command().is_ok());
    }

    #[test]
    fn external_modes_are_flagged() {
        assert!(!ExecutionMode::Native.is_external());
        assert!(ExecutionMode::Node.is_external());
        assert!(ExecutionMode::Python.is_external());
        assert!(ExecutionMode::Binary.is_external());
    }
}
