//! Connector hosting core for SageMCP.
//!
//! This crate owns the runtime side of connector hosting: spawning and speaking
//! JSON-RPC to externally-hosted connector processes ([`bridge`]), supervising
//! those processes with health probing and bounded auto-restart ([`registry`]),
//! caching initialized per-tenant hosting contexts ([`pool`]), client-facing
//! session lifecycle ([`session`]), and resolving incoming tool/resource calls
//! to a connector instance and action ([`router`]).
//!
//! Everything the core needs from the surrounding system (connector
//! configuration, credentials, status persistence, tool enablement) comes in
//! through the collaborator traits in [`traits`]; the composition root wires
//! concrete implementations and owns shutdown ordering.

pub mod bridge;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod external;
pub mod pool;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod session;
pub mod traits;

pub use config::HostingConfig;
pub use context::{AttachedConnector, DefaultContextFactory, HostingContext};
pub use descriptor::{ConnectorDescriptor, ConnectorKey, ExecutionMode, ProcessStatus};
pub use error::{HostingError, Result};
pub use external::ExternalProcessPlugin;
pub use pool::ServerPool;
pub use registry::ProcessRegistry;
pub use session::{SessionEntry, SessionManager};
pub use traits::{
    ConnectorConfigSource, ConnectorPlugin, ContextFactory, Credential, CredentialProvider,
    PluginResolver, ProcessStatusSink, ResourceDescriptor, StatusUpdate, ToolDescriptor,
    ToolEnablementSource,
};
