use anyhow::Context as _;
use clap::Parser;
use sagemcp_hosting::{DefaultContextFactory, HostingConfig, ProcessRegistry, ServerPool, SessionManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod config;
mod http;
mod resolver;
mod store;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI arguments for the gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "sagemcp")]
#[command(version, about = "SageMCP gateway: multi-tenant hosting for MCP connectors")]
struct CliArgs {
    /// Path to the gateway config file (YAML).
    #[arg(short = 'c', long = "config", env = "SAGEMCP_CONFIG")]
    config: PathBuf,

    /// HTTP bind address (ip:port).
    #[arg(short = 'b', long, env = "SAGEMCP_BIND", default_value = "127.0.0.1:4820")]
    bind: String,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "SAGEMCP_LOG", default_value = "info")]
    log_level: String,

    /// Spawn every configured external connector process at startup instead
    /// of on first use. Also enabled by a truthy `SAGEMCP_PREWARM`.
    #[arg(long = "prewarm")]
    prewarm: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting SageMCP gateway v{VERSION}");
    run(args).await
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("read config: {}", args.config.display()))?;
    let gateway_config = config::parse(&raw)
        .with_context(|| format!("parse config: {}", args.config.display()))?;
    let tenant_count = gateway_config.tenants.len();

    let hosting = HostingConfig::from_env();
    let store = Arc::new(store::ConfigStore::new(gateway_config));

    let registry = Arc::new(ProcessRegistry::new(
        hosting.clone(),
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    ));
    registry.spawn_supervisor();

    let plugin_resolver = Arc::new(resolver::HostedPluginResolver::new(
        Arc::clone(&registry),
        hosting.clone(),
    ));
    let factory = Arc::new(DefaultContextFactory::new(
        Arc::clone(&store) as _,
        plugin_resolver,
        Arc::clone(&store) as _,
    ));

    let pool = Arc::new(ServerPool::new(hosting.clone(), factory));
    pool.spawn_reaper();

    let sessions = Arc::new(SessionManager::new(hosting));
    sessions.spawn_reaper();

    let ct = CancellationToken::new();
    if args.prewarm || sagemcp_env::flag("SAGEMCP_PREWARM") {
        spawn_prewarm(&store, &registry, &ct);
    }

    let state = Arc::new(http::GatewayState {
        store,
        pool: Arc::clone(&pool),
        sessions: Arc::clone(&sessions),
    });
    let app = http::router(state);

    let bind: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", args.bind))?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind address '{bind}'"))?;
    let bound = listener.local_addr().context("get bind address")?;
    tracing::info!(tenants = tenant_count, "Serving HTTP on {bound}");

    spawn_shutdown_watcher(ct.clone());

    let serve_ct = ct.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            serve_ct.cancelled().await;
        })
        .await?;

    // Teardown order matters: sessions release their contexts, the pool
    // releases its plugins, and only then are the processes stopped.
    sessions.shutdown().await;
    pool.shutdown().await;
    registry.terminate_all().await;
    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

fn spawn_prewarm(
    store: &Arc<store::ConfigStore>,
    registry: &Arc<ProcessRegistry>,
    ct: &CancellationToken,
) {
    let descriptors = store.external_descriptors();
    if descriptors.is_empty() {
        return;
    }
    tracing::info!(count = descriptors.len(), "prewarming external connector processes");
    let registry = Arc::clone(registry);
    let ct = ct.clone();
    tokio::spawn(async move {
        for descriptor in descriptors {
            if ct.is_cancelled() {
                break;
            }
            if let Err(e) = registry.get_or_create(&descriptor).await {
                tracing::warn!(key = %descriptor.key(), error = %e, "prewarm failed");
            }
        }
    });
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
