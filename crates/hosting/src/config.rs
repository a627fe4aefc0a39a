use std::time::Duration;

/// Tunables for the hosting core.
///
/// Defaults are production values; each knob can be overridden through a
/// `SAGEMCP_*` env var (see `from_env`). Timing-sensitive tests construct the
/// struct directly instead.
#[derive(Debug, Clone)]
pub struct HostingConfig {
    /// Fixed-origin TTL for pooled hosting contexts (staleness bound on the
    /// cached tool-enablement snapshot; not refreshed by access).
    pub pool_ttl: Duration,
    pub pool_capacity: usize,
    pub pool_reap_interval: Duration,

    /// Sliding-window TTL for client sessions (refreshed on access).
    pub session_ttl: Duration,
    pub session_cap_per_key: usize,
    pub session_reap_interval: Duration,

    /// Minimum spacing between protocol-level health probes per bridge.
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive probe failures before a bridge is declared unhealthy.
    pub failure_threshold: u32,

    /// Hard cap on automatic restarts per (tenant, connector) key.
    pub restart_cap: u32,
    pub supervise_interval: Duration,

    /// Default timeout for tool/resource calls against a bridge.
    pub call_timeout: Duration,
    /// Initialize-handshake timeout for plain executables.
    pub init_timeout: Duration,
    /// Initialize-handshake timeout for package-runner launchers (`npx`,
    /// `uvx`, ...) that may perform a just-in-time install.
    pub init_timeout_package_runner: Duration,

    /// Optional base-URL hint forwarded to spawned connectors.
    pub api_base_url: Option<String>,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            pool_ttl: Duration::from_secs(600),
            pool_capacity: 100,
            pool_reap_interval: Duration::from_secs(60),
            session_ttl: Duration::from_secs(1800),
            session_cap_per_key: 10,
            session_reap_interval: Duration::from_secs(60),
            probe_interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            restart_cap: 3,
            supervise_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            init_timeout: Duration::from_secs(30),
            init_timeout_package_runner: Duration::from_secs(90),
            api_base_url: None,
        }
    }
}

fn secs(name: &str, default: Duration) -> Duration {
    sagemcp_env::positive_u64(name).map_or(default, Duration::from_secs)
}

impl HostingConfig {
    /// Defaults with `SAGEMCP_*` env overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            pool_ttl: secs("SAGEMCP_POOL_TTL_SECS", d.pool_ttl),
            pool_capacity: sagemcp_env::positive_usize("SAGEMCP_POOL_CAPACITY")
                .unwrap_or(d.pool_capacity),
            pool_reap_interval: secs("SAGEMCP_POOL_REAP_INTERVAL_SECS", d.pool_reap_interval),
            session_ttl: secs("SAGEMCP_SESSION_TTL_SECS", d.session_ttl),
            session_cap_per_key: sagemcp_env::positive_usize("SAGEMCP_SESSION_CAP_PER_KEY")
                .unwrap_or(d.session_cap_per_key),
            session_reap_interval: secs(
                "SAGEMCP_SESSION_REAP_INTERVAL_SECS",
                d.session_reap_interval,
            ),
            probe_interval: secs("SAGEMCP_PROBE_INTERVAL_SECS", d.probe_interval),
            probe_timeout: secs("SAGEMCP_PROBE_TIMEOUT_SECS", d.probe_timeout),
            failure_threshold: sagemcp_env::positive_u64("SAGEMCP_PROBE_FAILURE_THRESHOLD")
                .map_or(d.failure_threshold, |v| v.min(u64::from(u32::MAX)) as u32),
            restart_cap: sagemcp_env::positive_u64("SAGEMCP_RESTART_CAP")
                .map_or(d.restart_cap, |v| v.min(u64::from(u32::MAX)) as u32),
            supervise_interval: secs("SAGEMCP_SUPERVISE_INTERVAL_SECS", d.supervise_interval),
            call_timeout: secs("SAGEMCP_CALL_TIMEOUT_SECS", d.call_timeout),
            init_timeout: secs("SAGEMCP_INIT_TIMEOUT_SECS", d.init_timeout),
            init_timeout_package_runner: secs(
                "SAGEMCP_INIT_TIMEOUT_PACKAGE_RUNNER_SECS",
                d.init_timeout_package_runner,
            ),
            api_base_url: std::env::var("SAGEMCP_API_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}
