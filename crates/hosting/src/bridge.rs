//! Stdio JSON-RPC client owning exactly one external connector process.
//!
//! One bridge = one OS process. The bridge spawns the child with an injected
//! environment, waits out an initial survival window, performs the MCP
//! initialize handshake (retrying once under `Content-Length` framing when the
//! default line-delimited attempt fails), and then serves id-matched
//! request/response traffic until it is shut down. Supervision decisions
//! (health probing, restarts) belong to [`crate::registry`], not here.

use crate::config::HostingConfig;
use crate::descriptor::{ConnectorDescriptor, ConnectorKey};
use crate::error::{HostingError, Result};
use crate::rpc::{
    self, FrameBuffer, Notification, Request, Response, WireFraming, PROTOCOL_VERSION,
};
use crate::traits::Credential;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// Inbound accumulator cap; exceeding it without a complete frame trims the
/// oldest bytes rather than growing unbounded.
const MAX_INBOUND_BUFFER: usize = 1024 * 1024;

/// Kept tail of the child's stderr for error attachment.
const STDERR_TAIL_LINES: usize = 50;

const READY_FAST_POLL: Duration = Duration::from_millis(100);
const READY_SLOW_POLL: Duration = Duration::from_millis(500);
/// Survival window: the child must outlive this before we attempt the
/// initialize handshake.
const READY_WINDOW: Duration = Duration::from_secs(1);

/// Graceful-shutdown wait (stdin closed) before escalating to kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

type PendingSlot = oneshot::Sender<Result<Value>>;
type PendingMap = Arc<Mutex<HashMap<u64, PendingSlot>>>;
type StderrRing = Arc<Mutex<VecDeque<String>>>;

pub struct ProcessBridge {
    key: ConnectorKey,
    program: String,
    pid: Option<u32>,
    child: AsyncMutex<Option<Child>>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    framing: Mutex<WireFraming>,
    stderr_tail: StderrRing,
    initialized: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Keeps a fallback writable HOME alive for the child's lifetime.
    _home_guard: Option<tempfile::TempDir>,
}

impl std::fmt::Debug for ProcessBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBridge")
            .field("key", &self.key)
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ProcessBridge {
    /// Spawn the configured process, wait for it to survive the startup
    /// window, and complete the initialize handshake.
    ///
    /// # Errors
    ///
    /// `Spawn` when the executable is missing or the process dies during the
    /// startup window; `Handshake` when initialize fails under both framings.
    pub async fn spawn(
        descriptor: &ConnectorDescriptor,
        credential: Option<&Credential>,
        config: &HostingConfig,
    ) -> Result<Self> {
        descriptor.validate_command()?;
        let key = descriptor.key();
        let program = descriptor.command[0].clone();
        let resolved = resolve_executable(&program)?;

        let home_guard = if home_is_usable() {
            None
        } else {
            let dir = tempfile::Builder::new()
                .prefix("sagemcp-home-")
                .tempdir()
                .map_err(|e| HostingError::Spawn(format!("create fallback HOME: {e}")))?;
            Some(dir)
        };
        let home_override = home_guard.as_ref().map(|d| d.path().to_path_buf());

        let args = launcher_args(&program, &descriptor.command[1..]);
        let injected = injected_env(
            descriptor,
            credential,
            config.api_base_url.as_deref(),
            &program,
            home_override.as_deref(),
        );

        let mut cmd = Command::new(&resolved);
        cmd.args(&args)
            .envs(&injected)
            .envs(&descriptor.env) // user values win
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HostingError::Spawn(format!("{key}: exec '{program}': {e}")))?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| {
            HostingError::Spawn(format!("{key}: child stdout pipe missing"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            HostingError::Spawn(format!("{key}: child stderr pipe missing"))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            HostingError::Spawn(format!("{key}: child stdin pipe missing"))
        })?;

        let bridge = Self {
            key: key.clone(),
            program: program.clone(),
            pid,
            child: AsyncMutex::new(Some(child)),
            stdin: AsyncMutex::new(Some(stdin)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            framing: Mutex::new(WireFraming::LineDelimited),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            initialized: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            _home_guard: home_guard,
        };

        bridge.spawn_stderr_task(stderr);
        bridge.spawn_reader_task(stdout);

        // The child must survive the initial window; an immediate exit is a
        // spawn failure, reported with whatever it wrote to stderr.
        if let Some(status) = bridge.wait_exit_within(READY_WINDOW).await {
            let tail = bridge.stderr_tail();
            bridge.shutdown().await;
            return Err(HostingError::Spawn(format!(
                "{key}: '{program}' exited during startup ({status}): {tail}"
            )));
        }

        let init_timeout = if is_package_runner(&program) {
            config.init_timeout_package_runner
        } else {
            config.init_timeout
        };
        if let Err(e) = bridge.handshake(init_timeout).await {
            bridge.shutdown().await;
            return Err(e);
        }

        tracing::info!(
            key = %bridge.key,
            pid = ?bridge.pid,
            framing = ?*bridge.framing.lock(),
            "connector process initialized"
        );
        Ok(bridge)
    }

    #[must_use]
    pub fn key(&self) -> &ConnectorKey {
        &self.key
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Cheap liveness: has the OS process already exited?
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Last captured stderr lines, newest last.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        let ring = self.stderr_tail.lock();
        if ring.is_empty() {
            return "<no stderr output>".to_string();
        }
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Send a request and wait for the id-matched response.
    ///
    /// The pending slot is registered before any bytes are written, and is
    /// removed again on timeout so a late or never-arriving response cannot
    /// leak it.
    ///
    /// # Errors
    ///
    /// `Timeout` when no response arrives in time (with the stderr tail
    /// attached), `Rpc` when the peer answers with an error object,
    /// `Unavailable` when the pipe is gone.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = rpc::encode_frame(
            self.framing(),
            &Request::new(id, method, params).into_value(),
        );
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostingError::Unavailable(format!(
                "{}: bridge closed while waiting for {method}",
                self.key
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(HostingError::Timeout(format!(
                    "{}: {method} after {}s; stderr: {}",
                    self.key,
                    timeout.as_secs(),
                    self.stderr_tail()
                )))
            }
        }
    }

    /// Send a notification (no reply expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = rpc::encode_frame(
            self.framing(),
            &Notification::new(method, params).into_value(),
        );
        self.write_frame(&frame).await
    }

    /// Graceful termination: close stdin, wait bounded, then kill. Always
    /// clears pending slots and marks the bridge uninitialized so a stale
    /// object cannot be reused.
    pub async fn shutdown(&self) {
        self.initialized.store(false, Ordering::Release);
        self.stdin.lock().await.take();

        let exited = self.wait_exit_within(SHUTDOWN_GRACE).await.is_some();
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if !exited {
                tracing::warn!(key = %self.key, "graceful shutdown timed out, killing process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(key = %self.key, error = %e, "kill failed");
                }
            }
        }
        guard.take();
        drop(guard);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.fail_pending("bridge shut down");
    }

    fn framing(&self) -> WireFraming {
        *self.framing.lock()
    }

    async fn handshake(&self, timeout: Duration) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {}, "resources": {} },
            "clientInfo": {
                "name": "sagemcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        // Line-delimited is the common case; some servers require header
        // framing, so retry exactly once under Content-Length before giving
        // up. Whichever mode succeeds is kept for the life of the bridge.
        let mut last_err: Option<HostingError> = None;
        for framing in [WireFraming::LineDelimited, WireFraming::ContentLength] {
            *self.framing.lock() = framing;
            match self.request("initialize", params.clone(), timeout).await {
                Ok(_) => {
                    self.notify("notifications/initialized", None).await?;
                    self.initialized.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(key = %self.key, ?framing, error = %e, "initialize attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let cause = last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string());
        Err(HostingError::Handshake(format!(
            "{}: {cause}; stderr: {}",
            self.key,
            self.stderr_tail()
        )))
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(HostingError::Unavailable(format!(
                "{}: stdin closed",
                self.key
            )));
        };
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| HostingError::Unavailable(format!("{}: write failed: {e}", self.key)))?;
        stdin
            .flush()
            .await
            .map_err(|e| HostingError::Unavailable(format!("{}: flush failed: {e}", self.key)))
    }

    /// Poll `try_wait` until the process exits or the window elapses.
    /// Fast polling for the first second, slower after.
    async fn wait_exit_within(&self, window: Duration) -> Option<std::process::ExitStatus> {
        let start = tokio::time::Instant::now();
        loop {
            {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => {
                        if let Ok(Some(status)) = child.try_wait() {
                            return Some(status);
                        }
                    }
                    None => return None,
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= window {
                return None;
            }
            let poll = if elapsed < Duration::from_secs(1) {
                READY_FAST_POLL
            } else {
                READY_SLOW_POLL
            };
            tokio::time::sleep(poll.min(window - elapsed)).await;
        }
    }

    fn spawn_reader_task(&self, stdout: ChildStdout) {
        let pending = Arc::clone(&self.pending);
        let key = self.key.clone();
        let handle = tokio::spawn(async move {
            read_loop(stdout, pending, key).await;
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_stderr_task(&self, stderr: tokio::process::ChildStderr) {
        let ring = Arc::clone(&self.stderr_tail);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut ring = ring.lock();
                if ring.len() >= STDERR_TAIL_LINES {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });
        self.tasks.lock().push(handle);
    }

    fn fail_pending(&self, reason: &str) {
        let slots: Vec<(u64, PendingSlot)> = self.pending.lock().drain().collect();
        for (id, tx) in slots {
            let _ = tx.send(Err(HostingError::Unavailable(format!(
                "{}: {reason} (request {id})",
                self.key
            ))));
        }
    }
}

async fn read_loop(mut stdout: ChildStdout, pending: PendingMap, key: ConnectorKey) {
    let mut buffer = FrameBuffer::new(MAX_INBOUND_BUFFER);
    let mut chunk = [0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buffer.extend(&chunk[..n]) {
                    tracing::warn!(
                        key = %key,
                        "inbound buffer exceeded {MAX_INBOUND_BUFFER} bytes without a complete frame, trimmed oldest bytes"
                    );
                }
                while let Some(value) = buffer.next_frame() {
                    dispatch(&pending, value, &key);
                }
            }
        }
    }

    // Stdout closed: everything still pending will never be answered.
    let slots: Vec<(u64, PendingSlot)> = pending.lock().drain().collect();
    for (id, tx) in slots {
        let _ = tx.send(Err(HostingError::Unavailable(format!(
            "{key}: process closed stdout (request {id})"
        ))));
    }
}

fn dispatch(pending: &Mutex<HashMap<u64, PendingSlot>>, value: Value, key: &ConnectorKey) {
    if value.get("method").is_some() {
        tracing::debug!(key = %key, method = %value["method"], "discarding server notification");
        return;
    }
    let Ok(response) = serde_json::from_value::<Response>(value) else {
        tracing::debug!(key = %key, "discarding unparseable frame");
        return;
    };
    let Some(id) = response.numeric_id() else {
        tracing::debug!(key = %key, "discarding response without numeric id");
        return;
    };
    let Some(tx) = pending.lock().remove(&id) else {
        // Its caller most likely timed out already; the slot is gone.
        tracing::debug!(key = %key, id, "late or unmatched response discarded");
        return;
    };
    let outcome = match (response.result, response.error) {
        (_, Some(err)) => Err(HostingError::Rpc {
            code: err.code,
            message: err.message,
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    };
    let _ = tx.send(outcome);
}

/// Resolve a program name against `PATH` (or verify a path containing a
/// separator directly). Fails fast so no partial spawn happens.
fn resolve_executable(program: &str) -> Result<PathBuf> {
    let candidate = Path::new(program);
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(HostingError::Spawn(format!(
            "executable '{program}' not found"
        )));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(program);
        if full.is_file() {
            return Ok(full);
        }
    }
    Err(HostingError::Spawn(format!(
        "executable '{program}' not found on PATH"
    )))
}

/// Package-runner launchers with implicit-install semantics.
fn is_package_runner(program: &str) -> bool {
    matches!(basename(program), "npx" | "uvx" | "bunx" | "pipx")
}

fn basename(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

/// Argument vector with launcher fixups applied: `npx` gets `--yes` so a
/// missing dependency auto-installs instead of hanging on a TTY prompt that
/// will never arrive.
fn launcher_args(program: &str, args: &[String]) -> Vec<String> {
    let mut out: Vec<String> = args.to_vec();
    if basename(program) == "npx"
        && !args.iter().any(|a| a == "--yes" || a == "-y")
    {
        out.insert(0, "--yes".to_string());
    }
    out
}

/// The fixed environment injected into every child, before the descriptor's
/// user env is overlaid (user values win).
fn injected_env(
    descriptor: &ConnectorDescriptor,
    credential: Option<&Credential>,
    api_base_url: Option<&str>,
    program: &str,
    home_override: Option<&Path>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("SAGEMCP_TENANT_ID".to_string(), descriptor.tenant_id.clone());
    env.insert(
        "SAGEMCP_CONNECTOR_ID".to_string(),
        descriptor.connector_id.clone(),
    );
    env.insert("SAGEMCP_MODE".to_string(), "hosted".to_string());

    if let Some(cred) = credential {
        // Two alias names for compatibility with servers that expect either.
        env.insert(
            "SAGEMCP_OAUTH_ACCESS_TOKEN".to_string(),
            cred.bearer_token.clone(),
        );
        env.insert("OAUTH_ACCESS_TOKEN".to_string(), cred.bearer_token.clone());
    }
    if let Some(base) = api_base_url {
        env.insert("SAGEMCP_API_BASE_URL".to_string(), base.to_string());
    }

    let home = home_override.map(Path::to_path_buf).or_else(|| {
        std::env::var_os("HOME").map(PathBuf::from)
    });
    if let Some(home) = &home {
        if let Some(h) = home_override {
            env.insert("HOME".to_string(), h.display().to_string());
        }
        if is_package_runner(program) {
            // Package runners need a writable cache even in restricted
            // sandboxes.
            env.insert(
                "NPM_CONFIG_CACHE".to_string(),
                home.join(".npm").display().to_string(),
            );
            env.insert(
                "UV_CACHE_DIR".to_string(),
                home.join(".cache/uv").display().to_string(),
            );
        }
    }
    env
}

fn home_is_usable() -> bool {
    let Some(home) = std::env::var_os("HOME") else {
        return false;
    };
    if home.is_empty() {
        return false;
    }
    let path = Path::new(&home);
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    meta.is_dir() && !meta.permissions().readonly()
}
