//! Supervisor for the agent subprocess.
//!
//! Keeps at most one agent process alive, frames its stdout into discrete
//! JSON messages, correlates request/response pairs by id, and broadcasts
//! everything else as notifications. Crashes are recovered with a capped
//! linear backoff; the in-flight request set is failed on every exit.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use tokio::task::JoinHandle;

use tether_protocol::{AgentMessage, request_line};

/// Size of the notification broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// How long stderr/stdout lines are allowed to get in diagnostics.
const DIAG_TRUNCATE_CHARS: usize = 200;

/// Configuration for the agent supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the agent binary.
    pub binary: PathBuf,
    /// Arguments passed to the agent.
    pub args: Vec<String>,
    /// Working directory for the agent.
    pub workdir: Option<PathBuf>,
    /// Default timeout for [`AgentSupervisor::call`].
    pub call_timeout: Duration,
    /// Upper bound on the restart backoff delay.
    pub backoff_cap: Duration,
    /// Grace period between SIGTERM and SIGKILL on dispose.
    pub kill_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pi"),
            args: vec!["--mode".to_string(), "rpc".to_string()],
            workdir: None,
            call_timeout: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(30),
            kill_grace: Duration::from_secs(3),
        }
    }
}

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Starting,
    Running,
    Stopped,
    Errored,
}

/// Snapshot returned by [`AgentSupervisor::health`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub status: RuntimeStatus,
    pub pid: Option<u32>,
    pub restart_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A notification broadcast to bridge subscribers.
///
/// Ephemeral: subscribers that connect late miss prior notifications.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: NotificationBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationBody {
    /// Unsolicited message from the agent.
    Event {
        event_type: String,
        data: Option<Value>,
    },
    /// Supervisor status transition or periodic snapshot.
    Status { health: AgentHealth },
    /// Diagnostic: stderr output, malformed lines, process exits.
    Error { message: String },
}

impl Notification {
    fn event(event_type: String, data: Option<Value>) -> Self {
        Self {
            at: Utc::now(),
            body: NotificationBody::Event { event_type, data },
        }
    }

    pub fn status(health: AgentHealth) -> Self {
        Self {
            at: Utc::now(),
            body: NotificationBody::Status { health },
        }
    }

    fn error(message: String) -> Self {
        Self {
            at: Utc::now(),
            body: NotificationBody::Error { message },
        }
    }
}

/// Failure modes of a single [`AgentSupervisor::call`].
#[derive(Debug, Error)]
pub enum CallError {
    /// No process to talk to (spawn failed, disposed, write failed).
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    /// The agent answered with `success: false`.
    #[error("{0}")]
    Rejected(String),
    /// No response arrived before the deadline.
    #[error("timed out after {ms}ms waiting for '{cmd}' response", ms = .0.as_millis(), cmd = .1)]
    Timeout(Duration, String),
    /// The process exited while the call was in flight.
    #[error("agent exited before responding: {0}")]
    ProcessExited(String),
}

/// One in-flight request awaiting its response line.
struct PendingEntry {
    command: String,
    tx: oneshot::Sender<Result<Value, CallError>>,
}

/// Handle to the current process generation. Replaced wholesale on restart,
/// never mutated in place.
struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    stdin: Mutex<ChildStdin>,
}

/// Mutable bookkeeping behind the health snapshot.
#[derive(Default)]
struct Stats {
    restart_count: u64,
    started_at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Shared {
    config: SupervisorConfig,
    status: RwLock<RuntimeStatus>,
    handle: RwLock<Option<ProcessHandle>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    stats: RwLock<Stats>,
    next_request: AtomicU64,
    next_generation: AtomicU64,
    disposed: AtomicBool,
    /// At most one restart timer is pending at a time.
    restart_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes spawns so concurrent `ensure_started` callers join one.
    spawn_lock: Mutex<()>,
    events: broadcast::Sender<Notification>,
}

/// Supervisor owning the lifecycle of one agent process.
pub struct AgentSupervisor {
    shared: Arc<Shared>,
}

impl AgentSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            shared: Arc::new(Shared {
                config,
                status: RwLock::new(RuntimeStatus::Stopped),
                handle: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                stats: RwLock::new(Stats::default()),
                next_request: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                restart_task: Mutex::new(None),
                spawn_lock: Mutex::new(()),
                events,
            }),
        }
    }

    /// Subscribe to supervisor notifications. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.events.subscribe()
    }

    /// Start the agent process if it is not already running.
    ///
    /// Idempotent; concurrent callers while a spawn is in flight queue on
    /// the spawn lock and observe the single resulting process.
    pub async fn ensure_started(&self) -> Result<()> {
        self.shared.ensure_started().await
    }

    /// Send one request to the agent and await its correlated response.
    ///
    /// Resolves to the response `data` when the agent reports success,
    /// fails with the agent's error text on an explicit failure, on
    /// timeout, or immediately when no process is available. A response
    /// arriving after the timeout fired is ignored.
    pub async fn call(
        &self,
        command: &str,
        params: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let shared = &self.shared;
        if shared.disposed.load(Ordering::SeqCst) {
            return Err(CallError::Unavailable("supervisor is disposed".to_string()));
        }
        shared
            .ensure_started()
            .await
            .map_err(|e| CallError::Unavailable(format!("{e:#}")))?;

        let id = format!("req-{}", shared.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        let line = request_line(&id, command, params)
            .map_err(|e| CallError::Unavailable(format!("failed to encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = shared.pending.lock().await;
            pending.insert(
                id.clone(),
                PendingEntry {
                    command: command.to_string(),
                    tx,
                },
            );
        }

        if let Err(err) = shared.write_line(&line).await {
            shared.pending.lock().await.remove(&id);
            return Err(err);
        }
        debug!("sent '{command}' as {id}");

        let timeout = timeout.unwrap_or(shared.config.call_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving; only happens if the pending
            // map was torn down without failing entries, which exit handling
            // never does. Treat as an exit.
            Ok(Err(_)) => Err(CallError::ProcessExited(
                "response channel closed".to_string(),
            )),
            Err(_) => {
                shared.pending.lock().await.remove(&id);
                Err(CallError::Timeout(timeout, command.to_string()))
            }
        }
    }

    /// Pure read of the current supervisor state. Available even while
    /// disposed.
    pub async fn health(&self) -> AgentHealth {
        self.shared.health().await
    }

    /// Permanently shut the supervisor down.
    ///
    /// Cancels any pending restart, fails all in-flight calls, closes the
    /// agent's stdin, sends SIGTERM, and escalates to SIGKILL after the
    /// configured grace period. Idempotent.
    pub async fn dispose(&self) {
        let shared = &self.shared;
        if shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing agent supervisor");

        if let Some(task) = shared.restart_task.lock().await.take() {
            task.abort();
        }

        shared
            .fail_pending(|| CallError::Unavailable("supervisor is disposed".to_string()))
            .await;

        let taken = shared.handle.write().await.take();
        if let Some(handle) = taken {
            let pid = handle.pid;
            // Dropping the handle closes stdin; a well-behaved agent exits
            // on EOF.
            drop(handle);
            if let Some(pid) = pid {
                terminate_with_grace(pid, shared.config.kill_grace).await;
            }
        }

        shared.set_status(RuntimeStatus::Stopped).await;
        shared.emit(Notification::status(shared.health().await));
    }
}

impl Shared {
    async fn ensure_started(self: &Arc<Self>) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            anyhow::bail!("supervisor is disposed");
        }
        if *self.status.read().await == RuntimeStatus::Running {
            return Ok(());
        }

        let _guard = self.spawn_lock.lock().await;
        // A concurrent caller may have finished the spawn while we queued.
        if *self.status.read().await == RuntimeStatus::Running {
            return Ok(());
        }
        if self.disposed.load(Ordering::SeqCst) {
            anyhow::bail!("supervisor is disposed");
        }
        self.spawn_process().await
    }

    /// Spawn a new agent process. Caller must hold the spawn lock.
    ///
    /// Returns a boxed future to break the recursive `Send` inference cycle
    /// (spawn_process -> handle_exit -> schedule_restart -> ensure_started ->
    /// spawn_process) that the compiler cannot resolve through opaque
    /// `async fn` return types.
    fn spawn_process<'a>(
        self: &'a Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        self.set_status(RuntimeStatus::Starting).await;
        self.emit(Notification::status(self.health().await));

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref workdir) = self.config.workdir {
            cmd.current_dir(workdir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = format!(
                    "failed to spawn agent '{}': {err}",
                    self.config.binary.display()
                );
                error!("{message}");
                self.stats.write().await.last_error = Some(message.clone());
                self.set_status(RuntimeStatus::Errored).await;
                self.emit(Notification::error(message.clone()));
                return Err(anyhow::anyhow!(message));
            }
        };

        let pid = child.id();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "spawned agent '{}' (pid={:?}, generation={generation})",
            self.config.binary.display(),
            pid
        );

        let stdin = child.stdin.take().context("agent process has no stdin")?;
        let stdout = child.stdout.take().context("agent process has no stdout")?;
        let stderr = child.stderr.take();

        {
            let mut handle = self.handle.write().await;
            *handle = Some(ProcessHandle {
                generation,
                pid,
                stdin: Mutex::new(stdin),
            });
        }
        {
            let mut stats = self.stats.write().await;
            stats.restart_count += 1;
            stats.started_at = Some(Utc::now());
        }
        self.set_status(RuntimeStatus::Running).await;

        tokio::spawn(Self::stdout_reader_task(Arc::clone(self), stdout));
        if let Some(stderr) = stderr {
            tokio::spawn(Self::stderr_reader_task(Arc::clone(self), stderr));
        }
        {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                let reason = match child.wait().await {
                    Ok(status) => format!("agent process exited: {status}"),
                    Err(err) => format!("failed to wait on agent process: {err}"),
                };
                shared.handle_exit(generation, reason).await;
            });
        }

        self.emit(Notification::status(self.health().await));
        Ok(())
        })
    }

    async fn write_line(&self, line: &str) -> Result<(), CallError> {
        let handle = self.handle.read().await;
        let Some(handle) = handle.as_ref() else {
            return Err(CallError::Unavailable(
                "no agent process to write to".to_string(),
            ));
        };
        let mut stdin = handle.stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write
            .await
            .map_err(|e| CallError::Unavailable(format!("failed to write to agent stdin: {e}")))
    }

    async fn stdout_reader_task(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            self.route_line(&line).await;
        }
        debug!("agent stdout closed");
    }

    async fn stderr_reader_task(self: Arc<Self>, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            warn!("agent stderr: {trimmed}");
            let message = format!("agent stderr: {}", truncate(trimmed));
            self.stats.write().await.last_error = Some(message.clone());
            self.emit(Notification::error(message));
        }
        debug!("agent stderr closed");
    }

    /// Handle one complete line of agent stdout.
    async fn route_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        self.stats.write().await.last_event_at = Some(Utc::now());

        match AgentMessage::classify(trimmed) {
            Ok(AgentMessage::Response(response)) => {
                let Some(id) = response.id.as_deref().filter(|id| !id.is_empty()) else {
                    warn!("agent response without id, dropping");
                    return;
                };
                let entry = self.pending.lock().await.remove(id);
                match entry {
                    Some(entry) => {
                        let outcome = if response.success {
                            Ok(response.data.unwrap_or(Value::Null))
                        } else {
                            Err(CallError::Rejected(response.error.unwrap_or_else(|| {
                                format!("agent rejected '{}'", entry.command)
                            })))
                        };
                        // Receiver may be gone if the caller timed out
                        // between our map lookup and this send.
                        let _ = entry.tx.send(outcome);
                    }
                    // Late response after a timeout already fired, or a
                    // response from before a restart. Not an error.
                    None => debug!("response for unknown request id {id}, ignoring"),
                }
            }
            Ok(AgentMessage::Event(event)) => {
                self.emit(Notification::event(event.event_type, event.data));
            }
            Err(err) => {
                let message = format!("malformed agent output ({err}): {}", truncate(trimmed));
                warn!("{message}");
                self.stats.write().await.last_error = Some(message.clone());
                self.emit(Notification::error(message));
            }
        }
    }

    /// Tear down after a process exit. No-op when the handle for this
    /// generation is already gone (disposed, or a stale waiter).
    async fn handle_exit(self: &Arc<Self>, generation: u64, reason: String) {
        {
            let mut handle = self.handle.write().await;
            let is_current = handle
                .as_ref()
                .is_some_and(|current| current.generation == generation);
            if !is_current {
                // Disposed, or a waiter from a previous generation.
                return;
            }
            *handle = None;
        }

        warn!("{reason}");
        self.fail_pending(|| CallError::ProcessExited(reason.clone()))
            .await;
        self.stats.write().await.last_error = Some(reason.clone());

        if self.disposed.load(Ordering::SeqCst) {
            self.set_status(RuntimeStatus::Stopped).await;
            return;
        }

        self.set_status(RuntimeStatus::Errored).await;
        self.emit(Notification::error(reason));
        self.emit(Notification::status(self.health().await));
        self.schedule_restart().await;
    }

    async fn schedule_restart(self: &Arc<Self>) {
        let restart_count = self.stats.read().await.restart_count;
        let delay = restart_backoff(restart_count, self.config.backoff_cap);
        info!("restarting agent in {}s", delay.as_secs());

        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.disposed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = shared.ensure_started().await {
                error!("agent restart failed: {err:#}");
            }
        });

        let mut slot = self.restart_task.lock().await;
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Fail every in-flight call with an error produced per entry.
    async fn fail_pending(&self, make_error: impl Fn() -> CallError) {
        let drained: Vec<(String, PendingEntry)> =
            self.pending.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        warn!("failing {} in-flight agent call(s)", drained.len());
        for (id, entry) in drained {
            debug!("failing pending call {id} ({})", entry.command);
            let _ = entry.tx.send(Err(make_error()));
        }
    }

    async fn set_status(&self, status: RuntimeStatus) {
        *self.status.write().await = status;
    }

    async fn health(&self) -> AgentHealth {
        let status = *self.status.read().await;
        let pid = self.handle.read().await.as_ref().and_then(|h| h.pid);
        let stats = self.stats.read().await;
        AgentHealth {
            status,
            pid,
            restart_count: stats.restart_count,
            started_at: stats.started_at,
            last_event_at: stats.last_event_at,
            last_error: stats.last_error.clone(),
        }
    }

    fn emit(&self, notification: Notification) {
        // Returns Err when nobody is subscribed. That is fine.
        let _ = self.events.send(notification);
    }
}

/// Delay before reattempting a spawn: one second per prior successful
/// spawn, capped. The multiplier is the lifetime spawn count, so backoff
/// does not reset after a long healthy run.
fn restart_backoff(restart_count: u64, cap: Duration) -> Duration {
    Duration::from_secs(restart_count.max(1)).min(cap)
}

/// SIGTERM, then SIGKILL once the grace period runs out.
async fn terminate_with_grace(pid: u32, grace: Duration) {
    let pid = pid as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        tokio::time::sleep(poll).await;
        waited += poll;
        // kill(pid, 0) probes for existence without signalling.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return;
        }
    }

    warn!("agent (pid={pid}) did not exit within grace period, sending SIGKILL");
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

fn truncate(line: &str) -> String {
    line.chars().take(DIAG_TRUNCATE_CHARS).collect()
}
