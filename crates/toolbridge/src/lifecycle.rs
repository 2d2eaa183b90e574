//! Command server lifecycle: spawn, readiness, supervision, teardown.
//!
//! The manager owns the child process handle and its listening port across
//! start/stop/restart cycles, including one-shot port-conflict remediation.
//! State is published through a watch channel so dependents observe
//! transitions instead of trusting a cached port.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::channel::BridgeChannel;
use crate::protocol::Message;

/// Environment variable carrying the negotiated port to the child.
pub const PORT_ENV: &str = "TOOLBRIDGE_PORT";

/// Lifecycle of the supervised command server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Running { port: u16 },
    Stopping,
    Stopped,
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Remediation was attempted once and the port is still occupied.
    #[error("port {port} is in use and remediation failed")]
    PortConflict { port: u16 },

    #[error("failed to spawn command server: {0}")]
    Spawn(String),

    #[error("command server never signaled readiness within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("failed to stop command server: {0}")]
    Stop(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Extension point for different server spawn strategies.
pub trait ServerSpawner: Send + Sync {
    /// Spawn the command server with piped stdio and the port available to it.
    fn spawn(&self, port: u16) -> Result<Child, SpawnError>;
}

/// Spawner running a configurable program with the port in an environment
/// variable.
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
    port_env: String,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            port_env: PORT_ENV.to_string(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port_env(mut self, var: impl Into<String>) -> Self {
        self.port_env = var.into();
        self
    }
}

impl ServerSpawner for CommandSpawner {
    fn spawn(&self, port: u16) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(&self.port_env, port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Platform hook for freeing an occupied port.
pub trait PortRemediator: Send + Sync {
    /// PID of the process listening on the port, if identifiable.
    fn owner_of(&self, port: u16) -> Option<u32>;

    fn kill(&self, pid: u32) -> std::io::Result<()>;
}

/// Remediator using `lsof` to find the listener and SIGKILL to remove it.
pub struct SystemRemediator;

impl PortRemediator for SystemRemediator {
    #[cfg(unix)]
    fn owner_of(&self, port: u16) -> Option<u32> {
        let output = std::process::Command::new("lsof")
            .args(["-ti", &format!("tcp:{}", port), "-sTCP:LISTEN"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()?
            .trim()
            .parse()
            .ok()
    }

    #[cfg(not(unix))]
    fn owner_of(&self, _port: u16) -> Option<u32> {
        None
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> std::io::Result<()> {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn kill(&self, _pid: u32) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "port remediation is not supported on this platform",
        ))
    }
}

/// Bind-and-release availability probe; not a remote health check.
fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub struct LifecycleConfig {
    pub port: u16,
    /// Quiet window granted to the `Ready` handshake before the HTTP liveness
    /// probe joins the race.
    pub ready_window: Duration,
    /// Overall budget for one start attempt.
    pub start_timeout: Duration,
    /// Grace period between SIGTERM and force-kill.
    pub stop_grace: Duration,
    pub spawner: Arc<dyn ServerSpawner>,
    pub remediator: Arc<dyn PortRemediator>,
}

impl LifecycleConfig {
    pub fn new(port: u16, spawner: Arc<dyn ServerSpawner>) -> Self {
        Self {
            port,
            ready_window: Duration::from_secs(2),
            start_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            spawner,
            remediator: Arc::new(SystemRemediator),
        }
    }

    pub fn with_ready_window(mut self, window: Duration) -> Self {
        self.ready_window = window;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_remediator(mut self, remediator: Arc<dyn PortRemediator>) -> Self {
        self.remediator = remediator;
        self
    }
}

struct StopRequest {
    ack: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    stop_tx: Option<mpsc::Sender<StopRequest>>,
    channel: Option<BridgeChannel>,
}

/// Explicitly owned, constructible manager — no process-global singleton.
pub struct ProcessLifecycleManager {
    config: LifecycleConfig,
    state: watch::Sender<ServerState>,
    inner: Mutex<Inner>,
}

impl ProcessLifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        let (state, _) = watch::channel(ServerState::NotStarted);
        Self {
            config,
            state,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state.borrow().clone()
    }

    /// Observe state transitions (e.g. unexpected child exit).
    pub fn watch(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// The channel to the running server, for [`CommandBridge::serve`].
    ///
    /// [`CommandBridge::serve`]: crate::bridge::CommandBridge::serve
    pub async fn take_channel(&self) -> Option<BridgeChannel> {
        self.inner.lock().await.channel.take()
    }

    /// Start the command server on the configured port.
    ///
    /// A no-op success when already running. Concurrent callers queue on the
    /// internal lock and observe the in-flight attempt's outcome instead of
    /// spawning a second process.
    pub async fn start(&self) -> Result<u16, LifecycleError> {
        let mut inner = self.inner.lock().await;
        if let ServerState::Running { port } = self.state() {
            tracing::debug!(port, "Command server already running");
            return Ok(port);
        }

        self.state.send_replace(ServerState::Starting);
        match self.start_locked(&mut inner).await {
            Ok(port) => {
                self.state.send_replace(ServerState::Running { port });
                tracing::info!(port, "Command server running");
                Ok(port)
            }
            Err(e) => {
                self.state.send_replace(ServerState::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<u16, LifecycleError> {
        let port = self.config.port;

        if !port_is_free(port) {
            tracing::warn!(port, "Port occupied, attempting remediation");
            // One attempt, never retried in a loop.
            match self.config.remediator.owner_of(port) {
                Some(pid) => {
                    tracing::info!(port, pid, "Killing process holding the port");
                    if let Err(e) = self.config.remediator.kill(pid) {
                        tracing::warn!(pid, error = %e, "Failed to kill port owner");
                    }
                    // Give the kernel a moment to release the socket.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                None => {
                    tracing::warn!(port, "Could not identify the port owner");
                }
            }
            if !port_is_free(port) {
                return Err(LifecycleError::PortConflict { port });
            }
        }

        tracing::info!(port, "Spawning command server");
        let mut child = self
            .config
            .spawner
            .spawn(port)
            .map_err(|e| LifecycleError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LifecycleError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LifecycleError::Spawn("stdout not captured".to_string()))?;
        let mut channel = BridgeChannel::new(stdout, stdin);

        if let Err(e) = self.await_readiness(&mut channel, port).await {
            tracing::warn!(error = %e, "Readiness failed, killing partially started server");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(supervise_child(
            child,
            stop_rx,
            self.state.clone(),
            self.config.stop_grace,
        ));
        inner.stop_tx = Some(stop_tx);
        inner.channel = Some(channel);
        Ok(port)
    }

    /// Race the explicit `Ready` handshake against the liveness endpoint;
    /// whichever succeeds first resolves the start.
    async fn await_readiness(
        &self,
        channel: &mut BridgeChannel,
        port: u16,
    ) -> Result<(), LifecycleError> {
        let ready_window = self.config.ready_window;
        let start_timeout = self.config.start_timeout;
        let url = format!("http://127.0.0.1:{}/health", port);

        let handshake = async {
            match channel.recv().await {
                Some(Message::Ready) => {
                    tracing::debug!("Ready handshake received");
                    Ok(())
                }
                Some(other) => {
                    // Any valid protocol traffic proves the server is up.
                    tracing::debug!(?other, "Channel live before explicit handshake");
                    Ok(())
                }
                None => Err(LifecycleError::Spawn(
                    "command server closed the channel before signaling readiness".to_string(),
                )),
            }
        };

        let probe = async {
            tokio::time::sleep(ready_window).await;
            let client = match reqwest::Client::builder().build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(error = %e, "HTTP probe unavailable, relying on the handshake");
                    return std::future::pending().await;
                }
            };
            loop {
                match client
                    .get(&url)
                    .timeout(Duration::from_millis(500))
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(%url, "Liveness probe succeeded");
                        return Ok::<(), LifecycleError>(());
                    }
                    Ok(response) => {
                        tracing::trace!(status = %response.status(), "Liveness probe rejected");
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, "Liveness probe failed");
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };

        let raced = async {
            tokio::select! {
                result = handshake => result,
                result = probe => result,
            }
        };

        match tokio::time::timeout(start_timeout, raced).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::ReadinessTimeout(start_timeout)),
        }
    }

    /// Gracefully stop the command server. Idempotent: stopping a
    /// never-started or already-stopped manager succeeds.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock().await;
        inner.channel = None;

        let Some(stop_tx) = inner.stop_tx.take() else {
            tracing::debug!("Stop requested but no server is supervised");
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(StopRequest { ack: ack_tx }).await.is_err() {
            // Supervisor already finished: the child exited on its own and
            // state reflects that.
            return Ok(());
        }
        ack_rx
            .await
            .map_err(|_| LifecycleError::Stop("supervisor dropped the stop request".to_string()))
    }

    /// `stop()` then `start()`; a stop failure aborts the restart so a stuck
    /// old process is never masked by a new one.
    pub async fn restart(&self) -> Result<u16, LifecycleError> {
        self.stop().await?;
        self.start().await
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

async fn graceful_stop(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    send_sigterm(child);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            tracing::debug!("Command server exited within the grace period");
        }
        Err(_) => {
            tracing::warn!("Grace period elapsed, force-killing command server");
            let _ = child.kill().await;
        }
    }
}

/// Own the child for its lifetime: route stop requests through here and
/// publish unexpected exits so dependents re-evaluate liveness.
async fn supervise_child(
    mut child: Child,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    state: watch::Sender<ServerState>,
    grace: Duration,
) {
    let exit = tokio::select! {
        status = child.wait() => status,
        request = stop_rx.recv() => {
            match request {
                Some(request) => {
                    state.send_replace(ServerState::Stopping);
                    graceful_stop(&mut child, grace).await;
                    state.send_replace(ServerState::Stopped);
                    let _ = request.ack.send(());
                    return;
                }
                // Manager dropped without stopping; keep supervising.
                None => child.wait().await,
            }
        }
    };

    match exit {
        Ok(status) if status.success() => {
            tracing::info!("Command server exited cleanly");
            state.send_replace(ServerState::Stopped);
        }
        Ok(status) => {
            tracing::warn!(%status, "Command server exited unexpectedly");
            state.send_replace(ServerState::Failed {
                reason: format!("command server exited: {}", status),
            });
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for command server");
            state.send_replace(ServerState::Failed {
                reason: format!("failed to wait for command server: {}", e),
            });
        }
    }
}
