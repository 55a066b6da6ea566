//! Child-process bridge
//!
//! Spawns the configured command and speaks JSON-RPC over its stdin/stdout.
//! The child's stderr is forwarded to the log and never parsed.

use crate::client::{initialize_params, Bridge, BridgeKind, BridgeState, BridgeTimeouts};
use crate::config::BridgeServerConfig;
use crate::connection::{RpcConnection, INITIALIZE_ID, NOTIFICATION_CAPACITY};
use async_trait::async_trait;
use easy_core::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bridge backed by a child process
pub struct StdioBridge {
    name: String,
    config: BridgeServerConfig,
    env: BTreeMap<String, String>,
    timeouts: BridgeTimeouts,
    state: Arc<Mutex<BridgeState>>,
    alive: Arc<AtomicBool>,
    connection: Mutex<Option<Arc<RpcConnection>>>,
    /// Serializes spawning and the handshake
    lifecycle: tokio::sync::Mutex<()>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    notifications: broadcast::Sender<Value>,
}

impl StdioBridge {
    /// `env` is the provider overlay added on top of the server's own
    /// environment
    pub fn new(
        name: impl Into<String>,
        config: BridgeServerConfig,
        env: BTreeMap<String, String>,
        timeouts: BridgeTimeouts,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            name: name.into(),
            config,
            env,
            timeouts,
            state: Arc::new(Mutex::new(BridgeState::Unstarted)),
            alive: Arc::new(AtomicBool::new(false)),
            connection: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            kill_tx: Mutex::new(None),
            supervisor: Mutex::new(None),
            notifications,
        }
    }

    fn set_state(&self, state: BridgeState) {
        set_state(&self.state, state);
    }

    fn connection(&self) -> Option<Arc<RpcConnection>> {
        self.connection.lock().ok().and_then(|c| c.clone())
    }

    fn stopped_error(&self) -> Error {
        Error::stopped(format!("bridge '{}' was stopped", self.name))
    }

    fn spawn(&self) -> Result<()> {
        let command = self.config.command.as_deref().ok_or_else(|| {
            Error::config(format!("bridge '{}' has no command configured", self.name))
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::config(format!(
                "failed to spawn bridge '{}' ({}): {}",
                self.name, command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("child stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.name.clone(), stderr));
        }

        let connection = Arc::new(RpcConnection::with_notifier(
            self.name.clone(),
            stdout,
            stdin,
            self.notifications.clone(),
        ));

        info!(
            bridge = %self.name,
            command = %command,
            pid = child.id().unwrap_or_default(),
            "Spawned bridge process"
        );

        self.alive.store(true, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            self.name.clone(),
            child,
            kill_rx,
            connection.clone(),
            self.alive.clone(),
            self.state.clone(),
        ));

        if let Ok(mut slot) = self.connection.lock() {
            *slot = Some(connection);
        }
        if let Ok(mut slot) = self.kill_tx.lock() {
            *slot = Some(kill_tx);
        }
        if let Ok(mut slot) = self.supervisor.lock() {
            *slot = Some(supervisor);
        }
        Ok(())
    }

    /// Perform the `initialize` handshake once
    async fn ensure_initialized(&self) -> Result<Arc<RpcConnection>> {
        let _guard = self.lifecycle.lock().await;

        let connection = match self.state() {
            BridgeState::Stopped => return Err(self.stopped_error()),
            BridgeState::Failed => {
                return Err(Error::exited(format!(
                    "bridge '{}' is not available (start or initialize failed)",
                    self.name
                )))
            }
            BridgeState::Initialized => {
                return self.connection().ok_or_else(|| self.stopped_error());
            }
            BridgeState::Unstarted | BridgeState::Starting => {
                self.connection().ok_or_else(|| self.stopped_error())?
            }
        };

        debug!(bridge = %self.name, "Initializing bridge");
        match connection
            .request_with_id(
                INITIALIZE_ID,
                "initialize",
                Some(initialize_params()),
                self.timeouts.initialize,
            )
            .await
        {
            Ok(result) => {
                let server = result
                    .get("serverInfo")
                    .and_then(|info| info.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                info!(bridge = %self.name, server = %server, "Bridge initialized");

                if let Err(e) = connection.notify("notifications/initialized", None).await {
                    warn!(bridge = %self.name, "Failed to send initialized notification: {}", e);
                }
                if self.state() != BridgeState::Stopped {
                    self.set_state(BridgeState::Initialized);
                }
                Ok(connection)
            }
            Err(e) => {
                if self.state() != BridgeState::Stopped {
                    // Process stays up so its stderr keeps reaching the log
                    self.set_state(BridgeState::Failed);
                    warn!(bridge = %self.name, "Bridge initialize failed: {}", e);
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Bridge for StdioBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BridgeKind {
        BridgeKind::Process
    }

    fn state(&self) -> BridgeState {
        self.state.lock().map(|s| *s).unwrap_or(BridgeState::Failed)
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            BridgeState::Unstarted => {}
            BridgeState::Stopped => return Err(self.stopped_error()),
            _ => return Ok(()),
        }

        self.set_state(BridgeState::Starting);
        self.spawn().map_err(|e| {
            self.set_state(BridgeState::Failed);
            e
        })
    }

    async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if self.state() == BridgeState::Unstarted {
            self.start().await?;
        }
        let connection = self.ensure_initialized().await?;
        connection.request(method, params, timeout).await
    }

    async fn stop(&self) {
        self.set_state(BridgeState::Stopped);

        if let Some(connection) = self.connection() {
            connection.close(&format!("bridge '{}' was stopped", self.name));
        }
        let kill_tx = self.kill_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        let supervisor = self.supervisor.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        info!(bridge = %self.name, "Bridge stopped");
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.state().is_usable()
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }
}

fn set_state(slot: &Mutex<BridgeState>, state: BridgeState) {
    if let Ok(mut current) = slot.lock() {
        *current = state;
    }
}

/// Wait for the child to exit (or for a kill request) and reject whatever is
/// still pending
async fn supervise(
    name: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    connection: Arc<RpcConnection>,
    alive: Arc<AtomicBool>,
    state: Arc<Mutex<BridgeState>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!(bridge = %name, "Kill failed: {}", e);
            }
            child.wait().await
        }
    };

    alive.store(false, Ordering::SeqCst);
    let description = match &status {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    };

    let rejected = connection.fail_all(|| {
        Error::exited(format!("bridge '{}' process exited ({})", name, description))
    });

    let was_stopped = state
        .lock()
        .map(|s| *s == BridgeState::Stopped)
        .unwrap_or(false);
    if was_stopped {
        debug!(bridge = %name, status = %description, "Bridge process ended");
    } else {
        set_state(&state, BridgeState::Failed);
        warn!(bridge = %name, status = %description, rejected, "Bridge process exited");
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(bridge = %name, "stderr: {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(bridge = %name, "stderr read failed: {}", e);
                break;
            }
        }
    }
}
