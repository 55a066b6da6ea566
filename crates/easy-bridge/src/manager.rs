//! Bridge Manager
//!
//! Single source of truth for which providers exist right now. The whole set
//! is started, stopped and restarted together; bridges are never restarted
//! one at a time.

use crate::client::{Bridge, BridgeKind, BridgeTimeouts};
use crate::config::{bridge_env, BridgeConfig, BridgeEndpoint, BridgeServerConfig};
use crate::http::HttpBridge;
use crate::stdio::StdioBridge;
use async_trait::async_trait;
use easy_core::{Error, Result, Settings};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Settings of the Bridge Manager
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Resolved configuration file; None disables bridges
    pub config_path: Option<PathBuf>,
    pub timeouts: BridgeTimeouts,
    /// Wait after starting the set before checking which bridges survived
    pub grace: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            timeouts: BridgeTimeouts::default(),
            grace: Duration::from_millis(500),
        }
    }
}

impl BridgeSettings {
    /// Bridge settings from server settings, with the config file already
    /// resolved
    pub fn from_settings(settings: &Settings, config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            timeouts: BridgeTimeouts {
                initialize: settings.bridge_init_timeout(),
                call: settings.bridge_call_timeout(),
            },
            grace: settings.bridge_grace(),
        }
    }
}

/// Something published by the manager
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Notification pushed by a provider, forwarded verbatim
    Notification { bridge: String, message: Value },
    /// The whole set was restarted
    Restarted { count: usize },
}

/// Provider of live bridges for the tool catalog
#[async_trait]
pub trait BridgeSource: Send + Sync {
    async fn live_bridges(&self) -> Vec<Arc<dyn Bridge>>;
}

pub struct BridgeManager {
    settings: BridgeSettings,
    /// None until the set has been started
    bridges: RwLock<Option<Vec<Arc<dyn Bridge>>>>,
    events: broadcast::Sender<BridgeEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeManager {
    pub fn new(settings: BridgeSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            bridges: RwLock::new(None),
            events,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.settings.config_path.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Start the configured set unless it is already running
    pub async fn ensure_bridges(&self) -> Vec<Arc<dyn Bridge>> {
        if let Some(bridges) = self.bridges.read().await.as_ref() {
            return bridges.clone();
        }

        let mut guard = self.bridges.write().await;
        if let Some(bridges) = guard.as_ref() {
            return bridges.clone();
        }
        let bridges = self.start_all().await;
        *guard = Some(bridges.clone());
        bridges
    }

    /// Stop every bridge, then start the set again from the current config.
    ///
    /// The registry stays write-locked throughout, so no caller can pick up a
    /// bridge from a half-restarted set.
    pub async fn restart_bridges(&self) -> usize {
        let mut guard = self.bridges.write().await;
        if let Some(old) = guard.take() {
            info!(count = old.len(), "Stopping bridges for restart");
            self.stop_set(old).await;
        }

        let bridges = self.start_all().await;
        let count = bridges.len();
        *guard = Some(bridges);
        drop(guard);

        info!(count, "Bridges restarted");
        let _ = self.events.send(BridgeEvent::Restarted { count });
        count
    }

    /// Stop every bridge and clear the registry
    pub async fn stop_all(&self) {
        let mut guard = self.bridges.write().await;
        if let Some(old) = guard.take() {
            self.stop_set(old).await;
        }
    }

    /// Running bridges that can take calls
    pub async fn live_bridges(&self) -> Vec<Arc<dyn Bridge>> {
        self.ensure_bridges()
            .await
            .into_iter()
            .filter(|b| b.is_alive())
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Bridge>> {
        self.live_bridges().await.into_iter().find(|b| b.name() == name)
    }

    async fn stop_set(&self, bridges: Vec<Arc<dyn Bridge>>) {
        futures::future::join_all(bridges.iter().map(|b| b.stop())).await;
        let forwarders = self
            .forwarders
            .lock()
            .map(|mut f| std::mem::take(&mut *f))
            .unwrap_or_default();
        for task in forwarders {
            task.abort();
        }
    }

    async fn start_all(&self) -> Vec<Arc<dyn Bridge>> {
        let Some(path) = self.settings.config_path.as_deref() else {
            debug!("No bridge config, bridges disabled");
            return Vec::new();
        };
        let config = match BridgeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "Failed to load bridge config: {}", e);
                return Vec::new();
            }
        };

        let vars: Vec<(String, String)> = std::env::vars().collect();
        let mut started: Vec<Arc<dyn Bridge>> = Vec::new();
        for (name, server) in config.enabled() {
            let bridge = match self.build(name, server, &vars) {
                Ok(bridge) => bridge,
                Err(e) => {
                    warn!(bridge = %name, "Failed to create bridge: {}", e);
                    continue;
                }
            };
            if let Err(e) = bridge.start().await {
                warn!(bridge = %name, "Failed to start bridge: {}", e);
                continue;
            }
            self.forward_notifications(&bridge);
            started.push(bridge);
        }

        if started.iter().any(|b| b.kind() == BridgeKind::Process) {
            tokio::time::sleep(self.settings.grace).await;
        }

        started
            .into_iter()
            .filter(|bridge| {
                let alive = bridge.is_alive();
                if !alive {
                    warn!(bridge = %bridge.name(), "Bridge exited during startup, excluded");
                }
                alive
            })
            .collect()
    }

    fn build(
        &self,
        name: &str,
        server: &BridgeServerConfig,
        vars: &[(String, String)],
    ) -> Result<Arc<dyn Bridge>> {
        match server.endpoint() {
            Some(BridgeEndpoint::Http { url }) => Ok(Arc::new(HttpBridge::new(
                name,
                url,
                server.headers.clone(),
                self.settings.timeouts,
            )?)),
            Some(BridgeEndpoint::Process { .. }) => {
                let env = bridge_env(server, name, vars.iter().cloned());
                Ok(Arc::new(StdioBridge::new(
                    name,
                    server.clone(),
                    env,
                    self.settings.timeouts,
                )))
            }
            None => Err(Error::config(format!(
                "bridge '{}' has neither 'command' nor 'url'",
                name
            ))),
        }
    }

    fn forward_notifications(&self, bridge: &Arc<dyn Bridge>) {
        let mut rx = bridge.subscribe();
        let events = self.events.clone();
        let name = bridge.name().to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let _ = events.send(BridgeEvent::Notification {
                            bridge: name.clone(),
                            message,
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(bridge = %name, skipped, "Dropped bridge notifications");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.push(task);
        }
    }
}

#[async_trait]
impl BridgeSource for BridgeManager {
    async fn live_bridges(&self) -> Vec<Arc<dyn Bridge>> {
        BridgeManager::live_bridges(self).await
    }
}
