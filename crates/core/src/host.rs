use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use gatehouse_protocol::{ApiError, ErrorCode, Jsep};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::plugin::{GatewayCallbacks, Plugin, PluginInfo};
use crate::session::Handle;

/// A control message queued for a plugin's worker.
pub struct InboundMessage {
    pub handle: Arc<Handle>,
    pub transaction: Option<String>,
    pub body: Value,
    /// Already anonymized by the SDP bridge.
    pub jsep: Option<Jsep>,
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    tx: mpsc::UnboundedSender<InboundMessage>,
    // Taken by the worker when the host starts.
    rx: StdMutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

/// Owns the loaded plugins: validates them at registration, initializes them
/// with the callback surface, runs one message worker per plugin and exposes
/// them by package name.
pub struct PluginHost {
    plugins: HashMap<String, PluginEntry>,
    // Registration order; destruction runs in reverse.
    order: Vec<String>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Validate and register a plugin. Incomplete metadata and duplicate
    /// package names are rejected.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> anyhow::Result<()> {
        let info = plugin.info();
        if info.package.is_empty() || info.name.is_empty() || info.version_string.is_empty() {
            anyhow::bail!("plugin metadata is incomplete");
        }
        if info.version == 0 {
            anyhow::bail!("plugin '{}' reports version 0", info.package);
        }
        if self.plugins.contains_key(info.package) {
            anyhow::bail!("duplicate plugin package '{}'", info.package);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.plugins.insert(
            info.package.to_string(),
            PluginEntry {
                plugin,
                tx,
                rx: StdMutex::new(Some(rx)),
            },
        );
        self.order.push(info.package.to_string());
        Ok(())
    }

    pub fn get(&self, package: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(package).map(|entry| entry.plugin.clone())
    }

    pub fn infos(&self) -> Vec<PluginInfo> {
        self.order
            .iter()
            .filter_map(|pkg| self.plugins.get(pkg))
            .map(|entry| entry.plugin.info())
            .collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Queue a message for the owning plugin's worker.
    pub fn dispatch(&self, message: InboundMessage) -> Result<(), ApiError> {
        let package = message.handle.plugin().info().package;
        let entry = self.plugins.get(package).ok_or_else(|| {
            ApiError::with_reason(ErrorCode::PluginNotFound, format!("No such plugin '{package}'"))
        })?;
        entry.tx.send(message).map_err(|_| {
            ApiError::with_reason(
                ErrorCode::PluginMessage,
                format!("Worker for plugin '{package}' is gone"),
            )
        })
    }

    /// Initialize every plugin with the callback surface and spawn its
    /// message worker. Called once during startup.
    pub async fn start(
        &self,
        gateway: Arc<dyn GatewayCallbacks>,
        plugins_folder: &Path,
        stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        for package in &self.order {
            let entry = &self.plugins[package];
            let config_dir = plugins_folder.join(package);
            entry
                .plugin
                .init(gateway.clone(), &config_dir)
                .await
                .with_context(|| format!("initializing plugin '{package}'"))?;

            let rx = entry.rx.lock().unwrap_or_else(|e| e.into_inner()).take();
            match rx {
                Some(rx) => {
                    tokio::spawn(run_worker(entry.plugin.clone(), rx, stop.clone()));
                }
                None => anyhow::bail!("plugin '{package}' was started twice"),
            }
            let info = entry.plugin.info();
            tracing::info!(
                plugin = %package,
                version = info.version_string,
                "Plugin loaded: {}",
                info.name
            );
        }
        Ok(())
    }

    /// Tear plugins down in reverse registration order.
    pub async fn destroy_all(&self) {
        for package in self.order.iter().rev() {
            if let Some(entry) = self.plugins.get(package) {
                entry.plugin.destroy().await;
                tracing::info!(plugin = %package, "Plugin destroyed");
            }
        }
    }
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Single consumer per plugin: message order is FIFO across all of the
/// plugin's handles, and the plugin never sees re-entrant `handle_message`
/// calls.
async fn run_worker(
    plugin: Arc<dyn Plugin>,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    mut stop: watch::Receiver<bool>,
) {
    let package = plugin.info().package;
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                let session = message.handle.session();
                let alive = session.map(|s| !s.is_destroyed()).unwrap_or(false)
                    && !message.handle.is_detached();
                if !alive {
                    tracing::debug!(
                        plugin = package,
                        handle_id = message.handle.id(),
                        "Dropping message for destroyed session"
                    );
                    continue;
                }
                if let Err(e) = plugin
                    .handle_message(
                        &message.handle,
                        message.transaction.as_deref(),
                        message.body,
                        message.jsep,
                    )
                    .await
                {
                    tracing::warn!(
                        plugin = package,
                        handle_id = message.handle.id(),
                        "Plugin failed to handle message: {e:#}"
                    );
                }
            }
            result = stop.changed() => {
                if result.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(plugin = package, "Plugin worker exited");
}
