//! Managed application boundary.
//!
//! Each supported application is driven through the [`AppAdapter`]
//! capability set: persist the public port into the application's own
//! preference store, launch it, ask it to quit, and summarise its state
//! for display.  The engine owns one [`ManagedApp`] per configured
//! identifier and is the only writer of its runtime state.
//!
//! Adapters talk to the OS through `defaults`, `open` and `osascript`;
//! those commands are the platform capability this daemon depends on but
//! does not reimplement.

use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use thiserror::Error;
use tokio::process::Command;

use crate::types::{AppConfig, AppRuntimeState, AppStatus};

pub mod folx;
pub mod transmission;

/// Upper bound on any single adapter command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Persisting the port into the application's configuration failed.
    #[error("failed to persist port: {0}")]
    Apply(String),
    /// A start or stop command failed.
    #[error("lifecycle command failed: {0}")]
    Lifecycle(String),
}

/// Capability set implemented once per supported application.
#[async_trait]
pub trait AppAdapter: Send {
    /// Persist `port` into the application's configuration store.
    /// Idempotent; a failure leaves the previous value in place.
    async fn apply(&mut self, port: u16) -> Result<(), AdapterError>;

    /// Launch the application.  Fire-and-forget; the application is not
    /// guaranteed to be ready when this returns.
    async fn start(&mut self) -> Result<(), AdapterError>;

    /// Request graceful termination.  Settling is the engine's job (it
    /// waits the stop grace interval before any follow-up command).
    async fn stop(&mut self) -> Result<(), AdapterError>;

    /// Short status summary for display.  Must not perform unbounded I/O.
    fn describe(&self) -> String;
}

/// A configured application paired with its adapter and runtime state.
pub struct ManagedApp {
    pub config: AppConfig,
    pub state: AppRuntimeState,
    adapter: Box<dyn AppAdapter>,
}

impl std::fmt::Debug for ManagedApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedApp")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ManagedApp {
    pub fn new(config: AppConfig, adapter: Box<dyn AppAdapter>) -> Self {
        Self {
            config,
            state: AppRuntimeState::Stopped,
            adapter,
        }
    }

    /// Persist the current port, then launch.  The apply always precedes
    /// the start; an apply failure is logged and the launch proceeds with
    /// the application's previous port.
    pub async fn apply_and_start(&mut self, port: u16) {
        if let Err(e) = self.adapter.apply(port).await {
            warn!("[{}] {}", self.config.id, e);
        }
        match self.adapter.start().await {
            Ok(()) => {
                info!("[{}] started on port {}", self.config.id, port);
                self.state = AppRuntimeState::Running;
            }
            Err(e) => {
                error!("[{}] {}", self.config.id, e);
                self.state = AppRuntimeState::Stopped;
            }
        }
    }

    /// Ask the application to quit and record the target state
    /// (`Stopped`, or `Restarting` when an apply/start will follow).
    pub async fn request_stop(&mut self, next: AppRuntimeState) {
        if let Err(e) = self.adapter.stop().await {
            // The grace interval still applies; treat the app as settled.
            error!("[{}] {}", self.config.id, e);
        } else {
            info!("[{}] stop requested", self.config.id);
        }
        self.state = next;
    }

    pub fn status(&self) -> AppStatus {
        AppStatus {
            config: self.config.clone(),
            state: self.state,
            detail: self.adapter.describe(),
        }
    }
}

/// Look up a built-in adapter by identifier.
pub fn lookup(id: &str) -> Option<ManagedApp> {
    match id {
        folx::ID => Some(folx::managed()),
        transmission::ID => Some(transmission::managed()),
        _ => None,
    }
}

/// Identifiers and flags of every built-in adapter, for `portglue apps`.
pub fn builtin() -> Vec<AppConfig> {
    [folx::ID, transmission::ID]
        .into_iter()
        .filter_map(lookup)
        .map(|app| app.config)
        .collect()
}

/// Resolve the configured identifiers against the registry.  Unknown or
/// duplicate identifiers abort startup.
pub fn build(ids: &[String]) -> anyhow::Result<Vec<ManagedApp>> {
    let mut apps = Vec::with_capacity(ids.len());
    for id in ids {
        if apps.iter().any(|a: &ManagedApp| &a.config.id == id) {
            anyhow::bail!("app '{}' listed twice", id);
        }
        let app = lookup(id).ok_or_else(|| {
            let known: Vec<&str> = [folx::ID, transmission::ID].to_vec();
            anyhow::anyhow!("unknown app '{}', known apps: {}", id, known.join(", "))
        })?;
        apps.push(app);
    }
    Ok(apps)
}

/// Run a bounded external command, mapping failure into `err`.
async fn run_bounded(
    mut command: Command,
    err: impl Fn(String) -> AdapterError,
) -> Result<(), AdapterError> {
    let output = tokio::time::timeout(COMMAND_TIMEOUT, command.kill_on_drop(true).output())
        .await
        .map_err(|_| err(format!("timed out after {:?}", COMMAND_TIMEOUT)))?
        .map_err(|e| err(e.to_string()))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
    }
}

/// `open <bundle>` — macOS application launch.
pub(crate) async fn open_bundle(bundle: &str) -> Result<(), AdapterError> {
    let mut cmd = Command::new("open");
    cmd.arg(bundle);
    run_bounded(cmd, AdapterError::Lifecycle).await
}

/// `osascript -e 'quit app "<name>"'` — graceful quit request.
pub(crate) async fn quit_app(name: &str) -> Result<(), AdapterError> {
    let mut cmd = Command::new("osascript");
    cmd.arg("-e").arg(format!("quit app \"{}\"", name));
    run_bounded(cmd, AdapterError::Lifecycle).await
}

/// `defaults write <domain> …` — persist a preference value.
pub(crate) async fn defaults_write(domain: &str, args: &[&str]) -> Result<(), AdapterError> {
    let mut cmd = Command::new("defaults");
    cmd.arg("write").arg(domain).args(args);
    run_bounded(cmd, AdapterError::Apply).await
}
