//! Data structures shared across the daemon.
//!
//! These types are serialised using [`serde`](https://serde.rs/) so that
//! one-shot status queries can emit them as JSON.  They form the
//! point-in-time view of the refresh engine's state: the gateway
//! reachability, the currently held port mapping and the runtime state of
//! every managed application.  The fields are kept minimal; everything a
//! reader receives is a copy, never a reference into engine state.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Whether the VPN gateway answered the most recent NAT-PMP exchange.
///
/// Derived anew on every renewal attempt.  The transition from
/// `Reachable` to `Unreachable` is what shuts down gateway-bound
/// applications; the reverse transition restarts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    Reachable,
    Unreachable,
}

/// The currently leased public port and its metadata.
///
/// `port` is `None` whenever no valid mapping is held (before the first
/// acquisition and throughout a gateway outage).  `change_count` tracks
/// how often a newly acquired port differed from the previously held one;
/// the very first acquisition only establishes the baseline and is not
/// counted.
#[derive(Debug, Clone, Serialize)]
pub struct Mapping {
    pub port: Option<u16>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub change_count: u64,
}

impl Mapping {
    pub fn empty() -> Self {
        Self {
            port: None,
            acquired_at: None,
            change_count: 0,
        }
    }
}

/// Runtime state of a managed application, owned by the engine.
///
/// `Restarting` covers the window between a stop request and the
/// follow-up apply/start while the stop grace interval elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppRuntimeState {
    Stopped,
    Running,
    Restarting,
}

/// Static description of a managed application, fixed for the process
/// lifetime.  `gateway_required` marks applications that must not run
/// while the gateway is unreachable.
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub id: String,
    pub gateway_required: bool,
}

/// Per-application entry in a status snapshot.  `detail` is the
/// adapter-supplied summary, including the outcome of the most recent
/// lifecycle command.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    #[serde(flatten)]
    pub config: AppConfig,
    pub state: AppRuntimeState,
    pub detail: String,
}

/// Immutable point-in-time view of the whole daemon.
///
/// Constructed by the engine after every state change and handed to
/// readers as a value; safe to keep across further engine mutations.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub gateway: GatewayState,
    /// Last acquisition failure, cleared on the next success.
    pub gateway_detail: Option<String>,
    pub mapping: Mapping,
    pub apps: Vec<AppStatus>,
    pub generated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// The view published before the first acquisition attempt.
    pub fn initial(apps: Vec<AppStatus>) -> Self {
        Self {
            gateway: GatewayState::Unreachable,
            gateway_detail: None,
            mapping: Mapping::empty(),
            apps,
            generated_at: Utc::now(),
        }
    }
}
