//! Read side of the daemon.
//!
//! The engine publishes a fresh [`StatusSnapshot`] after every state
//! change; [`StatusBoard`] hands out point-in-time copies of the latest
//! one.  Readers never see engine internals and never need a lock.

use std::fmt::Write as _;

use chrono::Utc;
use tokio::sync::watch;

use crate::apps::ManagedApp;
use crate::gateway::GatewayClient;
use crate::types::{GatewayState, Mapping, StatusSnapshot};

/// Pull-based access to the latest published snapshot.
pub struct StatusBoard {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusBoard {
    pub(crate) fn new(rx: watch::Receiver<StatusSnapshot>) -> Self {
        Self { rx }
    }

    /// The most recently published view, cloned for the caller.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }
}

/// One-shot probe for `portglue status`: a single gateway exchange,
/// rendered through the same snapshot type the daemon publishes.  Never
/// touches application lifecycles.
pub async fn probe(gateway: &dyn GatewayClient, apps: &[ManagedApp]) -> StatusSnapshot {
    let (state, detail, mapping) = match gateway.request_mapping().await {
        Ok(port) => (
            GatewayState::Reachable,
            None,
            Mapping {
                port: Some(port),
                acquired_at: Some(Utc::now()),
                change_count: 0,
            },
        ),
        Err(e) => (GatewayState::Unreachable, Some(e.to_string()), Mapping::empty()),
    };
    StatusSnapshot {
        gateway: state,
        gateway_detail: detail,
        mapping,
        apps: apps.iter().map(|a| a.status()).collect(),
        generated_at: Utc::now(),
    }
}

/// Plain-text rendering for the one-shot query.
pub fn render_text(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    let gateway = match snapshot.gateway {
        GatewayState::Reachable => "reachable",
        GatewayState::Unreachable => "unreachable",
    };
    let _ = writeln!(out, "Gateway:      {}", gateway);
    if let Some(detail) = &snapshot.gateway_detail {
        let _ = writeln!(out, "  {}", detail);
    }
    match snapshot.mapping.port {
        Some(port) => {
            let _ = writeln!(out, "Public port:  {}", port);
        }
        None => {
            let _ = writeln!(out, "Public port:  none");
        }
    }
    if let Some(at) = snapshot.mapping.acquired_at {
        let _ = writeln!(out, "Acquired at:  {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    let _ = writeln!(out, "Port changes: {}", snapshot.mapping.change_count);
    if !snapshot.apps.is_empty() {
        let _ = writeln!(out, "Apps:");
        for app in &snapshot.apps {
            let state = match app.state {
                crate::types::AppRuntimeState::Stopped => "stopped",
                crate::types::AppRuntimeState::Running => "running",
                crate::types::AppRuntimeState::Restarting => "restarting",
            };
            let _ = writeln!(out, "  {:<14}{:<11}{}", app.config.id, state, app.detail);
        }
    }
    out
}
