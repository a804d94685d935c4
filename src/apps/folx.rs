//! Folx torrent client (Setapp distribution).
//!
//! The incoming-connection port lives under the `GeneralUserSettings`
//! dictionary of the Folx defaults domain.  Folx does not bind to the VPN
//! interface itself, so it may keep running on a stale port while the
//! gateway is away.

use async_trait::async_trait;

use super::{defaults_write, open_bundle, quit_app, AdapterError, AppAdapter, ManagedApp};
use crate::types::AppConfig;

pub const ID: &str = "folx";

const BUNDLE: &str = "/Applications/Setapp/Folx.app";
const DEFAULTS_DOMAIN: &str = "com.eltima.Folx3-setapp";

pub fn managed() -> ManagedApp {
    ManagedApp::new(
        AppConfig {
            id: ID.to_string(),
            gateway_required: false,
        },
        Box::new(FolxAdapter::default()),
    )
}

#[derive(Default)]
pub struct FolxAdapter {
    applied_port: Option<u16>,
    last_error: Option<String>,
}

#[async_trait]
impl AppAdapter for FolxAdapter {
    async fn apply(&mut self, port: u16) -> Result<(), AdapterError> {
        let port_arg = port.to_string();
        let result = defaults_write(
            DEFAULTS_DOMAIN,
            &[
                "GeneralUserSettings",
                "-dict-add",
                "TorrentTCPPort",
                port_arg.as_str(),
            ],
        )
        .await;
        match &result {
            Ok(()) => {
                self.applied_port = Some(port);
                self.last_error = None;
            }
            Err(e) => self.last_error = Some(e.to_string()),
        }
        result
    }

    async fn start(&mut self) -> Result<(), AdapterError> {
        let result = open_bundle(BUNDLE).await;
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        let result = quit_app("Folx").await;
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn describe(&self) -> String {
        let port = match self.applied_port {
            Some(p) => format!("port {} applied", p),
            None => "no port applied".to_string(),
        };
        match &self.last_error {
            Some(e) => format!("Folx (Setapp): {}; {}", port, e),
            None => format!("Folx (Setapp): {}", port),
        }
    }
}
