//! Transmission torrent client.
//!
//! Transmission binds its peer port directly against the VPN tunnel, so
//! it is marked gateway-required: the engine stops it whenever the
//! gateway becomes unreachable and brings it back with the fresh port on
//! recovery.  The peer port is a plain integer preference.

use async_trait::async_trait;

use super::{defaults_write, open_bundle, quit_app, AdapterError, AppAdapter, ManagedApp};
use crate::types::AppConfig;

pub const ID: &str = "transmission";

const BUNDLE: &str = "/Applications/Transmission.app";
const DEFAULTS_DOMAIN: &str = "org.m0k.transmission";

pub fn managed() -> ManagedApp {
    ManagedApp::new(
        AppConfig {
            id: ID.to_string(),
            gateway_required: true,
        },
        Box::new(TransmissionAdapter::default()),
    )
}

#[derive(Default)]
pub struct TransmissionAdapter {
    applied_port: Option<u16>,
    last_error: Option<String>,
}

#[async_trait]
impl AppAdapter for TransmissionAdapter {
    async fn apply(&mut self, port: u16) -> Result<(), AdapterError> {
        let port_arg = port.to_string();
        let result =
            defaults_write(DEFAULTS_DOMAIN, &["BindPort", "-int", port_arg.as_str()]).await;
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
        let result = quit_app("Transmission").await;
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
            Some(e) => format!("Transmission: {}; {}", port, e),
            None => format!("Transmission: {}", port),
        }
    }
}
