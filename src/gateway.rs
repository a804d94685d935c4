//! NAT-PMP gateway boundary.
//!
//! The actual UDP exchange is the job of an external NAT-PMP client
//! command; this module wraps a single request/response round trip behind
//! the [`GatewayClient`] trait and maps the outcome into the
//! [`AcquireError`] taxonomy.  There is deliberately no retry here: retry
//! policy belongs to the refresh engine.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// Why a single acquisition attempt failed.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    /// The exchange exceeded the configured timeout.
    #[error("NAT-PMP request timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    /// The gateway answered but refused or cannot map a port.
    #[error("gateway did not grant a mapping: {0}")]
    Unsupported(String),
    /// Everything else: spawn failures, malformed responses.
    #[error("NAT-PMP client error: {0}")]
    Io(String),
}

/// A single NAT-PMP request/response exchange.  Implementations must not
/// retry internally and must come back within their configured timeout.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn request_mapping(&self) -> Result<u16, AcquireError>;
}

/// Production client: shells out to the configured NAT-PMP client binary
/// (`natpmp-client -g <gateway> 0 0`) and parses the mapped public port
/// out of its response line.
pub struct NatPmpCommand {
    client_path: PathBuf,
    gateway: IpAddr,
    timeout: Duration,
}

impl NatPmpCommand {
    pub fn new(client_path: PathBuf, gateway: IpAddr, timeout: Duration) -> Self {
        Self {
            client_path,
            gateway,
            timeout,
        }
    }
}

#[async_trait]
impl GatewayClient for NatPmpCommand {
    async fn request_mapping(&self) -> Result<u16, AcquireError> {
        debug!(
            "Requesting NAT-PMP mapping from {} via {}",
            self.gateway,
            self.client_path.display()
        );

        let mut command = Command::new(&self.client_path);
        command
            .arg("-g")
            .arg(self.gateway.to_string())
            .arg("0")
            .arg("0")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| AcquireError::Timeout {
                timeout: self.timeout,
            })?
            .map_err(|e| AcquireError::Io(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AcquireError::Unsupported(stderr.trim().to_string()));
        }

        parse_mapped_port(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Pulls the public port out of the client's response line: the 15th
/// whitespace-separated field, of which the port is the first
/// comma-separated token.
fn parse_mapped_port(stdout: &str) -> Result<u16, AcquireError> {
    let fields: Vec<&str> = stdout.split_whitespace().collect();
    let field = fields
        .get(14)
        .ok_or_else(|| AcquireError::Io("unexpected response format".into()))?;
    let token = field.split(',').next().unwrap_or(field);
    token
        .parse()
        .map_err(|_| AcquireError::Io(format!("could not parse mapped port from '{}'", field)))
}
