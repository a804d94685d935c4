//! Bounded network diagnostics for the `doctor` subcommand.

use std::time::Duration;

use tokio::process::Command;

use crate::config::Config;
use crate::gateway::{GatewayClient, NatPmpCommand};

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    println!("Running network diagnostics...");

    let internet = ping("8.8.8.8").await;
    println!("Internet connectivity: {}", mark(internet));

    let gateway = ping(&cfg.gateway.to_string()).await;
    println!("Gateway reachable:     {}", mark(gateway));

    let client = NatPmpCommand::new(cfg.natpmp_client.clone(), cfg.gateway, cfg.acquire_timeout());
    match client.request_mapping().await {
        Ok(port) => {
            println!("NAT-PMP acquisition:   {}", mark(true));
            println!("  Current port: {}", port);
        }
        Err(e) => {
            println!("NAT-PMP acquisition:   {}", mark(false));
            println!("  {}", e);
        }
    }
    Ok(())
}

async fn ping(host: &str) -> bool {
    let attempt = tokio::time::timeout(
        CHECK_TIMEOUT,
        Command::new("ping")
            .args(["-c", "3", host])
            .kill_on_drop(true)
            .output(),
    )
    .await;
    matches!(attempt, Ok(Ok(output)) if output.status.success())
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "failed"
    }
}
