//! Portglue daemon entry point.

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::signal;

mod apps;
mod config;
mod diag;
mod display;
mod engine;
mod gateway;
mod status;
mod types;

use config::Config;
use engine::{Engine, Tuning};
use gateway::NatPmpCommand;

#[derive(Parser)]
#[command(
    name = "portglue",
    about = "Keeps a NAT-PMP public port lease fresh and glues it to the apps that depend on it"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the refresh daemon
    Run {
        /// Render the live dashboard instead of log output
        #[arg(long)]
        ui: bool,
    },
    /// One-shot gateway probe and status report
    Status {
        /// Emit the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the built-in application adapters
    Apps,
    /// Run bounded network diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run { ui: false });

    // Keep stderr quiet while the alternate screen is up.
    let default_filter = match command {
        Command::Run { ui: true } => "warn",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let cfg = Config::load()?;

    match command {
        Command::Run { ui } => run(cfg, ui).await,
        Command::Status { json } => status_query(cfg, json).await,
        Command::Apps => {
            println!("Built-in apps:");
            for app in apps::builtin() {
                let flag = if app.gateway_required {
                    " (gateway required)"
                } else {
                    ""
                };
                println!("  {}{}", app.id, flag);
            }
            Ok(())
        }
        Command::Doctor => diag::run(&cfg).await,
    }
}

async fn run(cfg: Config, ui: bool) -> anyhow::Result<()> {
    info!("Starting portglue with config: {:?}", cfg);
    let managed = apps::build(&cfg.apps)?;
    if managed.is_empty() {
        info!("No apps to control");
    } else {
        info!(
            "Controlling apps: {}",
            cfg.apps.join(", ")
        );
    }

    let gateway = NatPmpCommand::new(cfg.natpmp_client.clone(), cfg.gateway, cfg.acquire_timeout());
    let (engine, handle, board) = Engine::new(Box::new(gateway), managed, Tuning::from(&cfg));
    let engine_task = tokio::spawn(engine.run());

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                signal_handle.shutdown();
            }
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
    });

    if ui {
        let mut dashboard = display::Dashboard::new()?;
        dashboard.run(board, handle.clone()).await?;
        // The dashboard may exit on its own error path; make sure the
        // engine winds down either way.
        handle.shutdown();
    }

    engine_task.await?;
    info!("Shutdown complete.");
    Ok(())
}

async fn status_query(cfg: Config, json: bool) -> anyhow::Result<()> {
    let managed = apps::build(&cfg.apps)?;
    let gateway = NatPmpCommand::new(cfg.natpmp_client.clone(), cfg.gateway, cfg.acquire_timeout());
    let snapshot = status::probe(&gateway, &managed).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", status::render_text(&snapshot));
    }
    Ok(())
}
