//! The hub binary: a rendezvous point nodes log into to find and punch
//! holes to each other. Grounded in the original's `cmd/hub/main.go`.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use ptunnel::config::HubConfig;
use ptunnel::service::HubService;

#[derive(Parser)]
#[command(name = "ptun-hub", about = "Ptun hub")]
struct Cli {
    /// Path to a TOML config file; falls back to the default search path.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the hub (the default when no subcommand is given).
    Run,
    /// Print the resolved configuration and exit.
    Config,
}

fn load_config(cli: &Cli) -> HubConfig {
    match HubConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Config) => {
            let cfg = load_config(&cli);
            match serde_json::to_string_pretty(&cfg) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("failed to render config: {e}"),
            }
            return;
        }
        Some(Command::Run) | None => {}
    }

    let cfg = load_config(&cli);
    let service = Arc::new(HubService::new(cfg));

    info!("hub starting");
    if let Err(e) = service.start().await {
        error!("hub start failed, {e}");
        return;
    }
    info!("hub started");

    let run_service = service.clone();
    let run_task = tokio::spawn(async move { run_service.run().await });

    let _ = tokio::signal::ctrl_c().await;

    info!("hub shutting down");
    service.close();
    let _ = run_task.await;
    info!("hub stopped");
}
