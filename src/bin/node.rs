//! The node binary: joins a hub, punches holes to peers, and bridges
//! traffic onto a local TUN interface. Grounded in the original's
//! `cmd/node/main.go`.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use ptunnel::config::NodeConfig;
use ptunnel::service::NodeService;

#[derive(Parser)]
#[command(name = "ptun-node", about = "Ptun node")]
struct Cli {
    /// Override this node's name on the hub.
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Path to a TOML config file; falls back to the default search path.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the node (the default when no subcommand is given).
    Run,
    /// Print the resolved configuration and exit.
    Config,
}

fn load_config(cli: &Cli) -> NodeConfig {
    match NodeConfig::load(cli.config.as_deref()) {
        Ok(mut cfg) => {
            if let Some(name) = &cli.name {
                cfg.common.name = name.clone();
            }
            cfg
        }
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
    let service = Arc::new(NodeService::new(cfg));

    info!("node starting");
    if let Err(e) = service.start().await {
        error!("node start failed, {e}");
        return;
    }
    info!("node started");

    let run_service = service.clone();
    let run_task = tokio::spawn(async move { run_service.run().await });

    let _ = tokio::signal::ctrl_c().await;

    info!("node shutting down");
    service.close().await;
    run_task.abort();
    info!("node stopped");
}
