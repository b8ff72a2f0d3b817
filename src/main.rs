use clap::Parser;
use tracing::{info, warn};

use carapace_node::cli::{self, Cli, Command, ConfigCommand, RunArgs};
use carapace_node::config::NodeHostConfig;
use carapace_node::host::NodeHost;
use carapace_node::logging::{self, LogConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `run` both start the node host.
        None => run_node(RunArgs::default()).await,
        Some(Command::Run(args)) => run_node(args).await,

        Some(Command::Which { bins }) => cli::handle_which(&bins),

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

/// Run the node host until Ctrl+C or SIGTERM.
async fn run_node(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(LogConfig::from_env())?;

    let mut config = NodeHostConfig::load()?;
    args.apply(&mut config);
    std::fs::create_dir_all(&config.state_dir)?;

    let host = NodeHost::new(config)?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let reason = await_shutdown_trigger().await;
        info!("Shutdown signal received ({})", reason);
        let _ = shutdown_tx.send(true);
    });

    host.run(shutdown_rx).await?;
    info!("Node host stopped");
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            ctrl_c_only().await
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    ctrl_c_only().await
}

async fn ctrl_c_only() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            // Without a handler the process is stopped by the default signal action.
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending().await
        }
    }
}
