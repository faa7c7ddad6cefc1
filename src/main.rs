use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_plugin_host::config::SANDBOX_DIR_NAME;
use beacon_plugin_host::config::file::config_file_path;
use beacon_plugin_host::{PluginSupervisor, SupervisorConfig};

/// Beacon plugin host - runs and supervises local plugin processes
#[derive(Parser)]
#[command(name = "beacon-plugins", version, about)]
struct Cli {
    /// Directory containing plugin executables
    #[arg(long, env = "BEACON_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    /// Unix socket plugins connect to
    #[arg(long, env = "BEACON_PLUGIN_SOCKET")]
    socket: Option<PathBuf>,

    /// Graceful stop deadline in milliseconds
    #[arg(long, env = "BEACON_PLUGIN_STOP_TIMEOUT_MS")]
    stop_timeout_ms: Option<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved plugin directories and socket address
    Paths,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_plugin_host=info",
        1 => "info,beacon_plugin_host=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = SupervisorConfig::load()?;

    if let Some(dir) = cli.plugin_dir {
        // An explicit plugin directory keeps its sandbox alongside it
        if config.sandbox_dir == config.plugin_dir.join(SANDBOX_DIR_NAME) {
            config.sandbox_dir = dir.join(SANDBOX_DIR_NAME);
        }
        config.plugin_dir = dir;
    }
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(ms) = cli.stop_timeout_ms {
        config.stop_timeout = Duration::from_millis(ms);
    }

    if let Some(Command::Paths) = cli.command {
        print_paths(&config);
        return Ok(());
    }

    tracing::info!(
        plugin_dir = %config.plugin_dir.display(),
        socket = %config.socket_path.display(),
        stop_timeout = ?config.stop_timeout,
        "starting beacon plugin host"
    );

    let mut supervisor = PluginSupervisor::new(config)?;
    supervisor.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    supervisor.stop().await;
    Ok(())
}

fn print_paths(config: &SupervisorConfig) {
    println!("Plugin directory:  {}", config.plugin_dir.display());
    println!("Sandbox directory: {}", config.sandbox_dir.display());
    println!("Socket:            {}", config.socket_path.display());
    match config_file_path() {
        Some(path) => println!("Config file:       {}", path.display()),
        None => println!("Config file:       (unavailable)"),
    }
}
