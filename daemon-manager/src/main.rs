use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use peerlink_ipc::{Client, IpcConfig, RemotePeer};
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod daemon;

// Get the name of the current executable
fn get_executable_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(|s| s.to_string()))
        .unwrap_or_else(|| "peerlink-manager".to_string())
}

/// Peerlink Endpoint Manager CLI
///
/// Inspects the launch registry and talks to running endpoints
#[derive(Parser, Debug)]
#[command(name = "peerlink-manager", author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding endpoint sockets
    #[arg(long, global = true)]
    socket_dir: Option<PathBuf>,

    /// Registry file to read and prune
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered endpoints and whether they are running
    List,

    /// Check whether an endpoint is running
    #[command(alias = "ping")]
    Status {
        #[arg(required = true)]
        name: String,
    },

    /// Launch an endpoint from its registry entry
    Wake {
        #[arg(required = true)]
        name: String,

        /// Seconds to wait for the endpoint to accept connections
        #[arg(short, long)]
        wait: Option<f64>,
    },

    /// Call a method and print the reply
    Call {
        target: String,
        method: String,

        /// Positional arguments, parsed as JSON when possible
        args: Vec<String>,

        /// Keyword arguments as name=value
        #[arg(short = 'k', long = "kw")]
        kwargs: Vec<String>,

        /// Reply window in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Treat the method as a stream and print items as they arrive
        #[arg(short, long)]
        stream: bool,
    },

    /// Stream a method's items until it ends or Ctrl-C is pressed
    Stream {
        target: String,
        method: String,
        args: Vec<String>,

        #[arg(short = 'k', long = "kw")]
        kwargs: Vec<String>,
    },

    /// Ask an endpoint to stop one of its streams
    Cancel { target: String, task_id: String },

    /// Remove an endpoint's registry entry
    Forget {
        #[arg(required = true)]
        name: String,
    },

    /// Remove registry entries whose executable no longer exists
    Prune,

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Open the config file in $EDITOR
    Edit,
    /// Reset the config file to defaults
    Reset,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn seconds(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(anyhow!("Expected a positive number of seconds, got {}", secs));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    debug!("Starting peerlink-manager with arguments: {:#?}", cli);

    let mut ipc_config = IpcConfig::load().context("Failed to load configuration")?;
    if let Some(dir) = cli.socket_dir {
        ipc_config.socket_dir = dir;
    }
    if let Some(path) = cli.registry {
        ipc_config.registry_path = path;
    }
    let client = Client::new(ipc_config.clone());

    match cli.command {
        Commands::List => {
            let statuses = daemon::list_daemons(&client).await;
            if statuses.is_empty() {
                println!("No endpoints registered in {}", client.registry().path().display());
                return Ok(());
            }

            println!("{}", "=== Registered Endpoints ===".bold());
            let width = statuses.keys().map(|name| name.len()).max().unwrap_or(10);
            for (name, (info, status)) in &statuses {
                println!(
                    "  {:<width$} : {}  {}",
                    name,
                    status,
                    info.command.join(" ").dimmed(),
                    width = width
                );
            }

            println!("\n{}", "Management:".bold().underline());
            println!("  Wake   : {} wake <name>", get_executable_name().green());
            println!("  Prune  : {} prune", get_executable_name().yellow());
        }
        Commands::Status { name } => {
            let status = daemon::check_daemon_status(&client, &name).await;
            println!("{}: {}", name, status);
        }
        Commands::Wake { name, wait } => {
            let wait = wait.map(seconds).transpose()?;
            daemon::wake_daemon(&client, &name, wait)
                .await
                .with_context(|| format!("Failed to wake endpoint {}", name))?;
            if wait.is_some() {
                info!("{} is online", name.green());
            } else {
                info!("{} launch issued", name.green());
            }
        }
        Commands::Call {
            target,
            method,
            args,
            kwargs,
            timeout,
            stream,
        } => {
            let mut call = daemon::build_args(&args, &kwargs)?;
            if let Some(timeout) = timeout {
                seconds(timeout)?;
                call = call.kwarg("_timeout", timeout);
            }
            if stream {
                call = call.kwarg("_stream", Value::Bool(true));
            }
            let peer = RemotePeer::new(client, target);
            daemon::call_method(&peer, &method, call).await?;
        }
        Commands::Stream {
            target,
            method,
            args,
            kwargs,
        } => {
            let call = daemon::build_args(&args, &kwargs)?;
            let remote = client
                .stream(&target, &method, call)
                .await
                .with_context(|| format!("Failed to start stream {}.{}", target, method))?;
            daemon::print_stream(remote).await?;
        }
        Commands::Cancel { target, task_id } => {
            client
                .cancel_task(&target, &task_id)
                .await
                .with_context(|| format!("Failed to cancel task {} on {}", task_id, target))?;
            info!("Cancellation sent to {}", target.green());
        }
        Commands::Forget { name } => {
            if !client.registry().remove(&name) {
                return Err(anyhow!("No registry entry for {}", name));
            }
            info!("Registry entry for {} removed", name.green());
        }
        Commands::Prune => {
            let pruned = client.registry().prune_missing();
            if pruned.is_empty() {
                println!("Nothing to prune");
            }
            for name in pruned {
                println!("Pruned {}", name.yellow());
            }
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                println!("{}", config::show_config(&ipc_config)?);
            }
            ConfigCommands::Path => {
                println!("{}", config::get_config_path().display());
            }
            ConfigCommands::Edit => {
                config::edit_config()
                    .await
                    .context("Failed to edit configuration")?;
                info!("Configuration updated successfully");
            }
            ConfigCommands::Reset => {
                config::reset_config()
                    .await
                    .context("Failed to reset configuration")?;
                info!("Configuration reset to defaults");
            }
        },
    }

    Ok(())
}
