use anyhow::{bail, Context};
use clap::Parser;
use futures::stream;
use peerlink_ipc::{CallArgs, Endpoint, IpcConfig, Reply, Startup};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo-daemon", about = "Demo peerlink endpoint that echoes, adds and counts")]
struct Args {
    /// Endpoint name to serve
    #[arg(short, long, default_value = "Echo")]
    name: String,

    /// Directory holding endpoint sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Registry file to record the launch command in
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
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

async fn echo(args: CallArgs) -> anyhow::Result<Reply> {
    Ok(Reply::Value(args.args.into_iter().next().unwrap_or(Value::Null)))
}

async fn add(args: CallArgs) -> anyhow::Result<Reply> {
    if args.args.iter().all(Value::is_i64) {
        let total: i64 = args.args.iter().filter_map(Value::as_i64).sum();
        return Reply::value(total);
    }
    let mut total = 0.0;
    for (index, value) in args.args.iter().enumerate() {
        total += value
            .as_f64()
            .with_context(|| format!("argument {} is not a number", index))?;
    }
    Reply::value(total)
}

async fn fail(args: CallArgs) -> anyhow::Result<Reply> {
    let message: Option<String> = args.get(0).ok();
    bail!(message.unwrap_or_else(|| "requested failure".to_string()))
}

/// Streams `0..n` (forever when `n` is omitted), pausing `interval_ms`
/// between items and failing after `fail_after` items when asked.
async fn count(args: CallArgs) -> anyhow::Result<Reply> {
    let limit: Option<u64> = args.get(0).ok();
    let interval = Duration::from_millis(args.get_kwarg::<u64>("interval_ms")?.unwrap_or(0));
    let fail_after: Option<u64> = args.get_kwarg("fail_after")?;

    let items = stream::unfold(Some(0u64), move |state| async move {
        let n = state?;
        if limit.is_some_and(|limit| n >= limit) {
            return None;
        }
        if n > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        if fail_after == Some(n) {
            return Some((Err(anyhow::anyhow!("count failed after {} items", n)), None));
        }
        Some((Ok(n), Some(n + 1)))
    });
    Ok(Reply::stream(items))
}

async fn sleep(args: CallArgs) -> anyhow::Result<Reply> {
    let secs: f64 = args.get(0).unwrap_or(1.0);
    tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
    Reply::value(secs)
}

async fn pid(_args: CallArgs) -> anyhow::Result<Reply> {
    Reply::value(std::process::id())
}

async fn shutdown(_args: CallArgs) -> anyhow::Result<Reply> {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("Exiting on request");
        std::process::exit(0);
    });
    Reply::value(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let mut config = IpcConfig::load().context("Failed to load configuration")?;
    if let Some(dir) = args.socket_dir {
        config.socket_dir = dir;
    }
    if let Some(path) = args.registry {
        config.registry_path = path;
    }

    let startup = Endpoint::builder(&args.name)
        .config(config)
        .expose("echo", echo)?
        .expose("add", add)?
        .expose("fail", fail)?
        .expose("count", count)?
        .expose("sleep", sleep)?
        .expose("pid", pid)?
        .expose("shutdown", shutdown)?
        .start()
        .await?;

    let endpoint = match startup {
        Startup::Started(endpoint) => endpoint,
        Startup::AlreadyRunning => {
            info!(endpoint = %args.name, "Already running, exiting");
            return Ok(());
        }
    };

    info!(endpoint = %endpoint.name(), "Echo daemon running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    endpoint.shutdown().await;
    Ok(())
}
