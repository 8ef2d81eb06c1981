use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use peerlink_ipc::{CallArgs, Client, Invocation, LaunchInfo, Peer, RemotePeer, RemoteStream};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

// Enum for representing endpoint status
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DaemonStatus {
    Running,
    Stopped,
    /// Registered, but the recorded executable is gone.
    Missing,
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonStatus::Running => write!(f, "{}", "Running".green()),
            DaemonStatus::Stopped => write!(f, "{}", "Stopped".yellow()),
            DaemonStatus::Missing => write!(f, "{}", "Missing".red()),
        }
    }
}

// Check the status of one endpoint
pub async fn check_daemon_status(client: &Client, name: &str) -> DaemonStatus {
    if client.ping(name).await {
        return DaemonStatus::Running;
    }
    match client.registry().get(name) {
        Some(info) if !info.is_launchable() => DaemonStatus::Missing,
        _ => DaemonStatus::Stopped,
    }
}

// List every registered endpoint with its status
pub async fn list_daemons(client: &Client) -> BTreeMap<String, (LaunchInfo, DaemonStatus)> {
    let mut statuses = BTreeMap::new();
    for (name, info) in client.registry().entries() {
        let status = if client.ping(&name).await {
            DaemonStatus::Running
        } else if info.is_launchable() {
            DaemonStatus::Stopped
        } else {
            DaemonStatus::Missing
        };
        statuses.insert(name, (info, status));
    }
    statuses
}

/// Launches `name` from the registry and optionally waits for it to answer.
pub async fn wake_daemon(client: &Client, name: &str, wait: Option<Duration>) -> Result<()> {
    if !client.wake(name).await {
        return Err(anyhow!("No launchable registry entry for {}", name));
    }

    if let Some(wait) = wait {
        if !client.wait_until_online(name, wait).await {
            return Err(anyhow!(
                "{} was launched but did not come online within {:?}",
                name,
                wait
            ));
        }
    }
    Ok(())
}

/// Command-line values are read as JSON, falling back to a plain string so
/// `hello` does not need quoting.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Builds call arguments from positional values and `name=value` pairs.
pub fn build_args(args: &[String], kwargs: &[String]) -> Result<CallArgs> {
    let mut call = CallArgs::positional(args.iter().map(|arg| parse_value(arg)).collect());
    for pair in kwargs {
        let (name, raw) = pair
            .split_once('=')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| anyhow!("Keyword argument '{}' must look like name=value", pair))?;
        call = call.kwarg(name, parse_value(raw));
    }
    Ok(call)
}

// Invoke a method and print whatever comes back
pub async fn call_method(peer: &RemotePeer, method: &str, call: CallArgs) -> Result<()> {
    let invocation = peer
        .invoke(method, call)
        .await
        .with_context(|| format!("Call to {}.{} failed", peer.target(), method))?;

    match invocation {
        Invocation::Value(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Invocation::Stream(remote) => print_stream(remote).await,
    }
}

/// Prints items as they arrive, one JSON document per line. Ctrl-C cancels
/// the remote task.
pub async fn print_stream(mut remote: RemoteStream) -> Result<()> {
    if !remote.is_active() {
        tracing::warn!("{} did not start a stream", remote.target());
        return Ok(());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut received = 0usize;
    loop {
        tokio::select! {
            item = remote.next_item() => match item {
                Some(Ok(value)) => {
                    received += 1;
                    println!("{}", serde_json::to_string(&value)?);
                }
                Some(Err(e)) => return Err(e).context("Stream ended with an error"),
                None => break,
            },
            _ = &mut ctrl_c => {
                tracing::info!("Cancelling stream after {} items", received);
                remote.cancel().await;
                break;
            }
        }
    }

    tracing::debug!("Stream finished after {} items", received);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_fall_back_to_strings() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("[1, \"a\"]"), json!([1, "a"]));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
        assert_eq!(parse_value("hello"), json!("hello"));
    }

    #[test]
    fn test_build_args_splits_keywords() {
        let call = build_args(
            &["1".to_string(), "two".to_string()],
            &["limit=3".to_string(), "_stream=true".to_string(), "eq=a=b".to_string()],
        )
        .unwrap();

        assert_eq!(call.args, vec![json!(1), json!("two")]);
        assert_eq!(call.kwargs.get("limit"), Some(&json!(3)));
        assert_eq!(call.kwargs.get("_stream"), Some(&json!(true)));
        assert_eq!(call.kwargs.get("eq"), Some(&json!("a=b")));
    }

    #[test]
    fn test_build_args_rejects_bare_keywords() {
        assert!(build_args(&[], &["limit".to_string()]).is_err());
        assert!(build_args(&[], &["=3".to_string()]).is_err());
    }
}
