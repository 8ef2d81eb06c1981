use crate::protocol::{CallArgs, Request, Response, CANCEL_METHOD};
use crate::stream::RemoteStream;
use crate::transport::Connection;
use peerlink_core::{address_for, IpcConfig, IpcError, IpcResult, Registry};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Interval between probes in `wait_until_online`.
const ONLINE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opens one connection per request against named endpoints.
#[derive(Debug, Clone)]
pub struct Client {
    config: Arc<IpcConfig>,
    registry: Registry,
}

impl Client {
    pub fn new(config: IpcConfig) -> Self {
        let registry = Registry::from_config(&config);
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Socket path used to reach `target`.
    pub fn address(&self, target: &str) -> PathBuf {
        address_for(&self.config.socket_dir, target)
    }

    /// Calls `method` on `target` with the configured reply window.
    pub async fn call(&self, target: &str, method: &str, args: CallArgs) -> IpcResult<Value> {
        self.call_with_timeout(target, method, args, self.config.call_timeout())
            .await
    }

    /// Calls `method` and deserializes the reply.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        target: &str,
        method: &str,
        args: CallArgs,
    ) -> IpcResult<T> {
        let value = self.call(target, method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_with_timeout(
        &self,
        target: &str,
        method: &str,
        args: CallArgs,
        reply_window: Duration,
    ) -> IpcResult<Value> {
        let mut conn = self.open(target, Request::new(method, args)).await?;

        let reply = match timeout(reply_window, conn.recv::<Response>()).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                return Err(IpcError::ConnectionDropped(format!(
                    "{} closed the connection before replying to {}",
                    target, method
                )))
            }
            Ok(Err(e)) => return Err(IpcError::ConnectionDropped(e.to_string())),
            Err(_) => {
                debug!(target = %target, method = %method, "Call timed out");
                conn.close().await;
                return Err(IpcError::Timeout {
                    target: target.to_string(),
                    method: method.to_string(),
                    timeout: reply_window,
                });
            }
        };
        conn.close().await;

        match reply {
            Response::Ok { data } => Ok(data),
            Response::Error { msg } => Err(IpcError::RemoteExecution {
                target: target.to_string(),
                method: method.to_string(),
                message: msg,
            }),
            other => Err(IpcError::Protocol(format!(
                "Unknown Protocol Response: {:?}",
                other
            ))),
        }
    }

    /// Starts a streaming call. A reply other than `stream_start` yields an
    /// already finished stream.
    pub async fn stream(&self, target: &str, method: &str, args: CallArgs) -> IpcResult<RemoteStream> {
        let mut conn = self.open(target, Request::new(method, args)).await?;

        let header = match timeout(self.config.call_timeout(), conn.recv::<Response>()).await {
            Ok(Ok(Some(header))) => header,
            Ok(Ok(None)) | Ok(Err(_)) => {
                debug!(target = %target, method = %method, "Stream setup failed");
                return Err(IpcError::PeerOffline(target.to_string()));
            }
            Err(_) => {
                conn.close().await;
                return Err(IpcError::Timeout {
                    target: target.to_string(),
                    method: method.to_string(),
                    timeout: self.config.call_timeout(),
                });
            }
        };

        match header {
            Response::StreamStart { task_id } => {
                debug!(target = %target, method = %method, task_id = %task_id, "Stream started");
                Ok(RemoteStream::new(self.clone(), target, method, task_id, conn))
            }
            Response::Error { msg } => {
                warn!(target = %target, method = %method, error = %msg, "Stream request rejected");
                conn.close().await;
                Ok(RemoteStream::finished(self.clone(), target, method))
            }
            other => {
                debug!(target = %target, method = %method, reply = ?other, "Method did not stream");
                conn.close().await;
                Ok(RemoteStream::finished(self.clone(), target, method))
            }
        }
    }

    /// True when something is listening on `target`'s address. Sends no data.
    pub async fn ping(&self, target: &str) -> bool {
        match Connection::connect(&self.address(target)).await {
            Ok(conn) => {
                conn.close().await;
                true
            }
            Err(e) => {
                debug!(target = %target, error = %e, "Ping failed");
                false
            }
        }
    }

    /// Launches `target` from the registry unless it is already online.
    ///
    /// `true` means a launch was issued (or the peer was already up), not that
    /// the peer accepts calls yet; see `wait_until_online`.
    pub async fn wake(&self, target: &str) -> bool {
        if self.ping(target).await {
            return true;
        }

        info!(target = %target, "Waking endpoint");
        let registry = self.registry.clone();
        let name = target.to_string();
        tokio::task::spawn_blocking(move || registry.launch_target(&name))
            .await
            .unwrap_or_else(|e| {
                warn!(target = %target, error = %e, "Launch task failed");
                false
            })
    }

    /// Polls `ping` until it succeeds or `deadline` elapses.
    pub async fn wait_until_online(&self, target: &str, deadline: Duration) -> bool {
        let give_up = Instant::now() + deadline;
        loop {
            if self.ping(target).await {
                return true;
            }
            if Instant::now() >= give_up {
                return false;
            }
            sleep(ONLINE_POLL_INTERVAL).await;
        }
    }

    /// Asks `target` to stop stream `task_id`, over a fresh connection.
    pub async fn cancel_task(&self, target: &str, task_id: &str) -> IpcResult<()> {
        self.call(target, CANCEL_METHOD, CallArgs::new().kwarg("task_id", task_id))
            .await
            .map(|_| ())
    }

    async fn open(&self, target: &str, request: Request) -> IpcResult<Connection> {
        let mut conn = Connection::connect(&self.address(target))
            .await
            .map_err(|e| {
                debug!(target = %target, error = %e, "Connect failed");
                IpcError::PeerOffline(target.to_string())
            })?;

        if let Err(e) = conn.send(&request).await {
            debug!(target = %target, error = %e, "Sending request failed");
            conn.close().await;
            return Err(IpcError::PeerOffline(target.to_string()));
        }
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unbound_target_is_offline() {
        let dir = tempdir().unwrap();
        let client = Client::new(IpcConfig::for_dirs(dir.path(), dir.path().join("registry.json")));

        assert!(!client.ping("Nobody").await);
        match client.call("Nobody", "echo", CallArgs::new()).await {
            Err(IpcError::PeerOffline(target)) => assert_eq!(target, "Nobody"),
            other => panic!("expected PeerOffline, got {:?}", other),
        }
        assert!(matches!(
            client.stream("Nobody", "count", CallArgs::new()).await,
            Err(IpcError::PeerOffline(_))
        ));
    }

    #[tokio::test]
    async fn test_wake_without_registry_entry_is_false() {
        let dir = tempdir().unwrap();
        let client = Client::new(IpcConfig::for_dirs(dir.path(), dir.path().join("registry.json")));
        assert!(!client.wake("Nobody").await);
    }

    #[tokio::test]
    async fn test_wait_until_online_gives_up() {
        let dir = tempdir().unwrap();
        let client = Client::new(IpcConfig::for_dirs(dir.path(), dir.path().join("registry.json")));

        let started = Instant::now();
        assert!(!client.wait_until_online("Nobody", Duration::from_millis(200)).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
