use crate::client::Client;
use crate::protocol::Response;
use crate::transport::Connection;
use futures::stream::{self, Stream};
use peerlink_core::{IpcError, IpcResult};
use serde_json::Value;
use tracing::debug;

/// Client side of a streaming call.
///
/// Forward-only: once it has ended, failed or been cancelled it yields
/// nothing more.
#[derive(Debug)]
pub struct RemoteStream {
    client: Client,
    target: String,
    method: String,
    task_id: Option<String>,
    conn: Option<Connection>,
}

impl RemoteStream {
    pub(crate) fn new(
        client: Client,
        target: &str,
        method: &str,
        task_id: String,
        conn: Connection,
    ) -> Self {
        Self {
            client,
            target: target.to_string(),
            method: method.to_string(),
            task_id: Some(task_id),
            conn: Some(conn),
        }
    }

    /// A stream that has nothing to yield.
    pub(crate) fn finished(client: Client, target: &str, method: &str) -> Self {
        Self {
            client,
            target: target.to_string(),
            method: method.to_string(),
            task_id: None,
            conn: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Server-assigned id, `None` when the call never started streaming.
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }

    /// Pulls the next item.
    ///
    /// `None` after `stream_end`, cancellation, or a transport failure. A
    /// remote error is yielded once as `Some(Err(..))`, then `None`.
    pub async fn next_item(&mut self) -> Option<IpcResult<Value>> {
        let conn = self.conn.as_mut()?;

        match conn.recv::<Response>().await {
            Ok(Some(Response::Progress { data })) => Some(Ok(data)),
            Ok(Some(Response::StreamEnd)) => {
                self.close().await;
                None
            }
            Ok(Some(Response::Error { msg })) => {
                self.close().await;
                Some(Err(IpcError::RemoteExecution {
                    target: self.target.clone(),
                    method: self.method.clone(),
                    message: msg,
                }))
            }
            Ok(Some(other)) => {
                self.close().await;
                Some(Err(IpcError::Protocol(format!(
                    "Unexpected envelope in stream: {:?}",
                    other
                ))))
            }
            Ok(None) => {
                debug!(target = %self.target, "Stream closed by peer");
                self.close().await;
                None
            }
            Err(e) => {
                debug!(target = %self.target, error = %e, "Stream transport failed");
                self.close().await;
                None
            }
        }
    }

    /// Stops the stream. The local connection is dropped at once; the
    /// server is told over a separate connection, and failure to deliver
    /// that notice is ignored. Calling it again does nothing.
    pub async fn cancel(&mut self) {
        if self.conn.is_none() {
            return;
        }
        self.close().await;

        if let Some(task_id) = &self.task_id {
            if let Err(e) = self.client.cancel_task(&self.target, task_id).await {
                debug!(target = %self.target, task_id = %task_id, error = %e, "Cancellation not delivered");
            }
        }
    }

    /// Adapts the consumer into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = IpcResult<Value>> {
        stream::unfold(self, |mut remote| async move {
            remote.next_item().await.map(|item| (item, remote))
        })
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }
}
