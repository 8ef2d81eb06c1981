use crate::client::Client;
use crate::protocol::{CallArgs, STREAM_FLAG, TIMEOUT_FLAG};
use crate::stream::RemoteStream;
use async_trait::async_trait;
use peerlink_core::IpcResult;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Something that can run named methods on a remote endpoint.
///
/// Typed wrappers for a particular endpoint can be written against this
/// trait, e.g. `async fn show(&self) -> IpcResult<()>` calling
/// `self.call("show", CallArgs::new())`.
#[async_trait]
pub trait Peer: Send + Sync {
    fn target(&self) -> &str;

    async fn call(&self, method: &str, args: CallArgs) -> IpcResult<Value>;

    async fn stream(&self, method: &str, args: CallArgs) -> IpcResult<RemoteStream>;
}

/// Outcome of a dynamically routed call.
#[derive(Debug)]
pub enum Invocation {
    Value(Value),
    Stream(RemoteStream),
}

/// Proxy bound to one target endpoint.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    client: Client,
    target: String,
}

impl RemotePeer {
    pub fn new(client: Client, target: impl Into<String>) -> Self {
        Self {
            client,
            target: target.into(),
        }
    }

    /// Calls `method` and deserializes the reply.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: CallArgs) -> IpcResult<T> {
        self.client.call_as(&self.target, method, args).await
    }

    /// Routes on reserved keywords: `_stream: true` makes this a streaming
    /// call and `_timeout: <seconds>` overrides the reply window. Both are
    /// removed before the request is sent.
    pub async fn invoke(&self, method: &str, mut args: CallArgs) -> IpcResult<Invocation> {
        let streaming = args
            .take_kwarg(STREAM_FLAG)
            .map(|flag| is_truthy(&flag))
            .unwrap_or(false);
        let reply_window = args
            .take_kwarg(TIMEOUT_FLAG)
            .and_then(|secs| secs.as_f64())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| self.client.config().call_timeout());

        if streaming {
            let remote = self.client.stream(&self.target, method, args).await?;
            Ok(Invocation::Stream(remote))
        } else {
            let value = self
                .client
                .call_with_timeout(&self.target, method, args, reply_window)
                .await?;
            Ok(Invocation::Value(value))
        }
    }

    pub async fn ping(&self) -> bool {
        self.client.ping(&self.target).await
    }

    pub async fn wake(&self) -> bool {
        self.client.wake(&self.target).await
    }
}

#[async_trait]
impl Peer for RemotePeer {
    fn target(&self) -> &str {
        &self.target
    }

    async fn call(&self, method: &str, args: CallArgs) -> IpcResult<Value> {
        self.client.call(&self.target, method, args).await
    }

    async fn stream(&self, method: &str, args: CallArgs) -> IpcResult<RemoteStream> {
        self.client.stream(&self.target, method, args).await
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_flag_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(null)));
    }
}
