use crate::protocol::{is_reserved, CallArgs};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use peerlink_core::{IpcError, IpcResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Items produced by a streaming handler.
pub type ItemStream = BoxStream<'static, anyhow::Result<Value>>;

/// What a handler hands back to the server: one value, or a stream of them.
pub enum Reply {
    Value(Value),
    Stream(ItemStream),
}

impl Reply {
    pub fn value<T: Serialize>(value: T) -> anyhow::Result<Self> {
        Ok(Reply::Value(serde_json::to_value(value)?))
    }

    pub fn unit() -> Self {
        Reply::Value(Value::Null)
    }

    /// Wraps a fallible stream; an `Err` item ends the stream with an error
    /// envelope.
    pub fn stream<S, T>(items: S) -> Self
    where
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
        T: Serialize + 'static,
    {
        Reply::Stream(
            items
                .map(|item| item.and_then(|v| serde_json::to_value(v).map_err(Into::into)))
                .boxed(),
        )
    }

    /// Streams an already known sequence.
    pub fn iter<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Serialize + 'static,
    {
        Reply::stream(stream::iter(items.into_iter().map(anyhow::Ok)))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A function exposed by an endpoint.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, args: CallArgs) -> anyhow::Result<Reply>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    async fn handle(&self, args: CallArgs) -> anyhow::Result<Reply> {
        (self)(args).await
    }
}

/// Method name -> handler, shared between an endpoint and its server.
#[derive(Clone, Default)]
pub struct MethodTable {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn expose<H: Handler>(&self, name: impl Into<String>, handler: H) -> IpcResult<()> {
        let name = name.into();
        if name.is_empty() || is_reserved(&name) {
            return Err(IpcError::ReservedMethod(name));
        }
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Sorted list of exposed names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CANCEL_METHOD, PING_METHOD};
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_handlers_are_callable() {
        let table = MethodTable::new();
        table
            .expose("double", |args: CallArgs| async move {
                let n: i64 = args.get(0)?;
                Reply::value(n * 2)
            })
            .unwrap();

        let handler = table.get("double").unwrap();
        match handler.handle(CallArgs::new().arg(21)).await.unwrap() {
            Reply::Value(v) => assert_eq!(v, json!(42)),
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_iter_reply_streams_in_order() {
        let Reply::Stream(items) = Reply::iter(vec!["a", "b", "c"]) else {
            panic!("expected a stream");
        };
        let collected: Vec<Value> = items.map(|item| item.unwrap()).collect().await;
        assert_eq!(collected, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_reserved_and_empty_names_are_rejected() {
        let table = MethodTable::new();
        for name in [CANCEL_METHOD, PING_METHOD, ""] {
            let result = table.expose(name, |_args: CallArgs| async { anyhow::Ok(Reply::unit()) });
            assert!(matches!(result, Err(IpcError::ReservedMethod(_))));
        }
        assert!(table.names().is_empty());
    }

    #[test]
    fn test_expose_replaces_existing_handler() {
        let table = MethodTable::new();
        table.expose("b", |_args: CallArgs| async { anyhow::Ok(Reply::unit()) }).unwrap();
        table.expose("a", |_args: CallArgs| async { anyhow::Ok(Reply::unit()) }).unwrap();
        table.expose("a", |_args: CallArgs| async { Reply::value(1) }).unwrap();
        assert_eq!(table.names(), vec!["a", "b"]);
        assert!(table.contains("b"));
        assert!(!table.contains("c"));
    }
}
