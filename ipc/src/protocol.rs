use peerlink_core::{IpcError, IpcResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved method asking the server to stop a running stream.
pub const CANCEL_METHOD: &str = "__cancel_task__";
/// Reserved method answered by the server itself, never by a handler.
pub const PING_METHOD: &str = "__ping__";

/// Keyword understood by `RemotePeer::invoke`: route the call to `stream`.
pub const STREAM_FLAG: &str = "_stream";
/// Keyword understood by `RemotePeer::invoke`: reply window in seconds.
pub const TIMEOUT_FLAG: &str = "_timeout";

/// True for names handled by the server and unavailable to handlers.
pub fn is_reserved(method: &str) -> bool {
    method == CANCEL_METHOD || method == PING_METHOD
}

/// Positional and keyword arguments of one call.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument, replacing any previous value.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Deserializes positional argument `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> IpcResult<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| IpcError::Protocol(format!("missing positional argument {}", index)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Deserializes keyword argument `name`, `None` when absent.
    pub fn get_kwarg<T: DeserializeOwned>(&self, name: &str) -> IpcResult<Option<T>> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Removes and returns a keyword argument.
    pub fn take_kwarg(&mut self, name: &str) -> Option<Value> {
        self.kwargs.remove(name)
    }
}

/// One request per connection: `{method, args, kwargs}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, call: CallArgs) -> Self {
        Self {
            method: method.into(),
            args: call.args,
            kwargs: call.kwargs,
        }
    }

    pub fn cancel(task_id: &str) -> Self {
        Self::new(CANCEL_METHOD, CallArgs::new().kwarg("task_id", task_id))
    }

    pub fn ping() -> Self {
        Self::new(PING_METHOD, CallArgs::new())
    }

    /// Task id carried by a cancellation request, by keyword or first position.
    pub fn task_id(&self) -> Option<&str> {
        self.kwargs
            .get("task_id")
            .or_else(|| self.args.first())
            .and_then(Value::as_str)
    }

    pub fn into_parts(self) -> (String, CallArgs) {
        (
            self.method,
            CallArgs {
                args: self.args,
                kwargs: self.kwargs,
            },
        )
    }
}

/// Envelopes sent from server to client, tagged by `status`.
///
/// A plain call gets exactly one `Ok` or `Error`. A stream gets
/// `StreamStart`, any number of `Progress`, then `StreamEnd` or `Error`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default)]
        data: Value,
    },
    Error {
        msg: String,
    },
    StreamStart {
        task_id: String,
    },
    Progress {
        #[serde(default)]
        data: Value,
    },
    StreamEnd,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Response::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { msg: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new("echo", CallArgs::new().arg(1).kwarg("loud", true));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"method": "echo", "args": [1], "kwargs": {"loud": true}})
        );
    }

    #[test]
    fn test_request_without_arguments_parses() {
        let request: Request = serde_json::from_value(json!({"method": "show"})).unwrap();
        assert!(request.args.is_empty());
        assert!(request.kwargs.is_empty());
    }

    #[test]
    fn test_response_status_tags() {
        assert_eq!(
            serde_json::to_value(Response::ok(json!([1, 2]))).unwrap(),
            json!({"status": "ok", "data": [1, 2]})
        );
        assert_eq!(
            serde_json::to_value(Response::error("boom")).unwrap(),
            json!({"status": "error", "msg": "boom"})
        );
        assert_eq!(
            serde_json::to_value(Response::StreamEnd).unwrap(),
            json!({"status": "stream_end"})
        );
        let start: Response =
            serde_json::from_value(json!({"status": "stream_start", "task_id": "abc"})).unwrap();
        assert_eq!(start, Response::StreamStart { task_id: "abc".into() });
    }

    #[test]
    fn test_bare_ok_has_null_data() {
        let reply: Response = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert_eq!(reply, Response::ok(Value::Null));
    }

    #[test]
    fn test_cancel_task_id_lookup() {
        assert_eq!(Request::cancel("t-1").task_id(), Some("t-1"));
        let positional = Request::new(CANCEL_METHOD, CallArgs::new().arg("t-2"));
        assert_eq!(positional.task_id(), Some("t-2"));
        assert_eq!(Request::ping().task_id(), None);
    }

    #[test]
    fn test_typed_argument_access() {
        let args = CallArgs::new().arg(3).arg("x").kwarg("scale", 2.5);
        assert_eq!(args.get::<i64>(0).unwrap(), 3);
        assert_eq!(args.get::<String>(1).unwrap(), "x");
        assert_eq!(args.get_kwarg::<f64>("scale").unwrap(), Some(2.5));
        assert_eq!(args.get_kwarg::<f64>("missing").unwrap(), None);
        assert!(matches!(args.get::<i64>(5), Err(IpcError::Protocol(_))));
        assert!(matches!(args.get::<i64>(1), Err(IpcError::Serde(_))));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved(CANCEL_METHOD));
        assert!(is_reserved(PING_METHOD));
        assert!(!is_reserved("echo"));
    }
}
