use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by peerlink clients, servers and configuration loading.
///
/// `PeerOffline`, `RemoteExecution` and `Timeout` are routine outcomes for a
/// caller: the peer is not there, the peer reported a failure, or the peer
/// did not answer in time.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Target '{0}' is offline")]
    PeerOffline(String),

    #[error("Remote Error in {target}.{method}: {message}")]
    RemoteExecution {
        target: String,
        method: String,
        message: String,
    },

    #[error("Request Timeout: {target}.{method} did not reply within {timeout:?}")]
    Timeout {
        target: String,
        method: String,
        timeout: Duration,
    },

    #[error("Connection Dropped: {0}")]
    ConnectionDropped(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Method name '{0}' is reserved")]
    ReservedMethod(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl IpcError {
    /// True for failures that mean "the peer is not available right now".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, IpcError::PeerOffline(_) | IpcError::Timeout { .. })
    }
}

/// Result type for peerlink operations
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(IpcError::PeerOffline("Launcher".into()).is_unavailable());
        assert!(IpcError::Timeout {
            target: "Launcher".into(),
            method: "show".into(),
            timeout: Duration::from_secs(5),
        }
        .is_unavailable());
        assert!(!IpcError::RemoteExecution {
            target: "Launcher".into(),
            method: "show".into(),
            message: "boom".into(),
        }
        .is_unavailable());
    }

    #[test]
    fn test_remote_error_message_names_call_site() {
        let err = IpcError::RemoteExecution {
            target: "StatusBar".into(),
            method: "refresh".into(),
            message: "division by zero".into(),
        };
        assert_eq!(
            err.to_string(),
            "Remote Error in StatusBar.refresh: division by zero"
        );
    }
}
