//! Error types for Stevedore gateway operations.

use thiserror::Error;

/// Main error type for gateway operations.
///
/// Systems-level variants (launch, initialization, protocol, connection
/// lost, call timeout) always tear down the affected pool entry before
/// they propagate. `Rpc` is the subprocess's own application-level error
/// and never affects process lifecycle.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Subprocess could not be started
    #[error("launch failed for server '{0}': {1}")]
    Launch(String, String),

    /// MCP handshake failed or produced an invalid response
    #[error("initialization failed for server '{0}': {1}")]
    Initialization(String, String),

    /// A frame could not be decoded or correlated to the pending request
    #[error("protocol error for server '{0}': {1}")]
    Protocol(String, String),

    /// Transport reported EOF or a write failed
    #[error("connection lost for server '{0}'")]
    ConnectionLost(String),

    /// Call to a named server timed out
    #[error("call timeout for server '{0}'")]
    CallTimeout(String),

    /// Application-level error response from the subprocess itself
    #[error("server '{server}' returned error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    /// Caller-supplied arguments could not be parsed
    #[error("invalid arguments: {0}")]
    Argument(String),

    /// Logical identifier not present in the registry
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    /// Invalid registry entry for a named server
    #[error("invalid config for server '{0}': {1}")]
    InvalidConfig(String, String),

    /// Registry file could not be read or parsed
    #[error("registry error: {0}")]
    Registry(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used in the facade's
    /// `{error: {kind, message}}` response shape.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch(..) => "launch_error",
            Self::Initialization(..) => "initialization_error",
            Self::Protocol(..) => "protocol_error",
            Self::ConnectionLost(..) => "connection_lost",
            Self::CallTimeout(..) => "call_timeout",
            Self::Rpc { .. } => "rpc_error",
            Self::Argument(..) => "argument_error",
            Self::UnknownServer(..) => "unknown_server",
            Self::InvalidConfig(..) => "invalid_config",
            Self::Registry(..) => "registry_error",
        }
    }

    /// True for systems-level failures that require tearing down the
    /// affected pool entry before the error is surfaced.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            Self::Launch(..)
                | Self::Initialization(..)
                | Self::Protocol(..)
                | Self::ConnectionLost(..)
                | Self::CallTimeout(..)
        )
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_display() {
        let err = GatewayError::Launch("web-search".to_string(), "No such file".to_string());
        assert_eq!(
            err.to_string(),
            "launch failed for server 'web-search': No such file"
        );
    }

    #[test]
    fn test_rpc_display() {
        let err = GatewayError::Rpc {
            server: "docs".to_string(),
            code: -32601,
            message: "unknown tool".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "server 'docs' returned error -32601: unknown tool"
        );
        assert_eq!(err.kind(), "rpc_error");
    }

    #[test]
    fn test_connection_lost_display() {
        let err = GatewayError::ConnectionLost("docs".to_string());
        assert_eq!(err.to_string(), "connection lost for server 'docs'");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(GatewayError::ConnectionLost("a".into()).is_fatal_to_process());
        assert!(GatewayError::Protocol("a".into(), "bad frame".into()).is_fatal_to_process());
        assert!(GatewayError::CallTimeout("a".into()).is_fatal_to_process());
        assert!(
            !GatewayError::Rpc {
                server: "a".into(),
                code: -1,
                message: "boom".into()
            }
            .is_fatal_to_process()
        );
        assert!(!GatewayError::UnknownServer("a".into()).is_fatal_to_process());
        assert!(!GatewayError::Argument("not json".into()).is_fatal_to_process());
    }
}
