//! Error types for the gateway.

use thiserror::Error;

/// Main error type for the gateway core.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No descriptor with this id exists in the registry.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// The descriptor names a transport the integrated client cannot drive.
    #[error("Unsupported transport '{transport}' for backend '{backend_id}'")]
    UnsupportedTransport {
        backend_id: String,
        transport: String,
    },

    /// Configuration errors (invalid descriptor file, missing transport fields)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Opening a connection to a backend failed.
    #[error("Failed to connect to backend '{backend_id}': {message}")]
    Connect { backend_id: String, message: String },

    /// The backend call itself failed (transport or protocol level).
    #[error("Backend '{backend_id}' failed: {message}")]
    Backend { backend_id: String, message: String },

    /// The backend executed the tool but reported an error result.
    #[error("Tool '{operation}' on backend '{backend_id}' failed: {message}")]
    ToolFailed {
        backend_id: String,
        operation: String,
        message: String,
    },

    /// The backend refused the request for lack of valid credentials (HTTP 401).
    #[error("Backend '{backend_id}' requires authorization")]
    Unauthorized { backend_id: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    /// Whether the backend rejected the request as unauthorized.
    ///
    /// Only the typed variant counts; connectors classify the transport's 401 into it.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_typed_variant_is_unauthorized() {
        let e = GatewayError::Unauthorized {
            backend_id: "b".into(),
        };
        assert!(e.is_unauthorized());
        assert_eq!(e.to_string(), "Backend 'b' requires authorization");

        let refused = GatewayError::Connect {
            backend_id: "b".into(),
            message: "error sending request for url (http://127.0.0.1:40199/mcp)".into(),
        };
        assert!(!refused.is_unauthorized());

        let tool = GatewayError::ToolFailed {
            backend_id: "b".into(),
            operation: "lookup".into(),
            message: "invoice 4012 missing".into(),
        };
        assert!(!tool.is_unauthorized());

        let text = GatewayError::Backend {
            backend_id: "b".into(),
            message: "HTTP status client error (401 Unauthorized)".into(),
        };
        assert!(!text.is_unauthorized());

        assert!(!GatewayError::UnknownBackend("401".into()).is_unauthorized());
    }
}
