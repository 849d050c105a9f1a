//! Protocol client seam.
//!
//! The connection manager never talks to a client library directly: it builds
//! [`TransportParams`] from a descriptor and hands them to a [`BackendConnector`]. The production
//! connector lives in [`crate::rmcp_backend`]; tests plug in fakes.

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Transport-specific connection parameters, built from a descriptor at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportParams {
    Process {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        /// Bearer token from the credential cache, if one is held for this backend.
        bearer_token: Option<String>,
    },
}

/// Optional operations a session supports, resolved when the session is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCapabilities {
    pub list_tools: bool,
}

/// One callable operation advertised by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A live channel to one backend.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Invoke `operation` with `arguments` and return its normalized JSON result.
    async fn call(&self, operation: &str, arguments: Map<String, Value>) -> Result<Value>;

    fn capabilities(&self) -> SessionCapabilities;

    /// List operations. Only called when [`SessionCapabilities::list_tools`] is set.
    async fn list_capabilities(&self) -> Result<Vec<Capability>>;

    /// Release the channel. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}

pub type ConnectionHandle = Arc<dyn BackendSession>;

/// Opens sessions. Implemented once per client library.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, backend_id: &str, params: TransportParams) -> Result<ConnectionHandle>;
}
