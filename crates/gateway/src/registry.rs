//! Static backend registry.
//!
//! The registry is loaded once from a descriptor file (JSON or YAML; YAML is a superset of JSON
//! so a single parser handles both) and never mutated afterwards.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Connection transport named by a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Spawned child process speaking the protocol over stdin/stdout.
    #[default]
    Stdio,
    /// Streamable HTTP endpoint.
    StreamableHttp,
    /// Anything else (kept so the failure surfaces at connect time, not load time).
    Other(String),
}

impl TransportKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stdio => "stdio",
            Self::StreamableHttp => "streamable_http",
            Self::Other(s) => s,
        }
    }

    /// Read the raw `transport` field. Absent or null means stdio; a non-string tag is kept as
    /// an unsupported transport.
    fn from_field(value: Option<serde_yaml::Value>) -> Self {
        match value {
            None | Some(serde_yaml::Value::Null) => Self::Stdio,
            Some(serde_yaml::Value::String(s)) => Self::from(s),
            Some(other) => Self::Other(
                serde_yaml::to_string(&other)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default(),
            ),
        }
    }
}

impl From<String> for TransportKind {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Self::Stdio,
            "http" | "streamable_http" | "streamable-http" | "http-stream" | "http_stream" => {
                Self::StreamableHttp
            }
            _ => Self::Other(s),
        }
    }
}

/// Connection lifetime policy for a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// One cached connection reused across calls until `close_all`.
    #[default]
    Persistent,
    /// A fresh connection is opened for each call and closed when the call ends.
    PerCall,
}

/// Per-backend OAuth client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSettings {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    /// Requested scopes, in order (duplicates are dropped on use).
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// An immutable backend descriptor.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub id: String,
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub lifecycle: Lifecycle,
    pub authorization: Option<AuthorizationSettings>,
}

/// On-disk record shape. `id` and `transport` stay raw so one bad record cannot fail the file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendRecord {
    #[serde(default)]
    id: Option<serde_yaml::Value>,
    #[serde(default)]
    transport: Option<serde_yaml::Value>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    lifecycle: Lifecycle,
    #[serde(default)]
    authorization: Option<AuthorizationSettings>,
}

#[derive(Debug, Default)]
pub struct BackendRegistry {
    /// Descriptors in config order.
    descriptors: Vec<Arc<BackendDescriptor>>,
    /// `id` -> index into `descriptors`
    index: HashMap<String, usize>,
}

impl BackendRegistry {
    /// Load the registry from a descriptor file.
    ///
    /// A missing file yields an empty registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "backend config not found; registry is empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&text).map_err(|e| {
            GatewayError::Config(format!("failed to parse '{}': {e}", path.display()))
        })
    }

    /// Parse a descriptor document (JSON or YAML sequence of records).
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a sequence of backend records.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let records: Option<Vec<BackendRecord>> = serde_yaml::from_str(text)?;
        Ok(Self::from_records(records.unwrap_or_default()))
    }

    fn from_records(records: Vec<BackendRecord>) -> Self {
        Self::from_descriptors(records.into_iter().filter_map(|r| {
            let id = match r.id {
                Some(serde_yaml::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                Some(serde_yaml::Value::String(_) | serde_yaml::Value::Null) | None => {
                    tracing::warn!("backend record without id; skipping");
                    return None;
                }
                Some(other) => {
                    tracing::warn!(id = ?other, "backend record id is not a string; skipping");
                    return None;
                }
            };
            Some(BackendDescriptor {
                id,
                transport: TransportKind::from_field(r.transport),
                command: r.command,
                args: r.args,
                env: r.env,
                url: r.url,
                lifecycle: r.lifecycle,
                authorization: r.authorization,
            })
        }))
    }

    /// Build a registry from descriptors. Later duplicates of an id are dropped.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        let mut out = Self::default();
        for d in descriptors {
            if out.index.contains_key(&d.id) {
                tracing::warn!(backend_id = %d.id, "duplicate backend id; keeping the first");
                continue;
            }
            out.index.insert(d.id.clone(), out.descriptors.len());
            out.descriptors.push(Arc::new(d));
        }
        out
    }

    /// Backend ids in config order.
    #[must_use]
    pub fn list_ids(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.id.clone()).collect()
    }

    /// Resolve an id to its descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownBackend`] if no descriptor has this id.
    pub fn resolve(&self, id: &str) -> Result<Arc<BackendDescriptor>> {
        self.index
            .get(id)
            .and_then(|i| self.descriptors.get(*i))
            .cloned()
            .ok_or_else(|| GatewayError::UnknownBackend(id.to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
