//! `rmcp`-backed implementation of the backend client seam.

use crate::backend::{
    BackendConnector, BackendSession, Capability, ConnectionHandle, SessionCapabilities,
    TransportParams,
};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use rmcp::{
    RoleClient, ServiceError, ServiceExt as _,
    model::{CallToolRequestParams, CallToolResult},
    service::{ClientInitializeError, Peer, RunningService},
    transport::{
        ConfigureCommandExt as _, DynamicTransportError, StreamableHttpClientTransport,
        TokioChildProcess,
        streamable_http_client::{StreamableHttpClientTransportConfig, StreamableHttpError},
    },
};
use serde_json::{Map, Value};
use std::time::Duration;

/// Opens `rmcp` client sessions over child-process or streamable HTTP transports.
#[derive(Debug, Clone, Default)]
pub struct RmcpConnector {
    /// Connect timeout for the HTTP transport's client.
    pub http_connect_timeout: Option<Duration>,
}

impl RmcpConnector {
    fn build_http_client(&self, bearer_token: Option<&str>) -> Result<reqwest::Client> {
        use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

        let mut builder = reqwest::Client::builder();
        if let Some(t) = self.http_connect_timeout {
            builder = builder.connect_timeout(t);
        }
        if let Some(token) = bearer_token {
            let mut headers = HeaderMap::new();
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GatewayError::Config(format!("invalid bearer token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        builder
            .build()
            .map_err(|e| GatewayError::Config(format!("build http client: {e}")))
    }
}

type HttpTransportError = StreamableHttpError<reqwest::Error>;

/// How a streamable HTTP transport failure relates to authorization.
enum HttpRejection {
    /// The server answered 401.
    Unauthorized,
    /// The server answered, but not with a protocol response; the status is unknown.
    Unreadable,
    Other,
}

fn classify_transport(error: &DynamicTransportError) -> HttpRejection {
    match error.error.downcast_ref::<HttpTransportError>() {
        Some(StreamableHttpError::AuthRequired(_)) => HttpRejection::Unauthorized,
        Some(StreamableHttpError::Client(e))
            if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) =>
        {
            HttpRejection::Unauthorized
        }
        Some(StreamableHttpError::Client(e)) if e.is_decode() => HttpRejection::Unreadable,
        Some(
            StreamableHttpError::UnexpectedContentType(_)
            | StreamableHttpError::UnexpectedServerResponse(_)
            | StreamableHttpError::Deserialize(_),
        ) => HttpRejection::Unreadable,
        _ => HttpRejection::Other,
    }
}

/// The HTTP endpoint a session talks to, kept to re-check rejected requests.
struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
}

impl HttpEndpoint {
    /// Whether the endpoint answers a bare JSON-RPC POST with 401.
    ///
    /// A 401 without `WWW-Authenticate` reaches the transport as an unexpected content type, so
    /// the status has to be read from a fresh request.
    async fn answers_unauthorized(&self) -> bool {
        self.client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&serde_json::json!({"jsonrpc": "2.0", "id": 0, "method": "ping"}))
            .send()
            .await
            .is_ok_and(|r| r.status() == reqwest::StatusCode::UNAUTHORIZED)
    }

    async fn is_unauthorized(&self, error: &DynamicTransportError) -> bool {
        match classify_transport(error) {
            HttpRejection::Unauthorized => true,
            HttpRejection::Unreadable => self.answers_unauthorized().await,
            HttpRejection::Other => false,
        }
    }
}

#[async_trait]
impl BackendConnector for RmcpConnector {
    async fn connect(&self, backend_id: &str, params: TransportParams) -> Result<ConnectionHandle> {
        let connect_err = |message: String| GatewayError::Connect {
            backend_id: backend_id.to_string(),
            message,
        };

        let (service, http) = match params {
            TransportParams::Process { command, args, env } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(&command).configure(|cmd| {
                        cmd.args(&args)
                            .envs(env.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| connect_err(format!("spawn '{command}': {e}")))?;

                let service = ()
                    .serve(transport)
                    .await
                    .map_err(|e| connect_err(format!("initialize stdio client: {e}")))?;
                (service, None)
            }
            TransportParams::StreamableHttp { url, bearer_token } => {
                let client = self.build_http_client(bearer_token.as_deref())?;
                let endpoint = HttpEndpoint {
                    client: client.clone(),
                    url: url.clone(),
                };
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.as_str()),
                );

                match ().serve(transport).await {
                    Ok(service) => (service, Some(endpoint)),
                    Err(e) => {
                        if let ClientInitializeError::TransportError { error, .. } = &e
                            && endpoint.is_unauthorized(error).await
                        {
                            tracing::debug!(
                                backend_id = %backend_id,
                                "backend rejected initialize as unauthorized"
                            );
                            return Err(GatewayError::Unauthorized {
                                backend_id: backend_id.to_string(),
                            });
                        }
                        return Err(connect_err(format!(
                            "initialize streamable http client: {e}"
                        )));
                    }
                }
            }
        };

        let capabilities = SessionCapabilities {
            list_tools: service
                .peer_info()
                .is_some_and(|info| info.capabilities.tools.is_some()),
        };

        tracing::debug!(
            backend_id = %backend_id,
            list_tools = capabilities.list_tools,
            "rmcp session initialized"
        );

        Ok(std::sync::Arc::new(RmcpSession {
            backend_id: backend_id.to_string(),
            peer: service.peer().clone(),
            capabilities,
            http,
            service: tokio::sync::Mutex::new(Some(service)),
        }))
    }
}

pub struct RmcpSession {
    backend_id: String,
    peer: Peer<RoleClient>,
    capabilities: SessionCapabilities,
    http: Option<HttpEndpoint>,
    /// Owned service; taken on close.
    service: tokio::sync::Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpSession {
    async fn request_error(&self, error: ServiceError) -> GatewayError {
        if let (ServiceError::TransportSend(transport), Some(http)) = (&error, &self.http)
            && http.is_unauthorized(transport).await
        {
            return GatewayError::Unauthorized {
                backend_id: self.backend_id.clone(),
            };
        }
        GatewayError::Backend {
            backend_id: self.backend_id.clone(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl BackendSession for RmcpSession {
    async fn call(&self, operation: &str, arguments: Map<String, Value>) -> Result<Value> {
        let params = CallToolRequestParams {
            meta: None,
            name: operation.to_string().into(),
            arguments: Some(arguments),
            task: None,
        };

        let result = match self.peer.call_tool(params).await {
            Ok(result) => result,
            Err(e) => return Err(self.request_error(e).await),
        };

        if result.is_error == Some(true) {
            return Err(GatewayError::ToolFailed {
                backend_id: self.backend_id.clone(),
                operation: operation.to_string(),
                message: first_text(&result).unwrap_or("tool reported an error").to_string(),
            });
        }

        Ok(call_result_value(result))
    }

    fn capabilities(&self) -> SessionCapabilities {
        self.capabilities
    }

    async fn list_capabilities(&self) -> Result<Vec<Capability>> {
        let tools = match self.peer.list_all_tools().await {
            Ok(tools) => tools,
            Err(e) => return Err(self.request_error(e).await),
        };

        Ok(tools
            .into_iter()
            .map(|t| Capability {
                name: t.name.to_string(),
                description: t.description.as_deref().map(str::to_string),
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        service
            .cancel()
            .await
            .map(|_reason| ())
            .map_err(|e| GatewayError::Backend {
                backend_id: self.backend_id.clone(),
                message: format!("close failed: {e}"),
            })
    }
}

fn first_text(result: &CallToolResult) -> Option<&str> {
    result
        .content
        .iter()
        .find_map(|c| c.as_text().map(|t| t.text.as_str()))
}

/// Normalize a tool result into a single JSON value.
///
/// Preference order: `structuredContent`, a single text block parsed as JSON, that text as a
/// JSON string, and finally the serialized result itself.
#[must_use]
pub fn call_result_value(result: CallToolResult) -> Value {
    if let Some(structured) = result.structured_content.clone() {
        return structured;
    }
    if result.content.len() == 1
        && let Some(text) = first_text(&result)
    {
        return serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
    }
    serde_json::to_value(&result).unwrap_or(Value::Null)
}
