//! MCP tool surface over the [`Gateway`] facade.

use crate::chain::ChainStep;
use crate::gateway::{Gateway, completion_json};
use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, Content, Implementation, JsonObject,
        ListToolsResult, PaginatedRequestParams, ProtocolVersion, ServerCapabilities, ServerInfo,
        Tool,
    },
    service::RequestContext,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub const TOOL_LIST_BACKEND_IDS: &str = "list_backend_ids";
pub const TOOL_CALL_BACKEND_TOOL: &str = "call_backend_tool";
pub const TOOL_LIST_BACKEND_CAPABILITIES: &str = "list_backend_capabilities";
pub const TOOL_RUN_CHAIN: &str = "run_chain";
pub const TOOL_BEGIN_AUTHORIZATION: &str = "begin_authorization";
pub const TOOL_COMPLETE_AUTHORIZATION: &str = "complete_authorization";

#[derive(Debug, Deserialize)]
struct BackendArgs {
    #[serde(alias = "server_id")]
    backend_id: String,
}

#[derive(Debug, Deserialize)]
struct CallArgs {
    #[serde(alias = "server_id")]
    backend_id: String,
    #[serde(alias = "tool", alias = "tool_name")]
    operation: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ChainArgs {
    steps: Vec<ChainStep>,
}

#[derive(Debug, Deserialize)]
struct CompleteArgs {
    state: String,
    code: String,
}

#[derive(Clone)]
pub struct GatewayServer {
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpError> {
        match name {
            TOOL_LIST_BACKEND_IDS => Ok(json_result(&json!(self.gateway.list_backend_ids()))),
            TOOL_CALL_BACKEND_TOOL => {
                let args: CallArgs = parse_args(arguments)?;
                let result = self
                    .gateway
                    .call_backend_tool(&args.backend_id, &args.operation, args.arguments)
                    .await;
                Ok(match result {
                    Ok(outcome) => json_result(&outcome.into_json()),
                    Err(e) => error_result(e.to_string()),
                })
            }
            TOOL_LIST_BACKEND_CAPABILITIES => {
                let args: BackendArgs = parse_args(arguments)?;
                let result = self.gateway.list_backend_capabilities(&args.backend_id).await;
                Ok(match result {
                    Ok(caps) => json_result(&json!(caps)),
                    Err(e) => error_result(e.to_string()),
                })
            }
            TOOL_RUN_CHAIN => {
                let args: ChainArgs = parse_args(arguments)?;
                Ok(match self.gateway.run_chain(&args.steps).await {
                    Ok(outcome) => json_result(&outcome.into_json()),
                    Err(e) => {
                        let body = json!({
                            "error": e.source.to_string(),
                            "step": e.step,
                            "completed": e.completed,
                        });
                        CallToolResult::error(vec![Content::text(body.to_string())])
                    }
                })
            }
            TOOL_BEGIN_AUTHORIZATION => {
                let args: BackendArgs = parse_args(arguments)?;
                Ok(match self.gateway.begin_authorization(&args.backend_id) {
                    Ok(url) => json_result(&json!({
                        "backend_id": args.backend_id,
                        "authorization_url": url,
                    })),
                    Err(e) => error_result(e.to_string()),
                })
            }
            TOOL_COMPLETE_AUTHORIZATION => {
                let args: CompleteArgs = parse_args(arguments)?;
                let result = self
                    .gateway
                    .complete_authorization(&args.state, &args.code)
                    .await;
                let body = completion_json(&result);
                Ok(if result.is_ok() {
                    json_result(&body)
                } else {
                    CallToolResult::error(vec![Content::text(body.to_string())])
                })
            }
            other => Err(McpError::invalid_params(
                format!("unknown tool '{other}'"),
                None,
            )),
        }
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Map<String, Value>) -> Result<T, McpError> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|e| McpError::invalid_params(format!("invalid arguments: {e}"), None))
}

fn json_result(value: &Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(value.to_string())])
}

fn error_result(message: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message)])
}

fn schema(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

fn backend_id_schema() -> Arc<JsonObject> {
    schema(json!({
        "type": "object",
        "properties": { "backend_id": { "type": "string" } },
        "required": ["backend_id"],
    }))
}

/// The tools this server exposes, in a stable order.
#[must_use]
pub fn tools() -> Vec<Tool> {
    vec![
        Tool::new(
            TOOL_LIST_BACKEND_IDS,
            "List the ids of configured backends, in configuration order.",
            schema(json!({ "type": "object", "properties": {} })),
        ),
        Tool::new(
            TOOL_CALL_BACKEND_TOOL,
            "Call a tool on a backend. Returns the tool result, or an authorization_required \
             object with a URL to visit when the backend needs authorization.",
            schema(json!({
                "type": "object",
                "properties": {
                    "backend_id": { "type": "string" },
                    "operation": { "type": "string" },
                    "arguments": { "type": "object" },
                },
                "required": ["backend_id", "operation"],
            })),
        ),
        Tool::new(
            TOOL_LIST_BACKEND_CAPABILITIES,
            "List the tools a backend advertises (empty if it does not support listing).",
            backend_id_schema(),
        ),
        Tool::new(
            TOOL_RUN_CHAIN,
            "Run backend tool calls in sequence. String arguments of the form {{prev}} or \
             {{prev.path.to.field}} are replaced with the previous step's result.",
            schema(json!({
                "type": "object",
                "properties": {
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "backend_id": { "type": "string" },
                                "operation": { "type": "string" },
                                "arguments": { "type": "object" },
                            },
                            "required": ["backend_id", "operation"],
                        },
                    },
                },
                "required": ["steps"],
            })),
        ),
        Tool::new(
            TOOL_BEGIN_AUTHORIZATION,
            "Start authorization for a backend and return the URL the user should visit.",
            backend_id_schema(),
        ),
        Tool::new(
            TOOL_COMPLETE_AUTHORIZATION,
            "Finish authorization with the state and code from the redirect.",
            schema(json!({
                "type": "object",
                "properties": {
                    "state": { "type": "string" },
                    "code": { "type": "string" },
                },
                "required": ["state", "code"],
            })),
        ),
    ]
}

impl ServerHandler for GatewayServer {
    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: tools(),
            ..Default::default()
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let name = request.name.to_string();
            tracing::debug!(tool = %name, "tool call");
            self.dispatch(&name, request.arguments.unwrap_or_default())
                .await
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            protocol_version: ProtocolVersion::LATEST,
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Blackbox gateway".to_string()),
                ..Default::default()
            },
            instructions: Some(
                "Call list_backend_ids first. Use call_backend_tool for single calls and run_chain \
                 for dependent sequences. If a result has status authorization_required, ask the \
                 user to open authorization_url, then retry."
                    .to_string(),
            ),
        }
    }
}
