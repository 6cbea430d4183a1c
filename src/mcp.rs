//! GatewayMcpServer — rmcp ServerHandler exposing the gateway operations
//! as MCP tools.
//!
//! The outward surface is deliberately small: instead of re-advertising
//! every downstream tool, the gateway publishes four meta-tools
//! (`list_available_tools`, `execute_tool`, `list_active_servers`,
//! `stop_server`) plus a live `list_server_tools` probe. Facade failures
//! are rendered into the tool result as a structured
//! `{error: {kind, message}}` payload rather than an MCP protocol error,
//! so callers can branch on the error kind.

use std::sync::Arc;

use rmcp::ErrorData as McpError;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
    ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use serde_json::{Map, Value, json};

use crate::gateway::{Gateway, RawArguments, error_body};

/// MCP server backed by a [`Gateway`].
///
/// `StreamableHttpService` calls the factory closure per session; each
/// clone shares the same gateway, so every session sees one pool.
#[derive(Clone)]
pub struct GatewayMcpServer {
    gateway: Arc<Gateway>,
}

impl GatewayMcpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn meta_tools() -> Vec<Tool> {
        vec![
            meta_tool(
                "list_available_tools",
                "List every tool offered by the registered servers, with the owning \
                 server id. Served from the registry; does not start any server.",
                json!({"type": "object", "properties": {}}),
            ),
            meta_tool(
                "execute_tool",
                "Execute a tool on a registered server. Starts the server on first \
                 use and reuses it afterwards.",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string", "description": "Registered server id"},
                        "tool": {"type": "string", "description": "Tool name on that server"},
                        "arguments": {
                            "description": "Tool arguments: a JSON object, or a JSON-encoded string",
                        },
                    },
                    "required": ["server", "tool"],
                }),
            ),
            meta_tool(
                "list_server_tools",
                "Ask a server for its live tool list, starting it if necessary.",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string", "description": "Registered server id"},
                    },
                    "required": ["server"],
                }),
            ),
            meta_tool(
                "list_active_servers",
                "List currently running servers with start time, last use, and idle timeout.",
                json!({"type": "object", "properties": {}}),
            ),
            meta_tool(
                "stop_server",
                "Stop a running server's process. Stopping a server that is not \
                 running is a no-op.",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string", "description": "Registered server id"},
                    },
                    "required": ["server"],
                }),
            ),
        ]
    }

    /// Route one meta-tool invocation. Split out of `call_tool` so tests
    /// can drive it without an rmcp request context.
    async fn dispatch(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let args = arguments.unwrap_or_default();
        match name {
            "list_available_tools" => {
                let tools = self.gateway.list_tools();
                success(json!({"tools": tools}))
            }
            "execute_tool" => {
                let server = require_str(&args, "server")?;
                let tool = require_str(&args, "tool")?;
                let raw = match args.get("arguments") {
                    None => RawArguments::Structured(Map::new()),
                    Some(Value::Object(map)) => RawArguments::Structured(map.clone()),
                    Some(Value::String(text)) => RawArguments::Encoded(text.clone()),
                    // Any other JSON type is rejected by normalization
                    // with a proper argument error.
                    Some(other) => RawArguments::Encoded(other.to_string()),
                };
                match self.gateway.execute(server, tool, raw).await {
                    Ok(result) => success(result),
                    Err(e) => failure(&e),
                }
            }
            "list_server_tools" => {
                let server = require_str(&args, "server")?;
                match self.gateway.live_tools(server).await {
                    Ok(tools) => success(tools),
                    Err(e) => failure(&e),
                }
            }
            "list_active_servers" => {
                let servers = self.gateway.list_active().await;
                success(json!({"servers": servers}))
            }
            "stop_server" => {
                let server = require_str(&args, "server")?;
                match self.gateway.stop(server).await {
                    Ok(result) => success(serde_json::to_value(result).map_err(|e| {
                        McpError::internal_error(e.to_string(), None)
                    })?),
                    Err(e) => failure(&e),
                }
            }
            other => Err(McpError::invalid_params(
                format!("unknown tool '{}'", other),
                None,
            )),
        }
    }
}

fn meta_tool(name: &str, description: &str, schema: Value) -> Tool {
    let input_schema = Arc::new(schema.as_object().cloned().unwrap_or_default());
    Tool {
        name: name.to_string().into(),
        title: None,
        description: Some(description.to_string().into()),
        input_schema,
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

fn require_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, McpError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| McpError::invalid_params(format!("missing required argument '{}'", key), None))
}

fn success(payload: Value) -> Result<CallToolResult, McpError> {
    let content =
        Content::json(payload).map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult {
        content: vec![content],
        is_error: Some(false),
        structured_content: None,
        meta: None,
    })
}

fn failure(error: &crate::error::GatewayError) -> Result<CallToolResult, McpError> {
    let content =
        Content::json(error_body(error)).map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult {
        content: vec![content],
        is_error: Some(true),
        structured_content: None,
        meta: None,
    })
}

impl ServerHandler for GatewayMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: env!("CARGO_PKG_NAME").into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Stevedore MCP gateway — runs registered MCP servers in isolated \
                 subprocesses and exposes their tools through a fixed meta-tool surface."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: Self::meta_tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.dispatch(&request.name, request.arguments).await
    }
}
