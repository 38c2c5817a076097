use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::{
    context::{Services, ToolContext},
    error::{FailureKind, ToolError},
    registry::{Arguments, ToolRegistry},
    resources::{read_resource, ResourceError, RESOURCE_CATALOG},
};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "host-admin-mcp";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(JsonRpcError),
}

/// One JSON-RPC response. `result` and `error` are mutually exclusive by
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub id: Value,
}

impl JsonRpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            outcome: Outcome::Result(result),
            id,
        }
    }

    fn error(id: Value, code: i64, message: &str, data: Option<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            outcome: Outcome::Error(JsonRpcError {
                code,
                message: message.to_string(),
                data: data.map(Value::String),
            }),
            id,
        }
    }

    #[cfg(test)]
    pub fn error_code(&self) -> Option<i64> {
        match &self.outcome {
            Outcome::Error(err) => Some(err.code),
            Outcome::Result(_) => None,
        }
    }
}

/// Turns raw request bodies into responses. Holds no per-request state.
#[derive(Clone)]
pub struct McpDispatcher {
    registry: Arc<ToolRegistry>,
    services: Arc<Services>,
}

impl McpDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, services: Arc<Services>) -> Self {
        Self { registry, services }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn handle(&self, body: &[u8], principal: &str) -> JsonRpcResponse {
        let request: Value = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(err) => {
                debug!("Rejected unparsable request body: {err}");
                return JsonRpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    "Parse error",
                    Some(err.to_string()),
                );
            }
        };

        let Value::Object(envelope) = request else {
            return JsonRpcResponse::error(
                Value::Null,
                INVALID_REQUEST,
                "Invalid Request",
                Some("Request must be a JSON object".to_string()),
            );
        };

        let id = envelope.get("id").cloned().unwrap_or(Value::Null);
        if envelope.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                "Invalid Request",
                Some("jsonrpc must be '2.0'".to_string()),
            );
        }

        let method = match envelope.get("method").and_then(Value::as_str) {
            Some(method) if !method.trim().is_empty() => method,
            _ => {
                return JsonRpcResponse::error(
                    id,
                    INVALID_REQUEST,
                    "Invalid Request",
                    Some("method is required".to_string()),
                )
            }
        };
        let params = envelope.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => JsonRpcResponse::ok(id, self.initialize()),
            "tools/list" => JsonRpcResponse::ok(
                id,
                json!({"tools": self.registry.descriptors()}),
            ),
            "tools/call" => self.tools_call(id, params, principal).await,
            "resources/list" => JsonRpcResponse::ok(id, json!({"resources": RESOURCE_CATALOG})),
            "resources/read" => self.resources_read(id, params, principal).await,
            other => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                "Method not found",
                Some(format!("Unknown method: {other}")),
            ),
        }
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": {},
                "resources": {},
            },
        })
    }

    async fn tools_call(&self, id: Value, params: Value, principal: &str) -> JsonRpcResponse {
        let invalid = |detail: String| {
            JsonRpcResponse::error(id.clone(), INVALID_PARAMS, "Invalid params", Some(detail))
        };

        let params = match params {
            Value::Object(params) => params,
            Value::Null => Arguments::new(),
            _ => return invalid("params must be an object".to_string()),
        };

        let name = match params.get("name").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => return invalid("Tool name is required".to_string()),
        };
        if !self.registry.contains(&name) {
            return invalid(format!("Unknown tool: {name}"));
        }

        let arguments = match params.get("arguments").cloned() {
            None | Some(Value::Null) => Arguments::new(),
            Some(Value::Object(arguments)) => arguments,
            Some(_) => return invalid("arguments must be an object".to_string()),
        };

        let ctx = ToolContext::new(self.services.clone(), principal);
        let trace_id = ctx.trace_id.clone();
        info!(tool = %name, trace_id = %trace_id, "Calling tool");

        match self.registry.dispatch(ctx, &name, arguments).await {
            Ok(result) => match serde_json::to_string_pretty(&result) {
                Ok(text) => JsonRpcResponse::ok(
                    id,
                    json!({"content": [{"type": "text", "text": text}]}),
                ),
                Err(err) => {
                    error!(tool = %name, trace_id = %trace_id, "Failed to encode tool result: {err}");
                    JsonRpcResponse::error(
                        id,
                        INTERNAL_ERROR,
                        "Tool execution failed",
                        Some(err.to_string()),
                    )
                }
            },
            Err(err) => {
                error!(
                    tool = %name,
                    trace_id = %trace_id,
                    kind = ?err.kind(),
                    "Tool execution failed: {}",
                    log_message(&err)
                );
                JsonRpcResponse::error(
                    id,
                    wire_code(err.kind()),
                    "Tool execution failed",
                    Some(client_message(&err)),
                )
            }
        }
    }

    async fn resources_read(&self, id: Value, params: Value, principal: &str) -> JsonRpcResponse {
        let uri = match params.get("uri").and_then(Value::as_str) {
            Some(uri) if !uri.trim().is_empty() => uri.to_string(),
            _ => {
                return JsonRpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    "Invalid params",
                    Some("Resource URI is required".to_string()),
                )
            }
        };

        let ctx = ToolContext::new(self.services.clone(), principal);
        match read_resource(ctx, &uri).await {
            Ok(content) => JsonRpcResponse::ok(id, json!({"contents": [content]})),
            Err(err @ ResourceError::UnknownUri(_)) => JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                "Invalid params",
                Some(err.to_string()),
            ),
            Err(ResourceError::Read(err)) => {
                error!(uri = %uri, "Resource read failed: {}", log_message(&err));
                JsonRpcResponse::error(
                    id,
                    INTERNAL_ERROR,
                    "Resource read failed",
                    Some(client_message(&err)),
                )
            }
        }
    }
}

/// Every handler-level failure, rate-limit rejection included, surfaces as
/// an internal error. Unknown tools are caught before dispatch.
fn wire_code(kind: FailureKind) -> i64 {
    match kind {
        FailureKind::NotFound => INVALID_PARAMS,
        FailureKind::InvalidParams | FailureKind::RateLimited | FailureKind::ExecutionFailed => {
            INTERNAL_ERROR
        }
    }
}

/// Outermost message only; context chains can carry paths and driver detail.
fn client_message(err: &ToolError) -> String {
    err.to_string()
}

fn log_message(err: &ToolError) -> String {
    match err {
        ToolError::ExecutionFailed(inner) => format!("{inner:#}"),
        other => other.to_string(),
    }
}
