//! JSON-RPC message types and the protocol server seam.
//!
//! The session manager only needs to build a protocol server for a session
//! and hand it requests; what the server exposes (tools, resources, prompts)
//! is up to the [`ProtocolServerFactory`] supplied by the embedding
//! application. [`BasicProtocolServer`] answers the lifecycle methods and
//! is what the standalone binary runs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::SessionError;
use super::transport::SessionTransport;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision reported when the client does not request one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: None,
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Handles protocol messages for one session.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Handles a request or notification. Returns `None` when no response
    /// is due (notifications).
    async fn handle(
        &self,
        transport: &SessionTransport,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse>;
}

/// Builds the protocol server for a session, both for new sessions and
/// when a session is reconstructed on another instance.
#[async_trait]
pub trait ProtocolServerFactory: Send + Sync {
    async fn create(
        &self,
        transport: Arc<SessionTransport>,
    ) -> Result<Arc<dyn ProtocolServer>, SessionError>;
}

/// Lifecycle-only MCP server: `initialize`, `notifications/initialized`
/// and `ping`.
#[derive(Debug, Clone)]
pub struct BasicProtocolServer {
    name: String,
    version: String,
}

impl BasicProtocolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    fn initialize_result(&self, params: Option<&Value>) -> Value {
        let protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        json!({
            "protocolVersion": protocol_version,
            "capabilities": {},
            "serverInfo": {
                "name": self.name,
                "version": self.version,
            }
        })
    }
}

#[async_trait]
impl ProtocolServer for BasicProtocolServer {
    async fn handle(
        &self,
        transport: &SessionTransport,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone()?;
        let response = match request.method.as_str() {
            "initialize" => {
                transport.mark_initialized();
                JsonRpcResponse::success(id, self.initialize_result(request.params.as_ref()))
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            other => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };
        Some(response)
    }
}

/// Factory producing [`BasicProtocolServer`]s.
#[derive(Debug, Clone)]
pub struct BasicServerFactory {
    server: Arc<BasicProtocolServer>,
}

impl BasicServerFactory {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server: Arc::new(BasicProtocolServer::new(name, version)),
        }
    }
}

impl Default for BasicServerFactory {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl ProtocolServerFactory for BasicServerFactory {
    async fn create(
        &self,
        _transport: Arc<SessionTransport>,
    ) -> Result<Arc<dyn ProtocolServer>, SessionError> {
        Ok(self.server.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TransportOptions;

    fn transport() -> SessionTransport {
        SessionTransport::new("s1", TransportOptions::default(), None)
    }

    #[tokio::test]
    async fn test_initialize_marks_transport() {
        let server = BasicProtocolServer::new("mcpgate", "0.1.0");
        let transport = transport();
        let request = JsonRpcRequest::new(1, "initialize")
            .with_params(json!({"protocolVersion": "2024-11-05"}));

        let response = server.handle(&transport, request).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "mcpgate");
        assert!(transport.is_initialized());
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let server = BasicProtocolServer::new("mcpgate", "0.1.0");
        let request = JsonRpcRequest::notification("notifications/initialized");
        assert!(server.handle(&transport(), request).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = BasicProtocolServer::new("mcpgate", "0.1.0");
        let response = server
            .handle(&transport(), JsonRpcRequest::new("a", "tools/call"))
            .await
            .unwrap();
        assert_eq!(response.id, json!("a"));
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_request_parsing() {
        let request: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(request.is_notification());

        let request: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert_eq!(request.id, Some(json!(7)));
    }
}
