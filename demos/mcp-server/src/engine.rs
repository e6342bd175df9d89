//! Minimal JSON-RPC 2.0 tool server speaking over a session transport.
//!
//! Results go back over the SSE stream; the POST itself is only
//! acknowledged with 202.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use session_relay_core::{
    EngineError, EngineInit, ProtocolEngine, RelayRequest, ResponseSink, Transport,
    http::read_body,
};

const JSONRPC_VERSION: &str = "2.0";
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Engine factory: one engine per session.
pub fn init() -> EngineInit {
    Arc::new(|| Arc::new(ToolServer::default()) as Arc<dyn ProtocolEngine>)
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OutgoingMessage {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl OutgoingMessage {
    fn reply(id: Value, outcome: Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Echo,
    Reverse,
}

impl Tool {
    const ALL: [Self; 2] = [Self::Echo, Self::Reverse];

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "echo" => Some(Self::Echo),
            "reverse" => Some(Self::Reverse),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Reverse => "reverse",
        }
    }

    const fn argument(self) -> &'static str {
        match self {
            Self::Echo => "message",
            Self::Reverse => "text",
        }
    }

    fn describe(self) -> Value {
        let description = match self {
            Self::Echo => "Echo a message",
            Self::Reverse => "Reverse a string",
        };
        let mut properties = serde_json::Map::new();
        properties.insert(self.argument().to_string(), json!({ "type": "string" }));
        json!({
            "name": self.name(),
            "description": description,
            "inputSchema": {
                "type": "object",
                "properties": properties,
                "required": [self.argument()],
            },
        })
    }

    fn call(self, arguments: &Value) -> Result<String, RpcError> {
        let input = arguments
            .get(self.argument())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RpcError::new(
                    INVALID_PARAMS,
                    format!("Missing string argument '{}'", self.argument()),
                )
            })?;
        Ok(match self {
            Self::Echo => format!("Tool echo: {input}"),
            Self::Reverse => input.chars().rev().collect(),
        })
    }
}

/// Session-bound tool server.
#[derive(Default)]
pub struct ToolServer {
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl ToolServer {
    fn transport(&self) -> Result<Arc<dyn Transport>, EngineError> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::NotConnected)
    }

    fn dispatch(method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => {
                let version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_PROTOCOL_VERSION);
                Ok(json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({
                "tools": Tool::ALL.iter().map(|tool| tool.describe()).collect::<Vec<_>>(),
            })),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let tool = Tool::from_name(name)
                    .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("Unknown tool: {name}")))?;
                // Older clients send `input` instead of `arguments`.
                let arguments = params
                    .get("arguments")
                    .or_else(|| params.get("input"))
                    .unwrap_or(&Value::Null);
                let text = tool.call(arguments)?;
                Ok(json!({ "content": [{ "type": "text", "text": text }] }))
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }
}

fn reject(response: &mut dyn ResponseSink, status: u16, message: String) -> EngineError {
    response.write(status, Bytes::from(message.clone()));
    EngineError::InvalidMessage(message)
}

#[async_trait]
impl ProtocolEngine for ToolServer {
    async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), EngineError> {
        *self.transport.lock().unwrap_or_else(PoisonError::into_inner) = Some(transport);
        Ok(())
    }

    async fn handle_post_message(
        &self,
        request: &mut dyn RelayRequest,
        response: &mut dyn ResponseSink,
    ) -> Result<(), EngineError> {
        let transport = self.transport()?;

        let content_type = request.header("content-type").unwrap_or_default();
        if !content_type.contains("application/json") {
            let message = format!("Unsupported content-type: {content_type}");
            return Err(reject(response, 415, message));
        }

        let body = read_body(request).await?;
        let message: IncomingMessage = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => return Err(reject(response, 400, format!("Invalid message: {e}"))),
        };

        match (message.id, message.method) {
            (Some(id), Some(method)) => {
                let reply = OutgoingMessage::reply(id, Self::dispatch(&method, &message.params));
                let json = serde_json::to_string(&reply)
                    .map_err(|e| EngineError::Other(format!("Failed to serialize reply: {e}")))?;
                transport.send(json).await?;
            }
            (None, Some(method)) => tracing::debug!(method = %method, "Notification received"),
            (_, None) => tracing::debug!("Ignoring message without method"),
        }

        response.write(202, Bytes::from_static(b"Accepted"));
        Ok(())
    }
}
