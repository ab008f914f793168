//! JSON-RPC 2.0 framing and the slice of MCP the gateway understands.
//!
//! The gateway never interprets tool payloads; it only needs the envelope
//! (request / notification / response / error) plus the list results it
//! aggregates into the session catalog. Everything else rides through as raw
//! `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision advertised to clients and sent to upstreams.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

// Lowercase so the names are valid for `HeaderName::from_static`; header
// matching is case-insensitive on the wire.
pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";
pub const METHOD_PROMPTS_LIST: &str = "prompts/list";
pub const METHOD_PROMPTS_GET: &str = "prompts/get";

pub const NOTIF_INITIALIZED: &str = "notifications/initialized";
pub const NOTIF_TOOLS_CHANGED: &str = "notifications/tools/list_changed";
pub const NOTIF_RESOURCES_CHANGED: &str = "notifications/resources/list_changed";
pub const NOTIF_PROMPTS_CHANGED: &str = "notifications/prompts/list_changed";

// Standard JSON-RPC error codes.
pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INTERNAL_ERROR: i64 = -32603;

#[derive(Error, Debug)]
pub enum ProtocolError {
	#[error("invalid JSON: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("invalid JSON-RPC message: {0}")]
	InvalidMessage(String),
}

/// A request id as JSON-RPC allows it: number or string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	Number(i64),
	String(String),
}

impl std::fmt::Display for RequestId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RequestId::Number(n) => write!(f, "{n}"),
			RequestId::String(s) => write!(f, "{s}"),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
	pub jsonrpc: String,
	pub id: RequestId,
	pub method: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcNotification {
	pub jsonrpc: String,
	pub method: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
	pub jsonrpc: String,
	pub id: RequestId,
	pub result: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
	pub jsonrpc: String,
	// Errors for unparseable requests carry a null id.
	pub id: Option<RequestId>,
	pub error: ErrorBody,
}

/// A classified inbound JSON-RPC message.
#[derive(Clone, Debug)]
pub enum Message {
	Request(JsonRpcRequest),
	Notification(JsonRpcNotification),
	Response(JsonRpcResponse),
	Error(JsonRpcErrorResponse),
}

impl Message {
	/// Classify a raw value: `method` with `id` is a request, `method` without
	/// `id` a notification, `result` a response, `error` an error response.
	pub fn from_value(v: Value) -> Result<Message, ProtocolError> {
		let obj = v
			.as_object()
			.ok_or_else(|| ProtocolError::InvalidMessage("not a JSON object".to_string()))?;
		let has_id = obj.contains_key("id") && !obj["id"].is_null();
		let has_method = obj.contains_key("method");
		match (has_method, has_id) {
			(true, true) => Ok(Message::Request(serde_json::from_value(v)?)),
			(true, false) => Ok(Message::Notification(serde_json::from_value(v)?)),
			(false, _) if obj.contains_key("result") => Ok(Message::Response(serde_json::from_value(v)?)),
			(false, _) if obj.contains_key("error") => Ok(Message::Error(serde_json::from_value(v)?)),
			_ => Err(ProtocolError::InvalidMessage(
				"neither request, notification, response, nor error".to_string(),
			)),
		}
	}

	pub fn from_str(s: &str) -> Result<Message, ProtocolError> {
		Message::from_value(serde_json::from_str(s)?)
	}

	pub fn to_value(&self) -> Value {
		match self {
			Message::Request(m) => serde_json::to_value(m).expect("valid message"),
			Message::Notification(m) => serde_json::to_value(m).expect("valid message"),
			Message::Response(m) => serde_json::to_value(m).expect("valid message"),
			Message::Error(m) => serde_json::to_value(m).expect("valid message"),
		}
	}
}

pub fn request(id: RequestId, method: &str, params: Option<Value>) -> JsonRpcRequest {
	JsonRpcRequest {
		jsonrpc: JSONRPC_VERSION.to_string(),
		id,
		method: method.to_string(),
		params,
	}
}

pub fn notification(method: &str, params: Option<Value>) -> JsonRpcNotification {
	JsonRpcNotification {
		jsonrpc: JSONRPC_VERSION.to_string(),
		method: method.to_string(),
		params,
	}
}

pub fn response(id: RequestId, result: Value) -> JsonRpcResponse {
	JsonRpcResponse {
		jsonrpc: JSONRPC_VERSION.to_string(),
		id,
		result,
	}
}

pub fn error_response(id: Option<RequestId>, code: i64, message: impl Into<String>) -> JsonRpcErrorResponse {
	JsonRpcErrorResponse {
		jsonrpc: JSONRPC_VERSION.to_string(),
		id,
		error: ErrorBody {
			code,
			message: message.into(),
			data: None,
		},
	}
}

/// The catalog surfaces the gateway aggregates.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CatalogSurface {
	Tools,
	Resources,
	ResourceTemplates,
	Prompts,
}

impl CatalogSurface {
	pub fn list_method(&self) -> &'static str {
		match self {
			CatalogSurface::Tools => METHOD_TOOLS_LIST,
			CatalogSurface::Resources => METHOD_RESOURCES_LIST,
			CatalogSurface::ResourceTemplates => METHOD_RESOURCES_TEMPLATES_LIST,
			CatalogSurface::Prompts => METHOD_PROMPTS_LIST,
		}
	}

	/// The field of the list result carrying the items.
	pub fn items_field(&self) -> &'static str {
		match self {
			CatalogSurface::Tools => "tools",
			CatalogSurface::Resources => "resources",
			CatalogSurface::ResourceTemplates => "resourceTemplates",
			CatalogSurface::Prompts => "prompts",
		}
	}

	/// The field that names an item on this surface. Resources are identified
	/// by URI; everything else by name.
	pub fn name_field(&self) -> &'static str {
		match self {
			CatalogSurface::Tools | CatalogSurface::Prompts => "name",
			CatalogSurface::Resources => "uri",
			CatalogSurface::ResourceTemplates => "uriTemplate",
		}
	}
}

/// Pull the named items out of a raw `*/list` result.
pub fn list_items(surface: CatalogSurface, result: &Value) -> Vec<(String, Value)> {
	let Some(items) = result.get(surface.items_field()).and_then(Value::as_array) else {
		return Vec::new();
	};
	items
		.iter()
		.filter_map(|item| {
			let name = item.get(surface.name_field())?.as_str()?.to_string();
			Some((name, item.clone()))
		})
		.collect()
}

/// Rewrite the surfaced name of a raw catalog item.
pub fn rename_item(surface: CatalogSurface, item: &mut Value, name: &str) {
	if let Some(obj) = item.as_object_mut() {
		obj.insert(
			surface.name_field().to_string(),
			Value::String(name.to_string()),
		);
	}
}

/// The `initialize` result the gateway answers with when it multiplexes.
pub fn gateway_initialize_result(protocol_version: &str) -> Value {
	serde_json::json!({
		"protocolVersion": protocol_version,
		"capabilities": {
			"tools": { "listChanged": true },
			"resources": { "listChanged": true },
			"prompts": { "listChanged": true },
		},
		"serverInfo": {
			"name": "mcpmux",
			"version": env!("CARGO_PKG_VERSION"),
		},
		"instructions": "This server is a gateway to a set of MCP servers. It routes requests to the owning server and aggregates the results.",
	})
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
