//! JSON-RPC 2.0 message codec and MCP payload types.
//!
//! Every frame on the wire is one JSON document followed by `\n`. A decoded
//! [`Message`] is classified purely by which optional fields are present; there
//! is no discriminator field.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{McpError, Result};
use crate::tasks::TaskRequest;

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version sent during the handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Method and notification names used by the client.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Sent once the handshake reply has been accepted.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Server-sent progress updates for long tool calls.
    pub const PROGRESS: &str = "notifications/progress";
    /// Tool discovery.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Task metadata lookup.
    pub const TASKS_GET: &str = "tasks/get";
    /// Blocking task result.
    pub const TASKS_RESULT: &str = "tasks/result";
    /// Task enumeration.
    pub const TASKS_LIST: &str = "tasks/list";
    /// Task cancellation.
    pub const TASKS_CANCEL: &str = "tasks/cancel";
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Identifier
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC message identifier.
///
/// Peers may send ids as strings or numbers, and some re-encode a numeric id
/// as a string in their reply. Equality and hashing use the canonical string
/// rendering, so `7` and `"7"` are the same id.
#[derive(Debug, Clone, Default)]
pub enum MessageId {
    /// No id (notifications, or an id that could not be decoded).
    #[default]
    None,
    /// String id.
    String(String),
    /// Integer id.
    Number(i64),
}

impl MessageId {
    /// Canonical key used for correlation, or `None` when the id is absent.
    pub fn key(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::String(s) => Some(s.clone()),
            Self::Number(n) => Some(n.to_string()),
        }
    }

    /// Whether the id is absent.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Decode an id from a raw JSON value.
    ///
    /// Anything that is not a string or an integral number decodes as
    /// [`MessageId::None`] instead of failing the surrounding message.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::String(s.clone()),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Number(i)
                } else if let Some(u) = n.as_u64() {
                    // Larger than i64::MAX; keep the digits so it still correlates.
                    Self::String(u.to_string())
                } else {
                    match n.as_f64() {
                        Some(f)
                            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 =>
                        {
                            Self::Number(f as i64)
                        }
                        _ => Self::None,
                    }
                }
            }
            _ => Self::None,
        }
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MessageId {}

impl Hash for MessageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("null"),
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<u64> for MessageId {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(i) => Self::Number(i),
            Err(_) => Self::String(n.to_string()),
        }
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_none(),
            Self::String(s) => serializer.serialize_str(s),
            Self::Number(n) => serializer.serialize_i64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON-RPC Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional additional data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes
impl JsonRpcError {
    /// Parse error - Invalid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Invalid Request - Not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Create an error object without data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        McpError::server_error(err.code, err.message, err.data)
    }
}

/// What a decoded message is, derived from the fields it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has a method and an id; expects a reply.
    Request,
    /// Has a method and no id; never replied to.
    Notification,
    /// Has no method and carries a result (or just an id).
    Response,
    /// Has no method and carries an error object.
    Error,
    /// Neither a method, a result, an error nor an id.
    Invalid,
}

/// A JSON-RPC 2.0 message of any kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Correlation id.
    pub id: MessageId,
    /// Method name (requests and notifications).
    pub method: Option<String>,
    /// Method parameters.
    pub params: Option<Value>,
    /// Result payload (responses).
    pub result: Option<Value>,
    /// Error payload (error responses).
    pub error: Option<JsonRpcError>,
}

impl Message {
    /// Build a request.
    pub fn request(
        id: impl Into<MessageId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            method: Some(method.into()),
            params,
            ..Default::default()
        }
    }

    /// Build a request from any serializable params.
    pub fn request_with<P: Serialize + ?Sized>(
        id: impl Into<MessageId>,
        method: impl Into<String>,
        params: &P,
    ) -> Result<Self> {
        Ok(Self::request(id, method, Some(encode_params(params)?)))
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Default::default()
        }
    }

    /// Build a successful response.
    pub fn response(id: impl Into<MessageId>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            ..Default::default()
        }
    }

    /// Build an error response.
    pub fn error_response(
        id: impl Into<MessageId>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
            ..Default::default()
        }
    }

    /// Build an error response from an existing error object.
    pub fn from_error(id: impl Into<MessageId>, error: JsonRpcError) -> Self {
        Self {
            id: id.into(),
            error: Some(error),
            ..Default::default()
        }
    }

    /// Classify the message by field presence.
    pub fn kind(&self) -> MessageKind {
        match (&self.method, self.id.is_none()) {
            (Some(_), false) => MessageKind::Request,
            (Some(_), true) => MessageKind::Notification,
            (None, _) if self.error.is_some() => MessageKind::Error,
            (None, _) if self.result.is_some() => MessageKind::Response,
            (None, false) => MessageKind::Response,
            (None, true) => MessageKind::Invalid,
        }
    }

    /// Whether this message is a reply (response or error response).
    pub fn is_reply(&self) -> bool {
        matches!(self.kind(), MessageKind::Response | MessageKind::Error)
    }

    /// Consume a reply, returning its result or the server error it carries.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Encode as one wire frame (JSON followed by a newline).
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self).map_err(McpError::encoding)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode one frame. Surrounding whitespace, including the newline, is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| McpError::protocol(format!("invalid JSON frame: {e}")))?;
        Self::from_value(value)
    }

    /// Decode from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(McpError::protocol("frame is not a JSON object"));
        };

        let id = map
            .remove("id")
            .map(|v| MessageId::from_value(&v))
            .unwrap_or_default();
        let method = match map.remove("method") {
            Some(Value::String(m)) => Some(m),
            _ => None,
        };
        let params = map.remove("params").filter(|v| !v.is_null());
        let result = map.remove("result");
        let error = map
            .remove("error")
            .filter(|v| !v.is_null())
            .map(decode_error_object);

        Ok(Self {
            id,
            method,
            params,
            result,
            error,
        })
    }
}

/// Read an error object, keeping malformed ones instead of failing the frame.
fn decode_error_object(value: Value) -> JsonRpcError {
    match serde_json::from_value::<JsonRpcError>(value.clone()) {
        Ok(err) => err,
        Err(_) => {
            let message = match &value {
                Value::String(s) => s.clone(),
                Value::Object(obj) => obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string()),
                other => other.to_string(),
            };
            JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, message).with_data(value)
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        // Replies always carry an id, even when it is unknown (null).
        if !self.id.is_none() || self.method.is_none() {
            map.serialize_entry("id", &self.id)?;
        }
        if let Some(method) = &self.method {
            map.serialize_entry("method", method)?;
        }
        if let Some(params) = &self.params {
            map.serialize_entry("params", params)?;
        }
        if let Some(error) = &self.error {
            map.serialize_entry("error", error)?;
        } else if self.method.is_none() {
            map.serialize_entry("result", self.result.as_ref().unwrap_or(&Value::Null))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Serialize a payload to a JSON value, reporting failures as encoding errors.
pub fn encode_params<P: Serialize + ?Sized>(params: &P) -> Result<Value> {
    serde_json::to_value(params).map_err(McpError::encoding)
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP Handshake Types
// ─────────────────────────────────────────────────────────────────────────────

/// Client identity sent during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Capability flags advertised by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientCapabilities {
    /// Client accepts configuration changes at runtime.
    pub supports_configuration_change: bool,
    /// Client understands progress notifications.
    pub supports_progress_reporting: bool,
    /// Client can cancel in-flight work.
    pub supports_cancellation: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            supports_configuration_change: true,
            supports_progress_reporting: true,
            supports_cancellation: true,
        }
    }
}

/// Parameters for the initialize request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version.
    pub protocol_version: String,
    /// Client info.
    pub client_info: ClientInfo,
    /// Client capabilities.
    pub capabilities: ClientCapabilities,
    /// Optional server configuration payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_config: Option<Value>,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            client_info: ClientInfo::default(),
            capabilities: ClientCapabilities::default(),
            server_config: None,
        }
    }
}

/// Server identity returned during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    #[serde(default)]
    pub version: String,
    /// Server description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Protocol version the server implements.
    #[serde(default)]
    pub protocol_version: String,
}

/// Capability flags returned by the server.
///
/// Servers report these either as flat booleans or as the standard MCP
/// `tools` / `prompts` / `resources` objects; both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerCapabilities {
    #[serde(deserialize_with = "lenient_bool")]
    pub supports_configuration_change: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub supports_progress_reporting: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub supports_cancellation: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub provides_tools: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub provides_prompts: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub provides_resources: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
}

impl ServerCapabilities {
    /// Whether the server offers tools.
    pub fn has_tools(&self) -> bool {
        self.provides_tools || self.tools.is_some()
    }

    /// Whether the server offers prompts.
    pub fn has_prompts(&self) -> bool {
        self.provides_prompts || self.prompts.is_some()
    }

    /// Whether the server offers resources.
    pub fn has_resources(&self) -> bool {
        self.provides_resources || self.resources.is_some()
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// Result of the initialize request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Server info.
    pub server_info: ServerInfo,
    /// Server capabilities.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Top-level protocol version, as sent by servers using the standard layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

impl InitializeResult {
    /// The negotiated protocol version, from whichever field the server filled in.
    pub fn protocol_version(&self) -> &str {
        if !self.server_info.protocol_version.is_empty() {
            &self.server_info.protocol_version
        } else {
            self.protocol_version.as_deref().unwrap_or_default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP Tool Types
// ─────────────────────────────────────────────────────────────────────────────

/// A tool definition from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name (unique identifier).
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    #[serde(default)]
    pub input_schema: Option<Value>,
    /// JSON Schema describing the tool's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Parameters for the tools/list request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListToolsParams {
    /// Only return tools with these names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

/// Request metadata attached to a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Token the server echoes in `notifications/progress`.
    pub progress_token: String,
}

/// Parameters for the tools/call request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments (a JSON object).
    pub arguments: Value,
    /// Progress metadata.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
    /// Run the call as a task with this TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRequest>,
}

/// A tool-call result after error detection.
#[derive(Debug, Clone, PartialEq)]
pub struct CallToolResult {
    /// The `content` payload: a string, an object, or an array of items.
    pub content: Value,
    /// Whether any known error shape was found.
    pub is_error: bool,
    /// Extracted error message, when flagged.
    pub error_message: Option<String>,
    /// The result exactly as the server sent it.
    pub raw: Value,
}

impl CallToolResult {
    /// First text found in the content.
    pub fn text(&self) -> Option<String> {
        crate::tolerance::extract_text(&self.content)
    }

    /// Check if the tool call resulted in an error.
    pub fn is_error(&self) -> bool {
        self.is_error
    }
}
