//! MCP client for communicating with MCP servers.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::connection::Connection;
use crate::dispatcher::{PendingResponse, ResponseDispatcher};
use crate::error::{McpError, Result};
use crate::handshake::{DEFAULT_HANDSHAKE_TIMEOUT, Handshake};
use crate::protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeResult, ListToolsParams, Message,
    MessageId, RequestMeta, ServerCapabilities, ServerInfo, ToolInfo, encode_params, methods,
};
use crate::tasks::{
    ListTasksParams, ListTasksResult, TaskEnvelope, TaskIdParams, TaskMetadata, TaskRequest,
    deadline_after,
};
use crate::tolerance::{ErrorDetector, SchemaValidator};
use crate::transport::{PipeConfig, PipeTransport, Transport};

/// Transport type for MCP server connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportType {
    /// Stdio transport - spawns a child process.
    #[default]
    Stdio,
    /// Unix domain socket transport.
    Unix,
}

/// Time bounds applied by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Bound on the initialize exchange.
    pub handshake: Duration,
    /// Bound on ordinary requests.
    pub request: Duration,
    /// A tool call fails after this long without a reply or progress update.
    pub tool_idle: Duration,
    /// A tool call fails after this long regardless of progress.
    pub tool_max: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            request: Duration::from_secs(30),
            tool_idle: Duration::from_secs(120),
            tool_max: Duration::from_secs(30 * 60),
        }
    }
}

/// Configuration for an MCP server connection.
#[derive(Debug, Clone, PartialEq)]
pub struct McpServerConfig {
    /// Unique name for this server.
    pub name: String,
    /// Transport type.
    pub transport: TransportType,
    /// Command to spawn (for stdio transport).
    pub command: String,
    /// Arguments to pass to the command.
    pub args: Vec<String>,
    /// Environment variables to set.
    pub env: Vec<(String, String)>,
    /// Socket to connect to (for unix transport).
    pub socket_path: Option<PathBuf>,
    /// Identity sent during the handshake.
    pub client_info: ClientInfo,
    pub timeouts: ClientTimeouts,
}

impl McpServerConfig {
    /// Create a new server config for stdio transport.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportType::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            socket_path: None,
            client_info: ClientInfo::default(),
            timeouts: ClientTimeouts::default(),
        }
    }

    /// Create a new server config for unix socket transport.
    pub fn unix(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            transport: TransportType::Unix,
            socket_path: Some(path.into()),
            ..Self::new(name, "")
        }
    }

    /// Add arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add environment variables.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Add an environment variable.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = info;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check if this is a stdio transport config.
    pub fn is_stdio(&self) -> bool {
        self.transport == TransportType::Stdio
    }

    /// Check if this is a unix socket transport config.
    pub fn is_unix(&self) -> bool {
        self.transport == TransportType::Unix
    }
}

#[derive(Debug, Clone)]
enum ClientState {
    Connected,
    Ready(Box<InitializeResult>),
    Failed(Arc<McpError>),
    Closed,
}

/// An MCP client connected to a single MCP server.
#[derive(Debug)]
pub struct McpClient {
    config: McpServerConfig,
    conn: Connection,
    state: RwLock<ClientState>,
    init_lock: tokio::sync::Mutex<()>,
    detector: ErrorDetector,
    validator: SchemaValidator,
    progress_seq: AtomicU64,
}

impl McpClient {
    /// Open the configured transport.
    ///
    /// This does NOT initialize the connection - call `initialize()` after connecting.
    pub async fn connect(config: McpServerConfig) -> Result<Self> {
        let dispatcher = ResponseDispatcher::new();
        let transport: Arc<dyn Transport> = match config.transport {
            TransportType::Stdio => {
                if config.command.is_empty() {
                    return Err(McpError::transport("stdio transport requires a command"));
                }
                let pipe = PipeConfig::new(&config.command)
                    .with_args(config.args.iter().cloned());
                let pipe = config
                    .env
                    .iter()
                    .fold(pipe, |p, (k, v)| p.with_env(k.clone(), v.clone()));
                Arc::new(PipeTransport::new(pipe, dispatcher.clone()))
            }
            TransportType::Unix => unix_transport(&config, &dispatcher)?,
        };

        transport.start().await?;
        tracing::info!(
            server = %config.name,
            transport = %transport.kind(),
            "Connected to MCP server"
        );
        Ok(Self::from_parts(config, transport, dispatcher))
    }

    /// Wrap an already started transport. `dispatcher` must be the one it feeds.
    pub fn from_parts(
        config: McpServerConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<ResponseDispatcher>,
    ) -> Self {
        Self {
            config,
            conn: Connection::new(transport, dispatcher),
            state: RwLock::new(ClientState::Connected),
            init_lock: tokio::sync::Mutex::new(()),
            detector: ErrorDetector::default(),
            validator: SchemaValidator::default(),
            progress_seq: AtomicU64::new(1),
        }
    }

    /// Replace the tool-result error detector.
    pub fn with_error_detector(mut self, detector: ErrorDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get the server info (after initialization).
    pub fn server_info(&self) -> Option<ServerInfo> {
        match &*self.state.read() {
            ClientState::Ready(result) => Some(result.server_info.clone()),
            _ => None,
        }
    }

    /// Get the server capabilities (after initialization).
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        match &*self.state.read() {
            ClientState::Ready(result) => Some(result.capabilities.clone()),
            _ => None,
        }
    }

    /// Check if the client has been initialized.
    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.read(), ClientState::Ready(_))
    }

    /// Check if the connection is still active.
    pub fn is_connected(&self) -> bool {
        !matches!(*self.state.read(), ClientState::Closed | ClientState::Failed(_))
            && self.conn.is_open()
    }

    /// Perform the MCP handshake.
    ///
    /// Must succeed before any other method is used. A failed handshake stops
    /// the transport and leaves the client permanently failed.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let _guard = self.init_lock.lock().await;
        match &*self.state.read() {
            ClientState::Ready(result) => return Ok((**result).clone()),
            ClientState::Failed(cause) => {
                return Err(McpError::HandshakeFailed {
                    source: cause.clone(),
                });
            }
            ClientState::Closed => return Err(McpError::ConnectionClosed),
            ClientState::Connected => {}
        }

        let handshake = Handshake::new()
            .with_client_info(self.config.client_info.clone())
            .with_timeout(self.config.timeouts.handshake);

        match handshake.perform(&self.conn).await {
            Ok(result) => {
                *self.state.write() = ClientState::Ready(Box::new(result.clone()));
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(server = %self.config.name, error = %e, "MCP handshake failed");
                let e = match e {
                    McpError::HandshakeFailed { .. } => e,
                    other => McpError::handshake_failed(other),
                };
                if let McpError::HandshakeFailed { source } = &e {
                    *self.state.write() = ClientState::Failed(source.clone());
                }
                if let Err(stop_err) = self.conn.close().await {
                    tracing::debug!(error = %stop_err, "Error stopping transport after failed handshake");
                }
                Err(e)
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match &*self.state.read() {
            ClientState::Ready(_) => Ok(()),
            ClientState::Connected => Err(McpError::NotInitialized),
            ClientState::Failed(cause) => Err(McpError::HandshakeFailed {
                source: cause.clone(),
            }),
            ClientState::Closed => Err(McpError::ConnectionClosed),
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_ready()?;
        self.conn
            .request(method, params, self.config.timeouts.request)
            .await
    }

    async fn request_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.request(method, Some(params)).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol(format!("unexpected {method} result: {e}")))
    }

    /// List the server's tools, optionally only those named in `names`.
    ///
    /// Entries that do not decode, or whose input schema is rejected, are
    /// skipped with a warning; the rest still load.
    pub async fn list_tools(&self, names: &[String]) -> Result<Vec<ToolInfo>> {
        let params = encode_params(&ListToolsParams {
            names: names.to_vec(),
        })?;
        let result = self.request(methods::TOOLS_LIST, Some(params)).await?;

        let entries = match result.get("tools") {
            Some(Value::Array(entries)) => entries.clone(),
            None | Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(McpError::protocol(format!(
                    "tools/list returned non-array tools: {other}"
                )));
            }
        };

        let mut tools = Vec::with_capacity(entries.len());
        for entry in entries {
            let tool: ToolInfo = match serde_json::from_value(entry) {
                Ok(tool) => tool,
                Err(e) => {
                    tracing::warn!(server = %self.config.name, error = %e, "Skipping malformed tool entry");
                    continue;
                }
            };
            if !self
                .validator
                .should_accept(&tool.name, tool.input_schema.as_ref())
            {
                continue;
            }
            tools.push(tool);
        }
        // Not every server honors the filter.
        if !names.is_empty() {
            tools.retain(|t| names.contains(&t.name));
        }

        tracing::debug!(
            server = %self.config.name,
            tool_count = tools.len(),
            "Listed MCP tools"
        );
        Ok(tools)
    }

    /// Call a tool and run the result through error detection.
    ///
    /// The wait is bounded by the idle timeout, which every matching
    /// `notifications/progress` resets, and by the overall maximum.
    /// Arguments are passed through without schema validation.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.ensure_ready()?;

        let token = format!("progress_{}", self.progress_seq.fetch_add(1, Ordering::SeqCst));
        let params = encode_params(&CallToolParams {
            name: name.to_string(),
            arguments: normalize_arguments(arguments),
            meta: Some(RequestMeta {
                progress_token: token.clone(),
            }),
            task: None,
        })?;

        let mut progress = self.conn.dispatcher().subscribe_notifications();
        let mut pending = self
            .conn
            .send_request(methods::TOOLS_CALL, Some(params))
            .await?;
        let reply = wait_with_progress(
            &mut pending,
            &mut progress,
            &token,
            self.config.timeouts.tool_idle,
            self.config.timeouts.tool_max,
        )
        .await
        .map_err(|e| match e {
            McpError::Timeout(what) => McpError::Timeout(format!("tool {name}: {what}")),
            other => other,
        })?;

        let result = self.detector.inspect(reply.into_result()?);
        if result.is_error() {
            tracing::warn!(
                server = %self.config.name,
                tool = %name,
                error = result.error_message.as_deref().unwrap_or_default(),
                "Tool call returned error"
            );
        } else {
            tracing::debug!(server = %self.config.name, tool = %name, "Tool call succeeded");
        }
        Ok(result)
    }

    /// Start a tool call as a server-side task and return its metadata.
    ///
    /// `ttl` of `None` leaves the lifetime to the server's default.
    pub async fn call_tool_as_task(
        &self,
        name: &str,
        arguments: Value,
        ttl: Option<Duration>,
    ) -> Result<TaskMetadata> {
        let params = encode_params(&CallToolParams {
            name: name.to_string(),
            arguments: normalize_arguments(arguments),
            meta: None,
            task: Some(TaskRequest::from_duration(ttl.unwrap_or_default())),
        })?;
        let value = self.request(methods::TOOLS_CALL, Some(params)).await?;
        let task = decode_task(value)?;
        tracing::info!(server = %self.config.name, tool = %name, task_id = %task.task_id, "Tool call running as task");
        Ok(task)
    }

    /// Fetch task metadata.
    pub async fn get_task(&self, task_id: &str) -> Result<TaskMetadata> {
        let params = encode_params(&TaskIdParams {
            task_id: task_id.to_string(),
        })?;
        let value = self.request(methods::TASKS_GET, Some(params)).await?;
        decode_task(value)
    }

    /// Block until the task finishes (or `timeout` passes) and return its result.
    pub async fn task_result(&self, task_id: &str, timeout: Duration) -> Result<CallToolResult> {
        self.ensure_ready()?;
        let params = encode_params(&TaskIdParams {
            task_id: task_id.to_string(),
        })?;
        let value = self
            .conn
            .request(methods::TASKS_RESULT, Some(params), timeout)
            .await?;
        Ok(self.detector.inspect(value))
    }

    /// One page of the server's tasks.
    pub async fn list_tasks(&self, cursor: Option<&str>) -> Result<ListTasksResult> {
        let params = encode_params(&ListTasksParams {
            cursor: cursor.map(str::to_string),
            limit: None,
        })?;
        self.request_as(methods::TASKS_LIST, params).await
    }

    /// Cancel a task on the server.
    pub async fn cancel_task(&self, task_id: &str) -> Result<TaskMetadata> {
        let params = encode_params(&TaskIdParams {
            task_id: task_id.to_string(),
        })?;
        let value = self.request(methods::TASKS_CANCEL, Some(params)).await?;
        decode_task(value)
    }

    /// Shutdown the connection gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, ClientState::Closed) {
                return Ok(());
            }
            *state = ClientState::Closed;
        }
        tracing::info!(server = %self.config.name, "Shutting down MCP client");
        self.conn.close().await
    }
}

#[cfg(unix)]
fn unix_transport(
    config: &McpServerConfig,
    dispatcher: &Arc<ResponseDispatcher>,
) -> Result<Arc<dyn Transport>> {
    let path = config
        .socket_path
        .clone()
        .ok_or_else(|| McpError::transport("unix transport requires a socket path"))?;
    Ok(Arc::new(crate::transport::UnixSocketTransport::new(
        path,
        dispatcher.clone(),
    )))
}

#[cfg(not(unix))]
fn unix_transport(
    _config: &McpServerConfig,
    _dispatcher: &Arc<ResponseDispatcher>,
) -> Result<Arc<dyn Transport>> {
    Err(McpError::transport("unix sockets are not supported on this platform"))
}

fn normalize_arguments(arguments: Value) -> Value {
    if arguments.is_null() { json!({}) } else { arguments }
}

/// Accept `{task: {...}}` or bare task metadata.
fn decode_task(value: Value) -> Result<TaskMetadata> {
    if let Ok(envelope) = serde_json::from_value::<TaskEnvelope>(value.clone()) {
        return Ok(envelope.task);
    }
    serde_json::from_value(value).map_err(|e| McpError::protocol(format!("invalid task metadata: {e}")))
}

fn is_progress_for(message: &Message, token: &str) -> bool {
    message.method.as_deref() == Some(methods::PROGRESS)
        && message
            .params
            .as_ref()
            .and_then(|p| p.get("progressToken"))
            .map(MessageId::from_value)
            .and_then(|id| id.key())
            .is_some_and(|key| key == token)
}

/// Wait for a reply, extending the idle deadline on each matching progress update.
async fn wait_with_progress(
    pending: &mut PendingResponse,
    progress: &mut broadcast::Receiver<Message>,
    token: &str,
    idle: Duration,
    max: Duration,
) -> Result<Message> {
    let hard_deadline = deadline_after(max);
    let mut idle_deadline = deadline_after(idle);
    let mut listening = true;

    loop {
        let deadline = idle_deadline.min(hard_deadline);
        tokio::select! {
            reply = pending.recv() => return reply,
            _ = tokio::time::sleep_until(deadline) => {
                let what = if deadline >= hard_deadline {
                    format!("reply within {}s", max.as_secs())
                } else {
                    format!("progress within {}s", idle.as_secs())
                };
                return Err(McpError::timeout(what));
            }
            update = progress.recv(), if listening => match update {
                Ok(message) if is_progress_for(&message, token) => {
                    tracing::trace!(token, params = ?message.params, "Tool progress");
                    idle_deadline = deadline_after(idle);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress listener lagged");
                    idle_deadline = deadline_after(idle);
                }
                Err(broadcast::error::RecvError::Closed) => listening = false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::ScriptedTransport;
    use crate::tasks::TaskStatus;

    fn init_result() -> Value {
        json!({
            "serverInfo": {"name": "scripted", "version": "0.1.0", "protocolVersion": "2024-11-05"},
            "capabilities": {"providesTools": true}
        })
    }

    /// A client over a scripted server answering `initialize` plus whatever `other` returns.
    fn client_with(
        other: impl Fn(&Message) -> Option<Value> + Send + Sync + 'static,
    ) -> (McpClient, Arc<ScriptedTransport>) {
        let dispatcher = ResponseDispatcher::new();
        let transport = ScriptedTransport::new(dispatcher.clone(), move |req| {
            if req.id.is_none() {
                return Vec::new();
            }
            let result = match req.method.as_deref() {
                Some(methods::INITIALIZE) => Some(init_result()),
                _ => other(req),
            };
            result
                .map(|r| vec![Message::response(req.id.clone(), r)])
                .unwrap_or_default()
        });
        let config = McpServerConfig::new("scripted", "unused");
        let client = McpClient::from_parts(config, transport.clone(), dispatcher);
        (client, transport)
    }

    #[test]
    fn test_server_config_builder() {
        let config = McpServerConfig::new("test", "mcp-server-test")
            .with_arg("--db")
            .with_arg("/path/to/db")
            .with_env_var("DEBUG", "1");

        assert_eq!(config.name, "test");
        assert_eq!(config.command, "mcp-server-test");
        assert_eq!(config.args, vec!["--db", "/path/to/db"]);
        assert_eq!(config.env, vec![("DEBUG".to_string(), "1".to_string())]);
        assert!(config.is_stdio());
        assert!(!config.is_unix());
        assert_eq!(config.timeouts, ClientTimeouts::default());
    }

    #[test]
    fn test_unix_server_config_builder() {
        let config = McpServerConfig::unix("local", "/tmp/mcp.sock");
        assert!(config.is_unix());
        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/mcp.sock")));
        assert!(config.command.is_empty());
    }

    #[tokio::test]
    async fn test_connect_nonexistent_server() {
        let config = McpServerConfig::new("test", "nonexistent-mcp-server-12345");
        let err = McpClient::connect(config).await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_connect_requires_endpoint() {
        let err = McpClient::connect(McpServerConfig::new("test", ""))
            .await
            .unwrap_err();
        assert!(err.is_transport());

        let mut config = McpServerConfig::unix("test", "/tmp/x.sock");
        config.socket_path = None;
        assert!(McpClient::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_calls_before_initialize_are_refused() {
        let (client, transport) = client_with(|_| Some(json!({})));
        assert!(matches!(client.list_tools(&[]).await, Err(McpError::NotInitialized)));
        assert!(matches!(
            client.call_tool("x", json!({})).await,
            Err(McpError::NotInitialized)
        ));
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (client, transport) = client_with(|_| None);
        let first = client.initialize().await.unwrap();
        let second = client.initialize().await.unwrap();
        assert_eq!(first, second);
        assert!(client.is_initialized());
        assert_eq!(client.server_info().unwrap().name, "scripted");
        assert!(client.capabilities().unwrap().has_tools());
        // initialize + initialized notification, once
        assert_eq!(transport.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_permanent() {
        let dispatcher = ResponseDispatcher::new();
        let transport = ScriptedTransport::new(dispatcher.clone(), |req| {
            vec![Message::error_response(req.id.clone(), -32603, "boom", None)]
        });
        let client = McpClient::from_parts(
            McpServerConfig::new("bad", "unused"),
            transport.clone(),
            dispatcher,
        );

        let err = client.initialize().await.unwrap_err();
        assert!(matches!(
            err.handshake_cause(),
            Some(McpError::ServerError { code: -32603, .. })
        ));
        assert!(!transport.is_running());
        assert!(!client.is_connected());

        // Later calls report the same cause.
        let err = client.list_tools(&[]).await.unwrap_err();
        assert!(matches!(err.handshake_cause(), Some(McpError::ServerError { .. })));
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err.handshake_cause(), Some(McpError::ServerError { .. })));
    }

    #[tokio::test]
    async fn test_list_tools_skips_bad_entries() {
        let (client, transport) = client_with(|req| {
            (req.method.as_deref() == Some(methods::TOOLS_LIST)).then(|| {
                json!({"tools": [
                    {"name": "good", "inputSchema": {"type": "object"}},
                    {"name": "quirky", "inputSchema": {"type": 42, "properties": "x"}},
                    {"name": "no_schema"},
                    {"description": "nameless"},
                ]})
            })
        });
        client.initialize().await.unwrap();

        let tools = client.list_tools(&[]).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["good", "quirky"]);

        let filtered = client.list_tools(&["quirky".to_string()]).await.unwrap();
        assert_eq!(filtered.len(), 1);
        let sent = transport.sent.lock();
        assert_eq!(sent.last().unwrap().params.as_ref().unwrap()["names"], json!(["quirky"]));
    }

    #[tokio::test]
    async fn test_call_tool_detects_errors() {
        let (client, transport) = client_with(|req| {
            let params = req.params.as_ref()?;
            match params["name"].as_str()? {
                "ok" => Some(json!({"content": [{"type": "text", "text": "fine"}]})),
                "bad" => Some(json!({"content": {"error": {"isError": true, "message": "bad arg"}}})),
                _ => None,
            }
        });
        client.initialize().await.unwrap();

        let ok = client.call_tool("ok", Value::Null).await.unwrap();
        assert!(!ok.is_error());
        assert_eq!(ok.text().as_deref(), Some("fine"));

        let bad = client.call_tool("bad", json!({"x": 1})).await.unwrap();
        assert!(bad.is_error());
        assert_eq!(bad.error_message.as_deref(), Some("bad arg"));

        let sent = transport.sent.lock();
        let call = sent
            .iter()
            .find(|m| m.method.as_deref() == Some(methods::TOOLS_CALL))
            .unwrap();
        let params = call.params.as_ref().unwrap();
        assert_eq!(params["arguments"], json!({}));
        assert!(params["_meta"]["progressToken"].as_str().unwrap().starts_with("progress_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_extends_idle_timeout() {
        let dispatcher = ResponseDispatcher::new();
        let mut pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        let mut progress = dispatcher.subscribe_notifications();

        let feeder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    tokio::time::sleep(Duration::from_secs(8)).await;
                    dispatcher.dispatch(Message::notification(
                        methods::PROGRESS,
                        Some(json!({"progressToken": "progress_1", "progress": 1})),
                    ));
                }
                tokio::time::sleep(Duration::from_secs(8)).await;
                dispatcher.dispatch(Message::response(1i64, json!({"content": "done"})));
            })
        };

        // 32s in total, but never more than 8s between signs of life.
        let reply = wait_with_progress(
            &mut pending,
            &mut progress,
            "progress_1",
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(reply.result, Some(json!({"content": "done"})));
        feeder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_progress_does_not_extend() {
        let dispatcher = ResponseDispatcher::new();
        let mut pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        let mut progress = dispatcher.subscribe_notifications();

        let feeder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    dispatcher.dispatch(Message::notification(
                        methods::PROGRESS,
                        Some(json!({"progressToken": "someone_else"})),
                    ));
                }
            })
        };

        let err = wait_with_progress(
            &mut pending,
            &mut progress,
            "progress_1",
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("progress within 10s"));
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_time_bounds_progress() {
        let dispatcher = ResponseDispatcher::new();
        let mut pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        let mut progress = dispatcher.subscribe_notifications();

        let feeder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    dispatcher.dispatch(Message::notification(
                        methods::PROGRESS,
                        Some(json!({"progressToken": "progress_1"})),
                    ));
                }
            })
        };

        let err = wait_with_progress(
            &mut pending,
            &mut progress,
            "progress_1",
            Duration::from_secs(5),
            Duration::from_secs(20),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("reply within 20s"));
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeouts_still_deliver() {
        let dispatcher = ResponseDispatcher::new();
        let mut pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        let mut progress = dispatcher.subscribe_notifications();

        let responder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                dispatcher.dispatch(Message::notification(
                    methods::PROGRESS,
                    Some(json!({"progressToken": "progress_1"})),
                ));
                tokio::time::sleep(Duration::from_millis(20)).await;
                dispatcher.dispatch(Message::response(1i64, json!({"content": "ok"})));
            })
        };

        let reply = wait_with_progress(
            &mut pending,
            &mut progress,
            "progress_1",
            Duration::MAX,
            Duration::from_secs(i64::MAX as u64),
        )
        .await
        .unwrap();
        assert_eq!(reply.result, Some(json!({"content": "ok"})));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_calls() {
        let (client, transport) = client_with(|req| {
            let meta = json!({
                "taskId": "t-1",
                "status": "working",
                "createdAt": "2025-01-01T00:00:00Z",
                "lastUpdatedAt": "2025-01-01T00:00:00Z",
                "ttl": 60000,
                "pollInterval": 1000
            });
            match req.method.as_deref()? {
                methods::TOOLS_CALL | methods::TASKS_GET => Some(json!({"task": meta})),
                methods::TASKS_CANCEL => {
                    let mut meta = meta;
                    meta["status"] = json!("canceled");
                    Some(json!({"task": meta}))
                }
                methods::TASKS_LIST => Some(json!({"tasks": [meta], "nextCursor": "1"})),
                methods::TASKS_RESULT => Some(json!({"isError": true, "error": "disk full"})),
                _ => None,
            }
        });
        client.initialize().await.unwrap();

        let task = client
            .call_tool_as_task("slow", json!({}), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(task.task_id, "t-1");
        {
            let sent = transport.sent.lock();
            let call = sent.last().unwrap();
            assert_eq!(call.params.as_ref().unwrap()["task"]["ttl"], 60000);
        }

        assert_eq!(client.get_task("t-1").await.unwrap().status, TaskStatus::Working);
        let page = client.list_tasks(None).await.unwrap();
        assert_eq!(page.tasks.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("1"));
        assert_eq!(
            client.cancel_task("t-1").await.unwrap().status,
            TaskStatus::Canceled
        );

        let result = client.task_result("t-1", Duration::from_secs(1)).await.unwrap();
        assert!(result.is_error());
        assert_eq!(result.error_message.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (client, transport) = client_with(|_| None);
        client.initialize().await.unwrap();
        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        assert!(!transport.is_running());
        assert!(!client.is_connected());
        assert!(matches!(client.list_tools(&[]).await, Err(McpError::ConnectionClosed)));
    }
}
