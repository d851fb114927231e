//! MCP (Model Context Protocol) client runtime.
//!
//! This crate connects to MCP servers over newline-delimited JSON-RPC 2.0,
//! either through a spawned child process or a Unix domain socket, and
//! tracks long-running tool calls as tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpManager / McpClient                                     │
//! │  - initialize, tools/list, tools/call, tasks/*              │
//! │  - error/schema tolerance on what servers send back         │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Connection + ResponseDispatcher                            │
//! │  - id allocation, one-shot reply routing, timeouts          │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Transport (PipeTransport | UnixSocketTransport)            │
//! │  - one writer gate, one reader task, 20 MiB frame bound     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`tasks`] module is independent of the wire: a [`TaskManager`] owns
//! task state and a [`TaskService`] answers `tasks/*` requests from it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use conduit_mcp::{McpClient, McpServerConfig};
//!
//! let config = McpServerConfig::new("sqlite", "mcp-server-sqlite")
//!     .with_arg("--db")
//!     .with_arg("/path/to/database.db");
//!
//! let client = McpClient::connect(config).await?;
//! let init = client.initialize().await?;
//! println!("Connected to: {} v{}", init.server_info.name, init.server_info.version);
//!
//! for tool in client.list_tools(&[]).await? {
//!     println!("Tool: {} - {:?}", tool.name, tool.description);
//! }
//!
//! let result = client.call_tool("query", json!({"sql": "SELECT * FROM users"})).await?;
//! println!("Result: {:?}", result.text());
//! ```
//!
//! # Protocol flow
//!
//! 1. Client sends `initialize` with its info and capabilities
//! 2. Server responds with its info and capabilities
//! 3. Client sends `notifications/initialized`
//! 4. Client can now call `tools/list`, `tools/call` and the task methods

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod protocol;
pub mod tasks;
pub mod tolerance;
pub mod transport;

pub use client::{ClientTimeouts, McpClient, McpServerConfig, TransportType};
pub use connection::Connection;
pub use dispatcher::{PendingResponse, ResponseDispatcher};
pub use error::{McpError, Result};
pub use handshake::Handshake;
pub use manager::McpManager;
pub use protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, JsonRpcError, MCP_PROTOCOL_VERSION, Message, MessageId, MessageKind,
    ServerCapabilities, ServerInfo, ToolInfo,
};
pub use tasks::{
    TaskHandle, TaskManager, TaskManagerConfig, TaskMetadata, TaskService, TaskStatus,
};
pub use tolerance::{ErrorDetector, SchemaValidator, SchemaVerdict, extract_text};
#[cfg(unix)]
pub use transport::UnixSocketTransport;
pub use transport::{MAX_FRAME_BYTES, PipeConfig, PipeTransport, Transport, TransportKind};
