//! MCP Manager for multi-server lifecycle management.
//!
//! The [`McpManager`] provides centralized management of multiple MCP server
//! connections, including initialization, tool discovery, tool routing and
//! graceful shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_mcp::{McpManager, McpServerConfig};
//!
//! let mut manager = McpManager::new();
//! manager.add_server(McpServerConfig::new("sqlite", "mcp-server-sqlite")
//!     .with_arg("--db")
//!     .with_arg("/path/to/db.sqlite"));
//!
//! manager.connect_all().await?;
//! let result = manager.call_tool("query", json!({"sql": "SELECT 1"})).await?;
//! manager.shutdown_all().await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::client::{McpClient, McpServerConfig};
use crate::error::{McpError, Result};
use crate::protocol::{CallToolResult, ToolInfo};

/// Manager for multiple MCP server connections.
#[derive(Default)]
pub struct McpManager {
    /// Server configurations (before connection).
    configs: HashMap<String, McpServerConfig>,
    /// Connected and initialized clients.
    clients: HashMap<String, Arc<McpClient>>,
}

impl McpManager {
    /// Create a new empty MCP manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with the given server configurations.
    pub fn with_configs(configs: Vec<McpServerConfig>) -> Self {
        let mut manager = Self::new();
        for config in configs {
            manager.add_server(config);
        }
        manager
    }

    /// Add a server configuration, replacing any with the same name.
    ///
    /// The server is not connected until [`connect_all`](Self::connect_all)
    /// or [`connect_server_by_name`](Self::connect_server_by_name).
    pub fn add_server(&mut self, config: McpServerConfig) {
        let name = config.name.clone();
        tracing::debug!(server = %name, "Adding MCP server configuration");
        self.configs.insert(name, config);
    }

    /// Register an already initialized client under its own name.
    pub fn add_client(&mut self, client: McpClient) {
        let name = client.name().to_string();
        self.configs
            .entry(name.clone())
            .or_insert_with(|| client.config().clone());
        self.clients.insert(name, Arc::new(client));
    }

    /// Remove a server by name, shutting it down if connected.
    ///
    /// Returns true if the server was configured.
    pub async fn remove_server(&mut self, name: &str) -> bool {
        self.shutdown_server(name).await;
        if self.configs.remove(name).is_some() {
            tracing::debug!(server = %name, "Removed MCP server configuration");
            true
        } else {
            false
        }
    }

    /// Names of all configured servers, sorted.
    pub fn server_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.configs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Names of all connected servers, sorted.
    pub fn connected_server_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.clients.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    /// Get a connected client by name.
    pub fn get_client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.get(name).cloned()
    }

    /// Connect and initialize every configured server not yet connected.
    ///
    /// Servers that fail are logged and skipped. Returns how many connected.
    pub async fn connect_all(&mut self) -> Result<usize> {
        let pending: Vec<McpServerConfig> = self
            .configs
            .values()
            .filter(|c| !self.clients.contains_key(&c.name))
            .cloned()
            .collect();

        let mut connected = 0;
        for config in pending {
            let name = config.name.clone();
            match connect_server(config).await {
                Ok(client) => {
                    self.clients.insert(name.clone(), Arc::new(client));
                    connected += 1;
                    tracing::info!(server = %name, "MCP server connected");
                }
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Failed to connect to MCP server");
                }
            }
        }

        tracing::info!(
            connected,
            total = self.configs.len(),
            "MCP server connection complete"
        );
        Ok(connected)
    }

    /// Connect a single server by name. Already connected servers are left alone.
    pub async fn connect_server_by_name(&mut self, name: &str) -> Result<()> {
        if self.clients.contains_key(name) {
            return Ok(());
        }

        let config = self
            .configs
            .get(name)
            .ok_or_else(|| McpError::protocol(format!("server '{name}' not configured")))?
            .clone();

        let client = connect_server(config).await?;
        self.clients.insert(name.to_string(), Arc::new(client));
        tracing::info!(server = %name, "MCP server connected");
        Ok(())
    }

    /// Tools of every connected server, keyed by server name.
    ///
    /// A server that fails to list is logged and left out.
    pub async fn list_all_tools(&self) -> BTreeMap<String, Vec<ToolInfo>> {
        let mut all_tools = BTreeMap::new();
        for (name, client) in &self.clients {
            match client.list_tools(&[]).await {
                Ok(tools) => {
                    all_tools.insert(name.clone(), tools);
                }
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Failed to list tools");
                }
            }
        }
        all_tools
    }

    /// `(server, tool)` pairs across all connected servers.
    pub async fn all_tools_flat(&self) -> Vec<(String, ToolInfo)> {
        self.list_all_tools()
            .await
            .into_iter()
            .flat_map(|(server, tools)| tools.into_iter().map(move |t| (server.clone(), t)))
            .collect()
    }

    /// Total number of tools across all servers.
    pub async fn tool_count(&self) -> usize {
        self.list_all_tools().await.values().map(Vec::len).sum()
    }

    /// Find which server offers `tool`. Servers are searched in name order.
    pub async fn find_tool(&self, tool: &str) -> Option<(String, ToolInfo)> {
        let wanted = [tool.to_string()];
        for name in self.connected_server_names() {
            let Some(client) = self.clients.get(name) else {
                continue;
            };
            match client.list_tools(&wanted).await {
                Ok(mut tools) if !tools.is_empty() => {
                    return Some((name.to_string(), tools.swap_remove(0)));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(server = %name, error = %e, "Skipping server in tool lookup"),
            }
        }
        None
    }

    /// Call a tool on whichever server offers it.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<CallToolResult> {
        let (server, _) = self
            .find_tool(tool)
            .await
            .ok_or_else(|| McpError::protocol(format!("no connected server offers tool '{tool}'")))?;
        self.call_tool_on(&server, tool, arguments).await
    }

    /// Call a tool on a named server.
    pub async fn call_tool_on(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult> {
        let client = self
            .get_client(server)
            .ok_or_else(|| McpError::protocol(format!("server '{server}' not connected")))?;
        client.call_tool(tool, arguments).await
    }

    /// Get all connected clients.
    pub fn clients(&self) -> impl Iterator<Item = (&String, &Arc<McpClient>)> {
        self.clients.iter()
    }

    /// Shut down every connected server. Configurations are kept.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        tracing::info!(
            server_count = self.clients.len(),
            "Shutting down all MCP servers"
        );
        let mut first_error = None;
        for (name, client) in self.clients.drain() {
            if let Err(e) = client.shutdown().await {
                tracing::warn!(server = %name, error = %e, "Error shutting down MCP server");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Shut down one server. Returns true if it was connected.
    pub async fn shutdown_server(&mut self, name: &str) -> bool {
        let Some(client) = self.clients.remove(name) else {
            return false;
        };
        tracing::info!(server = %name, "Shutting down MCP server");
        if let Err(e) = client.shutdown().await {
            tracing::warn!(server = %name, error = %e, "Error shutting down MCP server");
        }
        true
    }

    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_connections(&self) -> bool {
        !self.clients.is_empty()
    }
}

async fn connect_server(config: McpServerConfig) -> Result<McpClient> {
    let client = McpClient::connect(config).await?;
    client.initialize().await?;
    Ok(client)
}

impl Drop for McpManager {
    fn drop(&mut self) {
        // Transports cancel their tasks and kill children on drop.
        if !self.clients.is_empty() {
            tracing::debug!(
                count = self.clients.len(),
                "Dropping McpManager, disconnecting servers"
            );
        }
    }
}

impl std::fmt::Debug for McpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpManager")
            .field("configured", &self.server_names())
            .field("connected", &self.connected_server_names())
            .finish()
    }
}
