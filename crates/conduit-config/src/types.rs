//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [[servers]]              # one entry per MCP server
//! name = "sqlite"
//! command = "mcp-server-sqlite"
//! args = ["--db", "/path/to/db.sqlite"]
//! env = [["DEBUG", "1"]]
//!
//! [[servers]]
//! name = "local"
//! transport = "unix"
//! socket_path = "/run/mcp/local.sock"
//!
//! [timeouts]               # client-side bounds
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    /// Configured MCP servers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerEntry>,

    /// Client timeouts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutSettings>,

    /// Top-level keys this version does not understand. Reported by [`lint`](Self::lint).
    #[serde(flatten, skip_serializing)]
    unknown: BTreeMap<String, toml::Value>,
}

impl ConduitConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Servers are matched by name: a later entry replaces an earlier one
    /// with the same name, new names are appended.
    pub fn merge(&mut self, other: ConduitConfig) {
        for server in other.servers {
            match self.servers.iter_mut().find(|s| s.name == server.name) {
                Some(existing) => *existing = server,
                None => self.servers.push(server),
            }
        }

        if other.timeouts.is_some() {
            self.timeouts = other.timeouts;
        }

        self.unknown.extend(other.unknown);
    }

    /// Add a server entry.
    pub fn with_server(mut self, server: ServerEntry) -> Self {
        self.servers.push(server);
        self
    }

    /// Effective timeouts (defaults when the section is absent).
    pub fn timeouts(&self) -> TimeoutSettings {
        self.timeouts.clone().unwrap_or_default()
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> Result<&ServerEntry> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::ServerNotFound(name.to_string()))
    }

    /// Look up a server that must be enabled and complete.
    pub fn enabled_server(&self, name: &str) -> Result<&ServerEntry> {
        let server = self.server(name)?;
        if !server.enabled {
            return Err(ConfigError::ServerDisabled(name.to_string()));
        }
        server.validate()?;
        Ok(server)
    }

    /// Enabled servers, in file order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerEntry> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Problems worth reporting that do not stop loading.
    pub fn lint(&self) -> Vec<String> {
        let mut warnings: Vec<String> = self
            .unknown
            .keys()
            .map(|key| format!("unknown config section '{key}' is ignored"))
            .collect();
        for (i, server) in self.servers.iter().enumerate() {
            if self.servers[..i].iter().any(|s| s.name == server.name) {
                warnings.push(format!("duplicate server name '{}'", server.name));
            }
            if let Err(e) = server.validate() {
                warnings.push(e.to_string());
            }
        }
        warnings
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Transport type for MCP server connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Stdio transport - spawns a child process.
    #[default]
    Stdio,
    /// Unix domain socket transport - connects to a running server.
    Unix,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    /// Unique name for this server.
    pub name: String,
    /// Transport type (stdio or unix). Defaults to stdio.
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to execute to start the server (for stdio transport).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// Arguments to pass to the command (for stdio transport).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables to set (as [key, value] pairs, for stdio transport).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<[String; 2]>,
    /// Socket to connect to (for unix transport).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Whether this server is enabled. Defaults to true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerEntry {
    /// Create a new server entry for stdio transport.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            socket_path: None,
            enabled: true,
        }
    }

    /// Create a new server entry for unix socket transport.
    pub fn unix(name: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            transport: TransportKind::Unix,
            socket_path: Some(socket_path.into()),
            ..Self::new(name, "")
        }
    }

    /// Add an argument (for stdio transport).
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add arguments (for stdio transport).
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an environment variable (for stdio transport).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push([key.into(), value.into()]);
        self
    }

    /// Set enabled state.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check if this is a stdio transport.
    pub fn is_stdio(&self) -> bool {
        matches!(self.transport, TransportKind::Stdio)
    }

    /// Check if this is a unix socket transport.
    pub fn is_unix(&self) -> bool {
        matches!(self.transport, TransportKind::Unix)
    }

    /// Convert environment variables to `(key, value)` tuples.
    pub fn env_tuples(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|[k, v]| (k.clone(), v.clone()))
            .collect()
    }

    /// Check that the fields the transport needs are present.
    pub fn validate(&self) -> Result<()> {
        let context = format!("server '{}'", self.name);
        if self.name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "name".into(),
                context: "[[servers]]".into(),
            });
        }
        match self.transport {
            TransportKind::Stdio if self.command.is_empty() => Err(ConfigError::MissingField {
                field: "command".into(),
                context,
            }),
            TransportKind::Unix if self.socket_path.is_none() => Err(ConfigError::MissingField {
                field: "socket_path".into(),
                context,
            }),
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts
// ─────────────────────────────────────────────────────────────────────────────

/// Client-side time bounds.
///
/// ```toml
/// [timeouts]
/// handshake_secs = 10
/// request_secs = 30
/// tool_idle_secs = 120   # reset by every progress notification
/// tool_max_secs = 1800
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub handshake_secs: u64,
    pub request_secs: u64,
    pub tool_idle_secs: u64,
    pub tool_max_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            handshake_secs: 10,
            request_secs: 30,
            tool_idle_secs: 120,
            tool_max_secs: 1800,
        }
    }
}

impl TimeoutSettings {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn tool_idle(&self) -> Duration {
        Duration::from_secs(self.tool_idle_secs)
    }

    pub fn tool_max(&self) -> Duration {
        Duration::from_secs(self.tool_max_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
