//! CLI command handlers.

pub mod call;
pub mod check;
pub mod servers;
pub mod tools;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use conduit_config::{ConduitConfig, ServerEntry, TransportKind};
use conduit_mcp::{ClientTimeouts, McpClient, McpServerConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: ConduitConfig,
    /// Where `servers add` / `servers remove` write back to.
    pub config_path: PathBuf,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Load the explicit config file, or discover and merge the usual layers.
    pub fn load(explicit: Option<PathBuf>, json_output: bool, verbose: bool) -> Result<Self> {
        let (config, config_path) = match explicit {
            Some(path) if path.exists() => {
                let config = conduit_config::load_config_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?;
                for warning in config.lint() {
                    tracing::warn!("{warning}");
                }
                (config, path)
            }
            Some(path) => (ConduitConfig::default(), path),
            None => {
                let loaded = conduit_config::load_config(None)?;
                for warning in &loaded.warnings {
                    tracing::warn!("{warning}");
                }
                let path = loaded
                    .loaded_from()
                    .last()
                    .map(|p| p.to_path_buf())
                    .or_else(conduit_config::xdg_config_path)
                    .unwrap_or_else(|| PathBuf::from("conduit.toml"));
                (loaded.config, path)
            }
        };

        tracing::debug!(
            path = %config_path.display(),
            servers = config.servers.len(),
            "Configuration loaded"
        );
        Ok(Self {
            config,
            config_path,
            json_output,
            verbose,
        })
    }

    /// Client settings for a configured server.
    pub fn client_config(&self, entry: &ServerEntry) -> McpServerConfig {
        let timeouts = self.config.timeouts();
        let base = match entry.transport {
            TransportKind::Stdio => McpServerConfig::new(&entry.name, &entry.command)
                .with_args(entry.args.clone())
                .with_env(entry.env_tuples()),
            TransportKind::Unix => McpServerConfig::unix(
                &entry.name,
                entry.socket_path.clone().unwrap_or_default(),
            ),
        };
        base.with_timeouts(ClientTimeouts {
            handshake: timeouts.handshake(),
            request: timeouts.request(),
            tool_idle: timeouts.tool_idle(),
            tool_max: timeouts.tool_max(),
        })
    }

    /// Connect to a named server and complete the handshake.
    pub async fn connect(&self, name: &str) -> Result<McpClient> {
        let entry = self.config.enabled_server(name)?;
        let client = McpClient::connect(self.client_config(entry))
            .await
            .with_context(|| format!("connecting to '{name}'"))?;
        client
            .initialize()
            .await
            .with_context(|| format!("initializing '{name}'"))?;
        Ok(client)
    }
}

/// Print a JSON value for scripting.
pub fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Simple text wrapping helper.
pub fn textwrap_simple(text: &str, max_width: usize) -> String {
    let mut result = String::new();
    let mut current_line = String::new();

    for word in text.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_width {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push('\n');
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        result.push_str(&current_line);
    }

    result
}

/// Truncate a string to at most `max_len` characters.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
