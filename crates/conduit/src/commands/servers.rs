//! MCP server management commands.
//!
//! - `conduit servers list` - List configured servers (optionally their tools)
//! - `conduit servers add` - Add a server to the config file
//! - `conduit servers remove` - Remove a server from the config file

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use serde_json::json;

use conduit_config::{ServerEntry, TransportKind, save_config};

use super::{Context, print_json, truncate};

/// MCP server management commands.
#[derive(Args, Debug)]
pub struct ServersArgs {
    #[command(subcommand)]
    pub command: Option<ServersCommand>,
}

#[derive(Subcommand, Debug)]
pub enum ServersCommand {
    /// List configured MCP servers (the default)
    List(ListArgs),

    /// Add a new MCP server configuration
    Add(AddArgs),

    /// Remove an MCP server configuration
    Remove(RemoveArgs),
}

/// Arguments for `conduit servers list`.
#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Connect to each enabled server and show its tools
    #[arg(long)]
    pub tools: bool,
}

/// Arguments for `conduit servers add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Unique name for this MCP server
    pub name: String,

    /// Command to spawn (stdio) or socket path (with --unix)
    pub target: String,

    /// Connect to a unix socket instead of spawning a command
    #[arg(long)]
    pub unix: bool,

    /// Arguments to pass to the command (stdio only)
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Environment variables in KEY=VALUE format
    #[arg(long = "env", short = 'e')]
    pub env_vars: Vec<String>,

    /// Add the server disabled
    #[arg(long)]
    pub disabled: bool,
}

/// Arguments for `conduit servers remove`.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Name of the MCP server to remove
    pub name: String,
}

/// Run the servers command.
pub async fn run(args: ServersArgs, ctx: &Context) -> Result<()> {
    match args.command.unwrap_or(ServersCommand::List(ListArgs::default())) {
        ServersCommand::List(list_args) => run_list(list_args, ctx).await,
        ServersCommand::Add(add_args) => run_add(add_args, ctx),
        ServersCommand::Remove(remove_args) => run_remove(remove_args, ctx),
    }
}

fn transport_name(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Stdio => "stdio",
        TransportKind::Unix => "unix",
    }
}

fn target(server: &ServerEntry) -> String {
    match server.transport {
        TransportKind::Unix => server
            .socket_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        TransportKind::Stdio => {
            let mut cmd = server.command.clone();
            if !server.args.is_empty() {
                cmd.push(' ');
                cmd.push_str(&server.args.join(" "));
            }
            cmd
        }
    }
}

/// Connect to a server and list its tool names.
async fn tool_names(ctx: &Context, name: &str) -> Result<Vec<String>> {
    let client = ctx.connect(name).await?;
    let tools = client.list_tools(&[]).await?;
    if let Err(e) = client.shutdown().await {
        tracing::debug!(server = %name, error = %e, "Shutdown after listing failed");
    }
    Ok(tools.into_iter().map(|t| t.name).collect())
}

/// Run `conduit servers list`.
async fn run_list(args: ListArgs, ctx: &Context) -> Result<()> {
    let servers = &ctx.config.servers;

    if servers.is_empty() {
        if ctx.json_output {
            println!("[]");
        } else {
            println!("No MCP servers configured.");
            println!();
            println!("Add a server with:");
            println!("  conduit servers add <name> <command> -- [args...]");
            println!("  conduit servers add <name> <socket-path> --unix");
        }
        return Ok(());
    }

    if ctx.json_output {
        let mut output = Vec::new();
        for server in servers {
            let mut entry = json!({
                "name": server.name,
                "enabled": server.enabled,
                "transport": transport_name(server.transport),
                "target": target(server),
            });
            if args.tools && server.enabled {
                match tool_names(ctx, &server.name).await {
                    Ok(tools) => {
                        entry["status"] = json!("connected");
                        entry["tools"] = json!(tools);
                    }
                    Err(e) => {
                        entry["status"] = json!("error");
                        entry["error"] = json!(format!("{e:#}"));
                    }
                }
            }
            output.push(entry);
        }
        return print_json(&json!(output));
    }

    println!(
        "{:<20} {:<10} {:<10} {:<40}",
        "NAME", "TRANSPORT", "STATUS", "TARGET"
    );
    println!("{}", "-".repeat(80));

    for server in servers {
        let status = if server.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<20} {:<10} {:<10} {:<40}",
            truncate(&server.name, 20),
            transport_name(server.transport),
            status,
            truncate(&target(server), 40)
        );

        if ctx.verbose && !server.env.is_empty() {
            println!("  Environment:");
            for [key, value] in &server.env {
                println!("    {key}={value}");
            }
        }

        if args.tools && server.enabled {
            match tool_names(ctx, &server.name).await {
                Ok(tools) if tools.is_empty() => println!("  Tools: (none)"),
                Ok(tools) => {
                    println!("  Tools ({}):", tools.len());
                    for tool in tools {
                        println!("    - {tool}");
                    }
                }
                Err(e) => println!("  Error: {e:#}"),
            }
        }
    }

    Ok(())
}

/// Parse `KEY=VALUE` pairs.
fn parse_env(vars: &[String]) -> Result<Vec<[String; 2]>> {
    vars.iter()
        .map(|var| {
            var.split_once('=')
                .map(|(k, v)| [k.to_string(), v.to_string()])
                .ok_or_else(|| {
                    anyhow!("Invalid environment variable format: '{var}'. Use KEY=VALUE.")
                })
        })
        .collect()
}

/// Run `conduit servers add`.
fn run_add(args: AddArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();

    if config.servers.iter().any(|s| s.name == args.name) {
        return Err(anyhow!(
            "MCP server '{}' already exists. Use 'conduit servers remove {}' first.",
            args.name,
            args.name
        ));
    }

    let entry = if args.unix {
        ServerEntry::unix(&args.name, PathBuf::from(&args.target))
    } else {
        ServerEntry::new(&args.name, &args.target).with_args(args.args.clone())
    };
    let entry = ServerEntry {
        env: parse_env(&args.env_vars)?,
        ..entry.with_enabled(!args.disabled)
    };
    entry.validate()?;

    config.servers.push(entry);
    save_config(&config, &ctx.config_path)?;
    tracing::info!(server = %args.name, path = %ctx.config_path.display(), "Server added");

    if ctx.json_output {
        print_json(&json!({
            "status": "added",
            "name": args.name,
            "config_path": ctx.config_path.display().to_string(),
        }))?;
    } else {
        println!("Added MCP server: {}", args.name);
        println!("Config saved to: {}", ctx.config_path.display());
        println!();
        println!("Check the connection with:");
        println!("  conduit check {}", args.name);
    }

    Ok(())
}

/// Run `conduit servers remove`.
fn run_remove(args: RemoveArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();

    let original_len = config.servers.len();
    config.servers.retain(|s| s.name != args.name);
    if config.servers.len() == original_len {
        return Err(anyhow!(
            "MCP server '{}' not found. Use 'conduit servers list' to see configured servers.",
            args.name
        ));
    }

    save_config(&config, &ctx.config_path)?;
    tracing::info!(server = %args.name, path = %ctx.config_path.display(), "Server removed");

    if ctx.json_output {
        print_json(&json!({
            "status": "removed",
            "name": args.name,
            "config_path": ctx.config_path.display().to_string(),
        }))?;
    } else {
        println!("Removed MCP server: {}", args.name);
        println!("Config saved to: {}", ctx.config_path.display());
    }

    Ok(())
}
