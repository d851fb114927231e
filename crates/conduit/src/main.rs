//! Conduit - command-line client for MCP servers.
//!
//! Main entry point for the conduit CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{call, check, servers, tools};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Conduit - talk to MCP servers over stdio or unix sockets
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Use this config file instead of discovering one
    #[arg(long, global = true, env = "CONDUIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List and manage configured MCP servers
    Servers(servers::ServersArgs),

    /// List the tools a server offers
    Tools(tools::ToolsArgs),

    /// Call a tool on a server
    Call(call::CallArgs),

    /// Check that a server completes the handshake
    Check(check::CheckArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable, stderr) + rotating JSON file
    let filter = if cli.verbose {
        "conduit=debug,conduit_mcp=debug,conduit_config=debug,info"
    } else {
        "conduit=info,conduit_mcp=info,warn"
    };
    let console_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let log_dir = conduit_config::log_dir().unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "conduit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "conduit=trace,conduit_mcp=trace,conduit_config=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context::load(cli.config, cli.json, cli.verbose)?;

    match cli.command {
        Commands::Servers(args) => servers::run(args, &ctx).await,
        Commands::Tools(args) => tools::run(args, &ctx).await,
        Commands::Call(args) => call::run(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
    }
}
