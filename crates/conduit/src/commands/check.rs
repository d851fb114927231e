//! `conduit check <server>` - handshake and capability report.

use anyhow::Result;
use clap::Args;
use conduit_mcp::McpClient;
use serde_json::json;

use super::{Context, print_json};

/// Arguments for `conduit check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Name of the configured server
    pub server: String,
}

/// Print a failure for `phase` and hand the error back.
fn failed(ctx: &Context, phase: &str, e: anyhow::Error) -> Result<()> {
    if ctx.json_output {
        print_json(&json!({
            "status": "error",
            "phase": phase,
            "error": format!("{e:#}"),
        }))?;
    } else {
        println!("❌ {phase} failed: {e:#}");
    }
    Err(e)
}

pub async fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let entry = ctx.config.enabled_server(&args.server)?;
    let config = ctx.client_config(entry);

    if !ctx.json_output {
        println!("Checking MCP server: {}", args.server);
        if entry.is_unix() {
            println!(
                "  Socket: {}",
                entry
                    .socket_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        } else {
            println!("  Command: {}", entry.command);
        }
        println!();
    }

    let client = match McpClient::connect(config).await {
        Ok(client) => client,
        Err(e) => return failed(ctx, "connect", e.into()),
    };
    if !ctx.json_output {
        println!("✓ Connected");
    }

    let init = match client.initialize().await {
        Ok(init) => init,
        Err(e) => return failed(ctx, "initialize", e.into()),
    };

    let tools = client.list_tools(&[]).await;
    if let Err(e) = client.shutdown().await {
        tracing::debug!(server = %args.server, error = %e, "Shutdown failed");
    }
    let tool_count = match tools {
        Ok(tools) => tools.len(),
        Err(e) => return failed(ctx, "list_tools", e.into()),
    };

    let caps = &init.capabilities;
    if ctx.json_output {
        return print_json(&json!({
            "status": "success",
            "server": {
                "name": init.server_info.name,
                "version": init.server_info.version,
                "protocolVersion": init.protocol_version(),
            },
            "capabilities": {
                "tools": caps.has_tools(),
                "prompts": caps.has_prompts(),
                "resources": caps.has_resources(),
                "progress": caps.supports_progress_reporting,
                "cancellation": caps.supports_cancellation,
            },
            "toolCount": tool_count,
        }));
    }

    println!(
        "✓ Initialized: {} v{} (protocol {})",
        init.server_info.name,
        init.server_info.version,
        init.protocol_version()
    );
    println!();
    println!("Capabilities:");
    for (label, on) in [
        ("tools", caps.has_tools()),
        ("prompts", caps.has_prompts()),
        ("resources", caps.has_resources()),
        ("progress reporting", caps.supports_progress_reporting),
        ("cancellation", caps.supports_cancellation),
    ] {
        println!("  {} {label}", if on { "✓" } else { "·" });
    }
    println!();
    println!("✓ Listed {tool_count} tools");
    Ok(())
}
