//! `conduit tools <server>` - list a server's tools.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{Context, print_json, textwrap_simple};

/// Arguments for `conduit tools`.
#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// Name of the configured server
    pub server: String,

    /// Only show these tools
    #[arg(long = "name", short = 'n')]
    pub names: Vec<String>,

    /// Show full input schemas
    #[arg(long)]
    pub full: bool,
}

pub async fn run(args: ToolsArgs, ctx: &Context) -> Result<()> {
    let client = ctx.connect(&args.server).await?;
    let tools = client.list_tools(&args.names).await;
    if let Err(e) = client.shutdown().await {
        tracing::debug!(server = %args.server, error = %e, "Shutdown failed");
    }
    let tools = tools?;

    if ctx.json_output {
        let listed: Vec<_> = tools
            .iter()
            .map(|t| {
                if args.full {
                    json!({"name": t.name, "description": t.description, "schema": t.input_schema})
                } else {
                    json!({"name": t.name, "description": t.description})
                }
            })
            .collect();
        return print_json(&json!(listed));
    }

    if tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }

    println!("Tools on {} ({}):", args.server, tools.len());
    for tool in &tools {
        println!("  • {}", tool.name);
        if let Some(desc) = &tool.description {
            for line in textwrap_simple(desc, 70).lines() {
                println!("      {line}");
            }
        }
        if args.full {
            println!(
                "      Schema: {}",
                serde_json::to_string(&tool.input_schema)?
            );
        }
    }
    Ok(())
}
