//! `conduit call <server> <tool>` - invoke a tool, directly or as a task.

use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use clap::Args;
use conduit_mcp::{CallToolResult, McpClient};
use serde_json::{Value, json};

use super::{Context, print_json};

/// Arguments for `conduit call`.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Name of the configured server
    pub server: String,

    /// Tool to call
    pub tool: String,

    /// Tool arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,

    /// Run the call as a server-side task
    #[arg(long)]
    pub task: bool,

    /// Task time-to-live in seconds (server default when omitted)
    #[arg(long, requires = "task")]
    pub ttl: Option<u64>,

    /// Seconds to wait for the task result; 0 returns right after creation
    #[arg(long, requires = "task", default_value = "300")]
    pub wait: u64,
}

pub async fn run(args: CallArgs, ctx: &Context) -> Result<()> {
    let arguments = parse_arguments(&args.args)?;
    let client = ctx.connect(&args.server).await?;

    let outcome = if args.task {
        run_task(&client, &args, arguments, ctx).await
    } else {
        client
            .call_tool(&args.tool, arguments)
            .await
            .map(Some)
            .map_err(Into::into)
    };

    if let Err(e) = client.shutdown().await {
        tracing::debug!(server = %args.server, error = %e, "Shutdown failed");
    }

    match outcome? {
        Some(result) => report(&result, ctx),
        None => Ok(()),
    }
}

fn parse_arguments(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
    if !value.is_object() {
        return Err(anyhow!("--args must be a JSON object"));
    }
    Ok(value)
}

async fn run_task(
    client: &McpClient,
    args: &CallArgs,
    arguments: Value,
    ctx: &Context,
) -> Result<Option<CallToolResult>> {
    let task = client
        .call_tool_as_task(&args.tool, arguments, args.ttl.map(Duration::from_secs))
        .await?;

    if args.wait == 0 {
        if ctx.json_output {
            print_json(&serde_json::to_value(&task)?)?;
        } else {
            println!("Task {} is {}", task.task_id, task.status);
        }
        return Ok(None);
    }

    if !ctx.json_output {
        println!("Task {} started, waiting up to {}s", task.task_id, args.wait);
    }
    let result = client
        .task_result(&task.task_id, Duration::from_secs(args.wait))
        .await?;
    Ok(Some(result))
}

fn report(result: &CallToolResult, ctx: &Context) -> Result<()> {
    if ctx.json_output {
        print_json(&json!({
            "isError": result.is_error(),
            "error": result.error_message,
            "content": result.content,
        }))?;
    } else if result.is_error() {
        println!(
            "Tool error: {}",
            result.error_message.as_deref().unwrap_or_default()
        );
    } else {
        match result.text() {
            Some(text) => println!("{text}"),
            None => println!("{}", serde_json::to_string_pretty(&result.content)?),
        }
    }

    if result.is_error() {
        return Err(anyhow!("tool reported an error"));
    }
    Ok(())
}
