//! agentd - one-shot agent CLI.
//!
//! Runs a single prompt through the agent loop against the configured
//! workspace. Permission-gated tools prompt on stdin unless `--yes` is
//! passed; `--stream` prints incremental events instead of waiting for the
//! final answer.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentd::agent::{AgentEvent, AgentRequest};
use agentd::config::Config;
use agentd::runtime::Runtime;
use agentd::tools::{AllowAll, PermissionHandler, PermissionLevel};

/// Asks the operator on stdin before a gated tool runs.
struct StdinPrompt;

#[async_trait]
impl PermissionHandler for StdinPrompt {
    async fn allow(&self, tool: &str, level: PermissionLevel, args: &Value) -> bool {
        let tool = tool.to_string();
        let level = level.as_str();
        let summary = args.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            // Char-based cut; the arguments JSON may hold multi-byte text.
            let preview = agentd::util::truncate_chars(&summary, 200);
            eprint!("Allow {} ({}) with {}? [y/N] ", tool, level, preview);
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim(), "y" | "Y" | "yes")
        })
        .await;
        answer.unwrap_or(false)
    }
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentd=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut stream_mode = false;
    let mut auto_approve = false;
    let mut prompt_parts = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--stream" => stream_mode = true,
            "--yes" | "-y" => auto_approve = true,
            other => prompt_parts.push(other.to_string()),
        }
    }
    if prompt_parts.is_empty() {
        anyhow::bail!("usage: agentd [--stream] [--yes] <prompt>");
    }
    let prompt = prompt_parts.join(" ");

    let config = Config::from_env()?;
    info!(model = %config.default_model, workspace = %config.workspace_path.display(), "configuration loaded");

    let permissions: Arc<dyn PermissionHandler> = if auto_approve {
        Arc::new(AllowAll)
    } else {
        Arc::new(StdinPrompt)
    };
    let runtime = Runtime::build(config, permissions).await?;

    let ctrlc_runtime = Arc::clone(&runtime);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, shutting down");
            ctrlc_runtime.shutdown().await;
            std::process::exit(130);
        }
    });

    let request = AgentRequest::new(prompt);
    if stream_mode {
        let stream = Arc::clone(&runtime.agent).stream(request);
        pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                AgentEvent::Text { delta } => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolUse { name, .. } => eprintln!("[tool] {}", name),
                AgentEvent::ToolResult { name, success, .. } => {
                    eprintln!("[tool] {} {}", name, if success { "ok" } else { "failed" })
                }
                AgentEvent::Done { final_text } => println!("{}", final_text),
                AgentEvent::Error { message } => eprintln!("error: {}", message),
            }
        }
    } else {
        let answer = runtime.agent.run(request).await?;
        println!("{}", answer);
    }

    runtime.shutdown().await;
    Ok(())
}
