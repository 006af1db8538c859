//! Run command handler: one agent turn from the command line.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use speakmcp_core::agent::RunStatus;
use speakmcp_core::config::Config;
use speakmcp_core::providers::build_provider;
use speakmcp_core::Engine;

/// Conversation used for one-shot CLI runs.
const CLI_CONVERSATION: &str = "cli";

/// Process a single message and print the final answer.
pub(crate) async fn cmd_run(
    mut config: Config,
    message: String,
    max_iterations: Option<u32>,
) -> Result<()> {
    if let Some(limit) = max_iterations {
        config.agent.max_iterations = limit;
    }

    let provider = build_provider(&config)
        .context("Failed to create completion provider; check the `provider` config section")?;
    let engine = Engine::new(config, Arc::from(provider));

    let report = engine.start().await;
    for (name, error) in &report.failed {
        eprintln!("Provider '{}' failed to start: {}", name, error);
    }
    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "Tool providers initialized"
    );

    let outcome = engine.run_now(CLI_CONVERSATION, &message).await;
    engine.shutdown().await;
    let result = outcome.context("Agent run failed")?;

    println!("{}", result.content);
    match result.status {
        RunStatus::Completed => {}
        RunStatus::IterationLimit => {
            eprintln!("(finished after {} iterations)", result.iterations);
        }
        RunStatus::Stopped | RunStatus::TimedOut | RunStatus::Error => {
            anyhow::bail!("Run ended with status {:?}", result.status);
        }
    }
    Ok(())
}
