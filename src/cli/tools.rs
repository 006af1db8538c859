//! Tools CLI command handlers: tool discovery and provider checks.

use anyhow::{Context, Result};

use speakmcp_core::config::Config;
use speakmcp_core::tools::ToolGateway;

/// List every tool the configured providers expose.
pub(crate) async fn cmd_tools(config: Config, json: bool) -> Result<()> {
    let gateway = ToolGateway::new(config.mcp, None);
    let report = gateway.initialize().await;
    let tools = gateway.get_all_tools();

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        for (name, error) in &report.failed {
            println!("[ERROR] {}: {}", name, error);
        }
        for (name, reason) in &report.skipped {
            println!("[SKIP] {}: {}", name, reason);
        }
        if tools.is_empty() {
            println!("No tools available.");
        } else {
            println!("Available tools:\n");
            let width = tools.iter().map(|t| t.name.len()).max().unwrap_or(0);
            for tool in &tools {
                let marker = if tool.enabled { " " } else { "-" };
                println!(
                    "{} {:<width$}  {}",
                    marker,
                    tool.name,
                    tool.description,
                    width = width
                );
            }
            println!("\n{} tool(s) from {} provider(s)", tools.len(), report.connected.len());
        }
    }

    gateway.shutdown().await;
    Ok(())
}

/// Connect to one provider, list its tools and disconnect.
pub(crate) async fn cmd_test_server(config: Config, name: &str) -> Result<()> {
    let server = config
        .mcp
        .servers
        .get(name)
        .cloned()
        .with_context(|| format!("No provider named '{}' in mcp.servers", name))?;

    let gateway = ToolGateway::new(config.mcp, None);
    match gateway.test_connection(name, &server).await {
        Ok(count) => {
            println!("[OK] {} responded with {} tool(s)", name, count);
            Ok(())
        }
        Err(e) => {
            println!("[ERROR] {}: {}", name, e);
            Err(e.into())
        }
    }
}
