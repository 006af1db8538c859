//! CLI module - command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod agent;
pub mod config;
pub mod tools;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

use speakmcp_core::config::Config;

#[derive(Parser)]
#[command(name = "speakmcp")]
#[command(version)]
#[command(about = "Agent orchestration over MCP tool providers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools exposed by the configured MCP providers
    Tools {
        /// Print the tool list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one agent turn against the configured providers
    Run {
        /// Message to process
        #[arg(short, long)]
        message: String,
        /// Override the iteration limit for this run
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Connect to a single configured provider and report its tool count
    TestServer {
        /// Provider name as it appears in `mcp.servers`
        name: String,
    },
    /// Validate the configuration file
    ConfigCheck,
}

/// Entry point for the CLI, called from main().
pub async fn run() -> Result<()> {
    // Fall back to defaults when the config file is missing or unreadable so
    // `config-check` can still report what is wrong with it.
    let config = Config::load().unwrap_or_default();
    if let Err(e) = speakmcp_core::utils::logging::init_logging(&config.logging) {
        eprintln!("Logging setup failed: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Tools { json }) => {
            tools::cmd_tools(config, json).await?;
        }
        Some(Commands::Run {
            message,
            max_iterations,
        }) => {
            agent::cmd_run(config, message, max_iterations).await?;
        }
        Some(Commands::TestServer { name }) => {
            tools::cmd_test_server(config, &name).await?;
        }
        Some(Commands::ConfigCheck) => {
            config::cmd_config_check()?;
        }
    }

    Ok(())
}
