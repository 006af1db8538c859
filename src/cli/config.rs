//! Config check command handler.

use anyhow::{Context, Result};

use speakmcp_core::config::validate::{validate_config, validate_semantics, DiagnosticLevel};
use speakmcp_core::config::Config;

/// Validate the configuration file: structure first, then semantics.
pub(crate) fn cmd_config_check() -> Result<()> {
    let config_path = Config::path();
    println!("Config file: {}", config_path.display());

    if !config_path.exists() {
        println!("[OK] No config file found (using defaults)");
        return Ok(());
    }

    let content = std::fs::read_to_string(&config_path).context("Failed to read config file")?;

    let raw: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            println!("[ERROR] Invalid JSON: {}", e);
            return Ok(());
        }
    };

    let mut diagnostics = validate_config(&raw);
    match serde_json::from_value::<Config>(raw) {
        Ok(config) => diagnostics.extend(validate_semantics(&config)),
        Err(e) => println!("[ERROR] Config does not match the expected shape: {}", e),
    }

    for diag in &diagnostics {
        println!("{}", diag);
    }

    let errors = diagnostics
        .iter()
        .filter(|d| d.level == DiagnosticLevel::Error)
        .count();
    let warnings = diagnostics
        .iter()
        .filter(|d| d.level == DiagnosticLevel::Warn)
        .count();

    if errors == 0 && warnings == 0 {
        println!("\nConfiguration looks good!");
    } else {
        println!("\nFound {} error(s), {} warning(s)", errors, warnings);
    }
    Ok(())
}
