//! plugin-sandbox - discover, validate and run sandboxed plugins
//!
//! This is the main entry point for the plugin-sandbox binary.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use plugin_sandbox::config::Config;
use plugin_sandbox::error::DiscoveryError;
use plugin_sandbox::logging::init_logging;
use plugin_sandbox::plugins::{PluginManager, ToolBinder, ToolCallResult};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_error) = match Config::load(args.config.as_deref()) {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };

    init_logging(&config.logging, args.debug);
    info!("Starting plugin-sandbox v{}", env!("CARGO_PKG_VERSION"));

    if let Some(e) = config_error {
        error!("Failed to load configuration: {}", e);
    }

    if let Some(dir) = args.plugins_dir {
        config.plugins.directory = dir;
    }
    if let Command::Validate { dir: Some(dir) } = &args.command {
        config.plugins.directory = dir.clone();
    }

    let manager = PluginManager::new(&config);
    let outcome = run(args.command, &manager).await;
    manager.cleanup_all();

    info!("plugin-sandbox exited");
    outcome
}

async fn run(command: Command, manager: &PluginManager) -> Result<()> {
    if !matches!(command, Command::Validate { .. }) {
        manager.load_all().await?;
    }

    match command {
        Command::List => print_json(&manager.plugins()),
        Command::Tools => print_json(&manager.get_tool_plugins().await),
        Command::Exec { plugin, payload } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let data = manager.execute(&plugin, payload).await?;
            print_json(&data)
        }
        Command::Call { plugin, tool, args } => {
            let args: Value = serde_json::from_str(&args).context("arguments are not valid JSON")?;
            let result = call_tool(manager, &plugin, &tool, &args).await;
            print_json(&result)?;
            if result.success {
                Ok(())
            } else {
                Err(anyhow!("tool call failed"))
            }
        }
        Command::Validate { .. } => validate(manager),
    }
}

async fn call_tool(
    manager: &PluginManager,
    plugin: &str,
    tool: &str,
    args: &Value,
) -> ToolCallResult {
    let tools = manager.get_tool_plugins().await;
    let Some(found) = tools.iter().find(|t| t.metadata.name == plugin) else {
        return ToolCallResult::failure("not_found", &format!("no tool plugin named '{}'", plugin));
    };
    let Some(schema) = found.tool(tool) else {
        return ToolCallResult::failure(
            "not_found",
            &format!("plugin '{}' has no tool '{}'", plugin, tool),
        );
    };

    ToolBinder::new(plugin, schema.clone())
        .invoke(manager, args)
        .await
}

/// Print one line per package; fails if any package is invalid
fn validate(manager: &PluginManager) -> Result<()> {
    let mut invalid = 0;

    for candidate in manager.discover()? {
        match &candidate.result {
            Ok(found) => println!(
                "{}: ok ({} {})",
                candidate.package(),
                found.metadata.name,
                found.metadata.version
            ),
            Err(DiscoveryError::Disabled(_)) => println!("{}: disabled", candidate.package()),
            Err(e) => {
                invalid += 1;
                println!("{}: {}", candidate.package(), e);
            }
        }
    }

    if invalid > 0 {
        return Err(anyhow!("{} invalid plugin package(s)", invalid));
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
