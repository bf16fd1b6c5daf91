//! Command-line argument parsing for plugin-sandbox

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// plugin-sandbox - Run untrusted plugins in isolated processes
#[derive(Parser, Debug)]
#[command(name = "plugin-sandbox")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Plugins root directory (overrides configuration)
    #[arg(short, long, value_name = "DIR")]
    pub plugins_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Load all plugins and print their metadata
    List,

    /// Print the callable schemas of all tool plugins
    Tools,

    /// Send a raw payload to a plugin
    Exec {
        /// Plugin name
        plugin: String,
        /// JSON payload
        payload: String,
    },

    /// Invoke one operation of a tool plugin
    Call {
        /// Plugin name
        plugin: String,
        /// Tool name
        tool: String,
        /// JSON object of arguments
        #[arg(default_value = "{}")]
        args: String,
    },

    /// Check plugin packages without loading them
    Validate {
        /// Directory to check instead of the configured root
        dir: Option<PathBuf>,
    },
}
