//! CLI command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::TransportKind;

/// Ringwatch cluster membership simulator
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Set the log level; `RUST_LOG` takes precedence when set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Configuration file to use instead of the per-user one
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Main command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start a loopback cluster, kill one silo and report how fast it is declared dead
    Simulate {
        /// Number of silos to start (overrides `simulation.silos`)
        #[arg(short, long)]
        silos: Option<u16>,

        /// Index of the silo to kill
        #[arg(short, long, default_value = "0")]
        kill: u16,

        /// Transport between silos (overrides `simulation.transport`)
        #[arg(short, long, value_enum)]
        transport: Option<TransportKind>,
    },

    /// Configuration management
    Config {
        /// Configuration action to perform
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration management operations
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Dotted key, for example `membership.probe.interval`
        key: String,
    },

    /// Set a configuration value and save the file
    Set {
        /// Dotted key
        key: String,
        /// New value, parsed like the current one
        value: String,
    },

    /// Print the effective configuration
    List {
        /// Show only the given section, for example `membership.voting`
        #[arg(long)]
        section: Option<String>,
    },

    /// Show configuration file location
    Path,
}
