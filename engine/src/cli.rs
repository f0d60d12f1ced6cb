//! CLI interface for Loom
//!
//! This module provides the command-line interface using clap's derive API.
//! It stands in for the desktop front end: every command maps onto one
//! [`Engine`](crate::Engine) operation.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Loom prompt-chain runtime
///
/// Runs chains of prompt fragments against installable model connectors,
/// fans them out over datasets and sequences them into workflows.
#[derive(Parser, Debug)]
#[command(name = "loom")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage connector packages
    Connector {
        #[command(subcommand)]
        action: ConnectorAction,
    },

    /// Run chains and inspect their outputs
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },

    /// Run workflows and inspect their outputs
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Manage individual outputs
    Output {
        #[command(subcommand)]
        action: OutputAction,
    },

    /// Finalize outputs left loading by an interrupted run
    Recover,

    /// Run system diagnostics
    Doctor,
}

/// Connector management actions
#[derive(Subcommand, Debug)]
pub enum ConnectorAction {
    /// Install or upgrade a connector from a release URL
    Install {
        /// Connector id (its folder name)
        id: String,
        /// URL returning the release description JSON
        url: String,
    },

    /// Remove an installed connector
    Uninstall {
        /// Connector id
        id: String,
    },

    /// List installed connectors
    List,

    /// Fetch a connector's live model list
    Models {
        /// Connector id
        id: String,
    },
}

/// Chain actions
#[derive(Subcommand, Debug)]
pub enum ChainAction {
    /// Run a stored chain and wait for every output
    Run {
        /// Chain id
        chain_id: String,
        /// Return as soon as the outputs are dispatched
        #[arg(long)]
        no_wait: bool,
    },

    /// Show a chain's outputs, newest first
    Outputs {
        /// Chain id
        chain_id: String,
        /// Number of outputs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

/// Workflow actions
#[derive(Subcommand, Debug)]
pub enum WorkflowAction {
    /// Run a stored workflow and wait for every lane
    Run {
        /// Workflow id
        workflow_id: String,
        /// Return as soon as the first step is dispatched
        #[arg(long)]
        no_wait: bool,
    },

    /// Show a workflow's outputs
    Outputs {
        /// Workflow id
        workflow_id: String,
    },
}

/// Output actions
#[derive(Subcommand, Debug)]
pub enum OutputAction {
    /// Delete an output
    Delete {
        /// Output id
        id: String,
    },

    /// Rate an output
    Rate {
        /// Output id
        id: String,
        /// like, dislike or none
        rating: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["loom", "recover"]);
        assert!(matches!(cli.command, Command::Recover));
        assert!(!cli.json);
        assert!(cli.log.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["loom", "--json", "--log", "debug", "doctor"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
    }

    #[test]
    fn test_connector_install() {
        let cli = Cli::parse_from([
            "loom",
            "connector",
            "install",
            "openai",
            "https://example.com/releases/latest",
        ]);
        if let Command::Connector {
            action: ConnectorAction::Install { id, url },
        } = cli.command
        {
            assert_eq!(id, "openai");
            assert_eq!(url, "https://example.com/releases/latest");
        } else {
            panic!("Expected Connector Install command");
        }
    }

    #[test]
    fn test_chain_run_defaults_to_waiting() {
        let cli = Cli::parse_from(["loom", "chain", "run", "c1"]);
        if let Command::Chain {
            action: ChainAction::Run { chain_id, no_wait },
        } = cli.command
        {
            assert_eq!(chain_id, "c1");
            assert!(!no_wait);
        } else {
            panic!("Expected Chain Run command");
        }
    }

    #[test]
    fn test_chain_outputs_limit() {
        let cli = Cli::parse_from(["loom", "chain", "outputs", "c1", "--limit", "3"]);
        if let Command::Chain {
            action: ChainAction::Outputs { limit, .. },
        } = cli.command
        {
            assert_eq!(limit, 3);
        } else {
            panic!("Expected Chain Outputs command");
        }
    }

    #[test]
    fn test_output_rate() {
        let cli = Cli::parse_from(["loom", "output", "rate", "o1", "like"]);
        if let Command::Output {
            action: OutputAction::Rate { id, rating },
        } = cli.command
        {
            assert_eq!(id, "o1");
            assert_eq!(rating, "like");
        } else {
            panic!("Expected Output Rate command");
        }
    }
}
