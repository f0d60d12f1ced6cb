// Loom prompt-chain runtime
// Main entry point for the loom binary

use clap::Parser;
use loom_engine::cli::{ChainAction, Cli, Command, ConnectorAction, OutputAction, WorkflowAction};
use loom_engine::config::Config;
use loom_engine::handlers::{
    handle_chain_outputs, handle_chain_run, handle_connector_install, handle_connector_list,
    handle_connector_models, handle_connector_uninstall, handle_doctor, handle_output_delete,
    handle_output_rate, handle_recover, handle_workflow_outputs, handle_workflow_run,
    OutputFormat,
};
use loom_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize basic telemetry first (before config is loaded)
    init_telemetry();

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Loom v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let mut config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    if let Some(level) = cli.log {
        config.core.log_level = level;
    }

    // Re-initialize telemetry with config-driven log level
    // (only takes effect if RUST_LOG env var is not set)
    init_telemetry_with_level(&config.core.log_level);

    match cli.command {
        Command::Connector { action } => match action {
            ConnectorAction::Install { id, url } => {
                handle_connector_install(&id, &url, &config, format).await
            }
            ConnectorAction::Uninstall { id } => {
                handle_connector_uninstall(&id, &config, format).await
            }
            ConnectorAction::List => handle_connector_list(&config, format).await,
            ConnectorAction::Models { id } => handle_connector_models(&id, &config, format).await,
        },

        Command::Chain { action } => match action {
            ChainAction::Run { chain_id, no_wait } => {
                tracing::info!("Running chain: {}", chain_id);
                handle_chain_run(&chain_id, no_wait, &config, format).await
            }
            ChainAction::Outputs { chain_id, limit } => {
                handle_chain_outputs(&chain_id, limit, &config, format).await
            }
        },

        Command::Workflow { action } => match action {
            WorkflowAction::Run {
                workflow_id,
                no_wait,
            } => {
                tracing::info!("Running workflow: {}", workflow_id);
                handle_workflow_run(&workflow_id, no_wait, &config, format).await
            }
            WorkflowAction::Outputs { workflow_id } => {
                handle_workflow_outputs(&workflow_id, &config, format).await
            }
        },

        Command::Output { action } => match action {
            OutputAction::Delete { id } => handle_output_delete(&id, &config, format).await,
            OutputAction::Rate { id, rating } => {
                handle_output_rate(&id, &rating, &config, format).await
            }
        },

        Command::Recover => handle_recover(&config, format).await,

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }
    }
}
