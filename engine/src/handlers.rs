//! Command handlers for CLI operations
//!
//! Each handler opens an [`Engine`], performs one operation and prints the
//! result as text or JSON. Run commands wait for their outputs by default so
//! the process does not exit with cells still in flight.

use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::Config;
use crate::db::{Database, Output, Rating, WorkflowOutput};
use crate::engine::Engine;
use crate::message_bus::{Event, EventType};
use loom_connectors::ConnectorRegistry;

/// How long to wait on the event stream before re-checking storage
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

async fn open_engine(config: &Config) -> Result<Engine> {
    Engine::open(config.clone())
        .await
        .context("Failed to start engine")
}

/// Install or upgrade a connector
pub async fn handle_connector_install(
    id: &str,
    url: &str,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = engine.install(id, url).await;
    engine.shutdown().await?;
    let installed = result.with_context(|| format!("Failed to install connector '{}'", id))?;

    match format {
        OutputFormat::Text => {
            println!(
                "Installed {} {} ({} assets)",
                installed.connector_id,
                installed.version_tag,
                installed.manifest.assets.len()
            );
            println!("  Path: {}", installed.path.display());
        }
        OutputFormat::Json => {
            let output = json!({
                "connector_id": installed.connector_id,
                "version_tag": installed.version_tag,
                "path": installed.path,
                "manifest": installed.manifest,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Remove a connector
pub async fn handle_connector_uninstall(id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = engine.uninstall(id).await;
    engine.shutdown().await?;
    result.with_context(|| format!("Failed to uninstall connector '{}'", id))?;

    match format {
        OutputFormat::Text => println!("Uninstalled {}", id),
        OutputFormat::Json => println!("{}", json!({ "uninstalled": id })),
    }
    Ok(())
}

/// List installed connectors
pub async fn handle_connector_list(config: &Config, format: OutputFormat) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = engine.list_installed_connectors().await;
    engine.shutdown().await?;
    let connectors = result.context("Failed to list connectors")?;

    match format {
        OutputFormat::Text => {
            if connectors.is_empty() {
                println!("No connectors installed");
                return Ok(());
            }

            println!("Installed Connectors:");
            println!();
            for c in &connectors {
                println!(
                    "  {} ({}) {}",
                    c.id,
                    c.name,
                    c.installed_version.as_deref().unwrap_or("unversioned")
                );
                if !c.models.is_empty() {
                    println!("    Models: {}", c.models.join(", "));
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "connectors": connectors,
                "count": connectors.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Fetch a connector's live model list using its saved settings
pub async fn handle_connector_models(id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = async {
        let settings = engine
            .connector_settings()
            .settings_for(id)
            .await
            .context("Failed to read connector settings")?;
        engine
            .fetch_dynamic_model_list(id, settings)
            .await
            .with_context(|| format!("Failed to list models for '{}'", id))
    }
    .await;
    engine.shutdown().await?;
    let models = result?;

    match format {
        OutputFormat::Text => {
            println!("Models for {}:", id);
            for model in &models {
                println!("  {}", model);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "models": models }))?);
        }
    }
    Ok(())
}

/// Run a stored chain
pub async fn handle_chain_run(
    chain_id: &str,
    no_wait: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = run_chain_and_wait(&engine, chain_id, no_wait).await;
    engine.shutdown().await?;
    let outputs = result?;

    match format {
        OutputFormat::Text => {
            println!("Chain {}: {} outputs", chain_id, outputs.len());
            println!();
            for output in &outputs {
                print_output(output);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "chain_id": chain_id,
                "outputs": outputs,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

async fn run_chain_and_wait(engine: &Engine, chain_id: &str, no_wait: bool) -> Result<Vec<Output>> {
    let mut events = engine.subscribe(EventType::OutputFinished).await;
    let ids = engine
        .run_saved_chain(chain_id)
        .await
        .with_context(|| format!("Failed to run chain '{}'", chain_id))?;

    if !no_wait {
        let mut pending: HashSet<String> = ids.iter().cloned().collect();
        while !pending.is_empty() {
            match tokio::time::timeout(WAIT_POLL_INTERVAL, events.recv()).await {
                Ok(Some(Event::OutputFinished(event))) => {
                    pending.remove(&event.output_id);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                // Events can be dropped under load; storage is authoritative
                Err(_) => {
                    let mut finished = Vec::new();
                    for id in &pending {
                        match engine.get_output(id).await? {
                            Some(output) if output.loading => {}
                            _ => finished.push(id.clone()),
                        }
                    }
                    for id in finished {
                        pending.remove(&id);
                    }
                }
            }
        }
    }

    let mut outputs = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(output) = engine.get_output(id).await? {
            outputs.push(output);
        }
    }
    Ok(outputs)
}

/// Show a chain's outputs
pub async fn handle_chain_outputs(
    chain_id: &str,
    limit: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = engine.list_outputs(chain_id).await;
    engine.shutdown().await?;
    let mut outputs = result.context("Failed to list outputs")?;
    outputs.truncate(limit);

    match format {
        OutputFormat::Text => {
            if outputs.is_empty() {
                println!("No outputs for chain {}", chain_id);
                return Ok(());
            }
            println!("Outputs for chain {} (newest first):", chain_id);
            println!();
            for output in &outputs {
                print_output(output);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "outputs": outputs,
                "count": outputs.len(),
                "limit": limit,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Run a stored workflow
pub async fn handle_workflow_run(
    workflow_id: &str,
    no_wait: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = run_workflow_and_wait(&engine, workflow_id, no_wait).await;
    engine.shutdown().await?;
    let lanes = result?;

    print_lanes(workflow_id, &lanes, format)
}

async fn run_workflow_and_wait(
    engine: &Engine,
    workflow_id: &str,
    no_wait: bool,
) -> Result<Vec<WorkflowOutput>> {
    let mut events = engine.subscribe(EventType::WorkflowFinished).await;
    let ids = engine
        .run_workflow(workflow_id)
        .await
        .with_context(|| format!("Failed to run workflow '{}'", workflow_id))?;

    if !no_wait {
        let mut pending: HashSet<String> = ids.iter().cloned().collect();
        while !pending.is_empty() {
            match tokio::time::timeout(WAIT_POLL_INTERVAL, events.recv()).await {
                Ok(Some(Event::WorkflowFinished {
                    workflow_output_id, ..
                })) => {
                    pending.remove(&workflow_output_id);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    let mut finished = Vec::new();
                    for id in &pending {
                        match engine.get_workflow_output(id).await? {
                            Some(lane) if lane.loading => {}
                            _ => finished.push(id.clone()),
                        }
                    }
                    for id in finished {
                        pending.remove(&id);
                    }
                }
            }
        }
    }

    let mut lanes = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(lane) = engine.get_workflow_output(id).await? {
            lanes.push(lane);
        }
    }
    Ok(lanes)
}

/// Show a workflow's outputs
pub async fn handle_workflow_outputs(
    workflow_id: &str,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = engine.list_workflow_outputs(workflow_id).await;
    engine.shutdown().await?;
    let lanes = result.context("Failed to list workflow outputs")?;

    print_lanes(workflow_id, &lanes, format)
}

/// Delete an output
pub async fn handle_output_delete(id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let engine = open_engine(config).await?;
    let result = engine.delete_output(id).await;
    engine.shutdown().await?;
    let deleted = result.context("Failed to delete output")?;

    match format {
        OutputFormat::Text => {
            if deleted {
                println!("Deleted output {}", id);
            } else {
                println!("Output {} not found", id);
            }
        }
        OutputFormat::Json => println!("{}", json!({ "id": id, "deleted": deleted })),
    }
    Ok(())
}

/// Rate an output
pub async fn handle_output_rate(
    id: &str,
    rating: &str,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let rating: Rating = rating.parse()?;

    let engine = open_engine(config).await?;
    let result = engine.rate_output(id, rating).await;
    engine.shutdown().await?;
    let updated = result.context("Failed to rate output")?;

    if !updated {
        anyhow::bail!("Output not found: {}", id);
    }

    match format {
        OutputFormat::Text => println!("Rated output {} as {}", id, rating.as_str()),
        OutputFormat::Json => println!("{}", json!({ "id": id, "rating": rating })),
    }
    Ok(())
}

/// Open the engine, which recovers interrupted outputs, and report
pub async fn handle_recover(config: &Config, format: OutputFormat) -> Result<()> {
    let engine = open_engine(config).await?;
    let report = engine.recovery_report();
    let owner = engine.owns_data_dir();
    engine.shutdown().await?;

    if !owner {
        anyhow::bail!(
            "Another engine is running on {}; stop it before recovering",
            config.core.data_dir.display()
        );
    }

    match format {
        OutputFormat::Text => {
            if report.total() == 0 {
                println!("Nothing to recover");
            } else {
                println!(
                    "Recovered {} outputs and {} workflow outputs",
                    report.outputs, report.workflow_outputs
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

/// Records still loading; a failed count becomes an issue
async fn count_loading(db: &Database, issues: &mut Vec<String>) -> i64 {
    let mut loading = 0;
    for (table, count) in [
        ("outputs", db.outputs().count_loading().await),
        ("workflow outputs", db.workflow_outputs().count_loading().await),
    ] {
        match count {
            Ok(n) => loading += n,
            Err(e) => issues.push(format!("Cannot count loading {}: {:#}", table, e)),
        }
    }
    loading
}

/// Run system diagnostics
///
/// Checks the data directory, the database and the connector directory
/// without starting the orchestrator, so nothing is recovered or dispatched.
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(&str, String)> = Vec::new();

    // Config is already validated when loaded
    checks.push(("Configuration", "Valid".to_string()));

    if config.core.data_dir.exists() {
        checks.push(("Data directory", "Exists".to_string()));
    } else {
        checks.push(("Data directory", "Missing".to_string()));
        issues.push(format!(
            "Data directory does not exist: {:?}",
            config.core.data_dir
        ));
    }

    match Database::new(&config.database_path()).await {
        Ok(db) => {
            checks.push(("Database connection", "OK".to_string()));
            let loading = count_loading(&db, &mut issues).await;
            if loading > 0 {
                checks.push(("Loading outputs", loading.to_string()));
                issues.push(format!(
                    "{} outputs are still loading. Run 'loom recover' if no engine is running.",
                    loading
                ));
            }
            db.close().await.ok();
        }
        Err(e) => {
            checks.push(("Database connection", "Failed".to_string()));
            issues.push(format!("Cannot open database: {:#}", e));
        }
    }

    let registry = ConnectorRegistry::new(config.connectors.dir.clone())?;
    match registry.installed_ids().await {
        Ok(ids) => {
            checks.push(("Connectors installed", ids.len().to_string()));
            for id in ids {
                let entry = registry.resolve_entry_point(&id).await;
                if !entry.path.exists() {
                    issues.push(format!(
                        "Connector '{}' has no entry file at {}",
                        id,
                        entry.path.display()
                    ));
                }
            }
        }
        Err(e) => {
            checks.push(("Connector directory", "Unreadable".to_string()));
            issues.push(format!("Cannot read connector directory: {}", e));
        }
    }

    match format {
        OutputFormat::Text => {
            println!("Loom System Diagnostics");
            println!("=======================");
            println!();

            println!("System Checks:");
            for (check, status) in &checks {
                println!("  {:<25} {}", format!("{}:", check), status);
            }

            println!();

            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn print_output(output: &Output) {
    println!("Output ID: {}", output.id);
    println!("  Created: {}", format_millis(output.created_at));
    if output.loading {
        println!("  Status: loading");
    }
    if let Some(error) = &output.error {
        println!("  Error: {}", error);
    }
    for completion in &output.completions {
        println!("  [{}]", completion.model_id);
        if let Some(content) = &completion.content {
            println!("  {}", content);
        }
    }
    println!();
}

fn print_lanes(workflow_id: &str, lanes: &[WorkflowOutput], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Workflow {}: {} lanes", workflow_id, lanes.len());
            println!();
            for lane in lanes {
                println!("Lane {} (row {})", lane.id, lane.row_index);
                for (step, completion) in lane.completions.iter().enumerate() {
                    println!(
                        "  {}. {} [{}]",
                        step + 1,
                        completion.chain_name,
                        completion.model_id
                    );
                    if let Some(error) = &completion.error {
                        println!("     Error: {}", error);
                    }
                }
                if let Some(last) = lane.last_completion().and_then(|c| c.content.as_deref()) {
                    println!("  Result: {}", last);
                }
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "workflow_id": workflow_id,
                "outputs": lanes,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_count_loading_sums_both_tables() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("loom.db")).await.unwrap();
        db.outputs().create("o1", "c1").await.unwrap();
        db.workflow_outputs().create("l1", "w1", 0).await.unwrap();

        let mut issues = Vec::new();
        assert_eq!(count_loading(&db, &mut issues).await, 2);
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn test_count_loading_reports_query_errors() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("loom.db")).await.unwrap();
        db.outputs().create("o1", "c1").await.unwrap();
        sqlx::query("DROP TABLE workflow_outputs")
            .execute(db.pool())
            .await
            .unwrap();

        let mut issues = Vec::new();
        assert_eq!(count_loading(&db, &mut issues).await, 1);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("workflow outputs"));
    }
}
