/// Chain and workflow persistence
///
/// Fragments, model selections and workflow step lists are stored as JSON
/// columns; the engine always reads and writes them whole.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::now_millis;

/// One prompt fragment of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptFragment {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub content: String,
    #[serde(default)]
    pub active_version_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl PromptFragment {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            enabled: true,
            content: content.into(),
            active_version_id: None,
        }
    }

    pub fn disabled(content: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(content)
        }
    }
}

/// A model picked for a run, with its connector and property bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub model_id: String,
    pub connector_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl ModelSelection {
    pub fn new(connector_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            connector_id: connector_id.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Selections with an empty model id are skipped by every run
    pub fn is_runnable(&self) -> bool {
        !self.model_id.trim().is_empty()
    }
}

/// Chain record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: String,
    pub name: String,
    pub fragments: Vec<PromptFragment>,
    pub models: Vec<ModelSelection>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Chain {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            fragments: vec![],
            models: vec![],
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// Workflow record: an ordered list of chain ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub chain_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, chain_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            chain_ids,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Chain id of a step; a chain may appear at several steps
    pub fn chain_at(&self, step: usize) -> Option<&str> {
        self.chain_ids.get(step).map(String::as_str)
    }
}

/// Chain repository for database operations
pub struct ChainRepository {
    pool: SqlitePool,
}

impl ChainRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a chain
    pub async fn save(&self, chain: &Chain) -> Result<Chain> {
        let now = now_millis()?;
        let fragments = serde_json::to_string(&chain.fragments)?;
        let models = serde_json::to_string(&chain.models)?;

        sqlx::query(
            "INSERT INTO chains (id, name, fragments, models, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, fragments = excluded.fragments, models = excluded.models, updated_at = excluded.updated_at",
        )
        .bind(&chain.id)
        .bind(&chain.name)
        .bind(fragments)
        .bind(models)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save chain")?;

        self.get(&chain.id)
            .await?
            .context("Chain vanished after save")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Chain>> {
        let row = sqlx::query(
            "SELECT id, name, fragments, models, created_at, updated_at FROM chains WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chain")?;

        row.map(chain_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Chain>> {
        let rows = sqlx::query(
            "SELECT id, name, fragments, models, created_at, updated_at FROM chains ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list chains")?;

        rows.into_iter().map(chain_from_row).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chains WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete chain")?;

        Ok(result.rows_affected() > 0)
    }
}

fn chain_from_row(row: SqliteRow) -> Result<Chain> {
    Ok(Chain {
        id: row.get("id"),
        name: row.get("name"),
        fragments: serde_json::from_str(&row.get::<String, _>("fragments"))
            .context("Malformed chain fragments")?,
        models: serde_json::from_str(&row.get::<String, _>("models"))
            .context("Malformed chain models")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Workflow repository for database operations
pub struct WorkflowRepository {
    pool: SqlitePool,
}

impl WorkflowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, workflow: &Workflow) -> Result<Workflow> {
        let now = now_millis()?;

        sqlx::query(
            "INSERT INTO workflows (id, name, chain_ids, created_at, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, chain_ids = excluded.chain_ids, updated_at = excluded.updated_at",
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(serde_json::to_string(&workflow.chain_ids)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save workflow")?;

        self.get(&workflow.id)
            .await?
            .context("Workflow vanished after save")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT id, name, chain_ids, created_at, updated_at FROM workflows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch workflow")?;

        row.map(workflow_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(
            "SELECT id, name, chain_ids, created_at, updated_at FROM workflows ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workflows")?;

        rows.into_iter().map(workflow_from_row).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete workflow")?;

        Ok(result.rows_affected() > 0)
    }
}

fn workflow_from_row(row: SqliteRow) -> Result<Workflow> {
    Ok(Workflow {
        id: row.get("id"),
        name: row.get("name"),
        chain_ids: serde_json::from_str(&row.get::<String, _>("chain_ids"))
            .context("Malformed workflow chain list")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
