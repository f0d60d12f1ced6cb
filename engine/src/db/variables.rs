/// Variable persistence
///
/// A variable has a default value and optional per-workflow overrides. Chain
/// runs use the default; workflow runs use the override for that workflow
/// when one exists.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

/// Variable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub default_value: String,
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

impl Variable {
    pub fn new(name: impl Into<String>, default_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: default_value.into(),
            overrides: HashMap::new(),
        }
    }

    /// Value in effect for a run, preferring the workflow's override
    pub fn value_for(&self, workflow_id: Option<&str>) -> &str {
        workflow_id
            .and_then(|id| self.overrides.get(id))
            .unwrap_or(&self.default_value)
    }
}

/// Resolve a set of variables into a name → value map
pub fn bindings(variables: &[Variable], workflow_id: Option<&str>) -> HashMap<String, String> {
    variables
        .iter()
        .map(|v| (v.name.clone(), v.value_for(workflow_id).to_string()))
        .collect()
}

/// Variable repository for database operations
pub struct VariableRepository {
    pool: SqlitePool,
}

impl VariableRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a variable, overrides included
    pub async fn save(&self, variable: &Variable) -> Result<()> {
        sqlx::query(
            "INSERT INTO variables (name, default_value, overrides) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET default_value = excluded.default_value, overrides = excluded.overrides",
        )
        .bind(&variable.name)
        .bind(&variable.default_value)
        .bind(serde_json::to_string(&variable.overrides)?)
        .execute(&self.pool)
        .await
        .context("Failed to save variable")?;

        Ok(())
    }

    /// Set one workflow's override, creating the variable if needed
    pub async fn set_override(&self, name: &str, workflow_id: &str, value: &str) -> Result<()> {
        let mut variable = self
            .get(name)
            .await?
            .unwrap_or_else(|| Variable::new(name, ""));
        variable
            .overrides
            .insert(workflow_id.to_string(), value.to_string());
        self.save(&variable).await
    }

    pub async fn get(&self, name: &str) -> Result<Option<Variable>> {
        let row = sqlx::query("SELECT name, default_value, overrides FROM variables WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch variable")?;

        row.map(variable_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Variable>> {
        let rows =
            sqlx::query("SELECT name, default_value, overrides FROM variables ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list variables")?;

        rows.into_iter().map(variable_from_row).collect()
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM variables WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .context("Failed to delete variable")?;

        Ok(result.rows_affected() > 0)
    }
}

fn variable_from_row(row: SqliteRow) -> Result<Variable> {
    Ok(Variable {
        name: row.get("name"),
        default_value: row.get("default_value"),
        overrides: serde_json::from_str(&row.get::<String, _>("overrides"))
            .context("Malformed variable overrides")?,
    })
}
