/// Dataset persistence
///
/// Datasets arrive from the UI layer already parsed (CSV import is not the
/// engine's job): a header list and rows keyed by column name.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use super::now_millis;

/// Dataset record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, String>>,
}

impl Dataset {
    pub fn new(id: impl Into<String>, name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            columns,
            rows: vec![],
        }
    }

    /// Append a row given in column order
    pub fn push_row<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let row = self
            .columns
            .iter()
            .cloned()
            .zip(values.into_iter().map(Into::into))
            .collect();
        self.rows.push(row);
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Value of `column` at `row`
    ///
    /// A row past the end reads row 0. An unknown column reads the first
    /// column. Returns `None` only when the dataset has no rows or columns.
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let record = self.rows.get(row).or_else(|| self.rows.first())?;

        let column = if self.columns.iter().any(|c| c == column) {
            column
        } else {
            self.columns.first()?.as_str()
        };

        record.get(column).map(String::as_str)
    }
}

/// Dataset repository for database operations
pub struct DatasetRepository {
    pool: SqlitePool,
}

impl DatasetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a dataset
    pub async fn save(&self, dataset: &Dataset) -> Result<()> {
        sqlx::query(
            "INSERT INTO datasets (id, name, columns, rows, created_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, columns = excluded.columns, rows = excluded.rows",
        )
        .bind(&dataset.id)
        .bind(&dataset.name)
        .bind(serde_json::to_string(&dataset.columns)?)
        .bind(serde_json::to_string(&dataset.rows)?)
        .bind(now_millis()?)
        .execute(&self.pool)
        .await
        .context("Failed to save dataset")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT id, name, columns, rows FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch dataset")?;

        row.map(dataset_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT id, name, columns, rows FROM datasets ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list datasets")?;

        rows.into_iter().map(dataset_from_row).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM datasets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete dataset")?;

        Ok(result.rows_affected() > 0)
    }
}

fn dataset_from_row(row: SqliteRow) -> Result<Dataset> {
    Ok(Dataset {
        id: row.get("id"),
        name: row.get("name"),
        columns: serde_json::from_str(&row.get::<String, _>("columns"))
            .context("Malformed dataset columns")?,
        rows: serde_json::from_str(&row.get::<String, _>("rows"))
            .context("Malformed dataset rows")?,
    })
}
