/// WorkflowOutput persistence
///
/// A WorkflowOutput is one lane of a workflow run. It accumulates one
/// completion per finished step and stays `loading = 1` until the lane ends.
/// Completions can only be appended while the lane is loading, and the lane
/// is finalized at most once.
use anyhow::{Context, Result};
use sdk::TokenUsage;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::now_millis;
use super::outputs::{content_hash, decode_usage, encode_usage, parse_rating, Rating};

/// One step's completion on a WorkflowOutput
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompletion {
    pub chain_id: String,
    pub chain_name: String,
    pub model_id: String,
    pub content: Option<String>,
    pub error: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

/// WorkflowOutput record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub id: String,
    pub workflow_id: String,
    /// Dataset row this lane was started with
    pub row_index: usize,
    pub completions: Vec<WorkflowCompletion>,
    pub loading: bool,
    pub error: Option<String>,
    pub rating: Rating,
    pub content_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WorkflowOutput {
    /// Completion of the most recent step, if any
    pub fn last_completion(&self) -> Option<&WorkflowCompletion> {
        self.completions.last()
    }
}

/// WorkflowOutput repository for database operations
pub struct WorkflowOutputRepository {
    pool: SqlitePool,
}

impl WorkflowOutputRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, id: &str, workflow_id: &str, row_index: usize) -> Result<WorkflowOutput> {
        let now = now_millis()?;

        sqlx::query(
            "INSERT INTO workflow_outputs (id, workflow_id, row_index, loading, rating, created_at, updated_at) VALUES (?, ?, ?, 1, 'none', ?, ?)",
        )
        .bind(id)
        .bind(workflow_id)
        .bind(row_index as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create workflow output")?;

        Ok(WorkflowOutput {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            row_index,
            completions: vec![],
            loading: true,
            error: None,
            rating: Rating::Unrated,
            content_hash: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Create the lanes of a workflow run as (id, row) pairs, all or none
    pub async fn create_many(&self, lanes: &[(String, usize)], workflow_id: &str) -> Result<()> {
        let now = now_millis()?;
        let mut tx = self.pool.begin().await?;

        for (id, row_index) in lanes {
            sqlx::query(
                "INSERT INTO workflow_outputs (id, workflow_id, row_index, loading, rating, created_at, updated_at) VALUES (?, ?, ?, 1, 'none', ?, ?)",
            )
            .bind(id)
            .bind(workflow_id)
            .bind(*row_index as i64)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to create workflow output")?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Append a step completion to a loading lane
    ///
    /// Returns `false` if the lane is gone or already terminal.
    pub async fn append_completion(&self, id: &str, completion: &WorkflowCompletion) -> Result<bool> {
        let now = now_millis()?;

        let result = sqlx::query(
            "INSERT INTO workflow_completions (workflow_output_id, chain_id, chain_name, model_id, content, error, token_usage, created_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM workflow_outputs WHERE id = ? AND loading = 1)",
        )
        .bind(id)
        .bind(&completion.chain_id)
        .bind(&completion.chain_name)
        .bind(&completion.model_id)
        .bind(&completion.content)
        .bind(&completion.error)
        .bind(encode_usage(completion.token_usage)?)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to append workflow completion")?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a lane terminal
    ///
    /// `final_content` is the last step's content and feeds the content hash.
    pub async fn finish(&self, id: &str, error: Option<&str>, final_content: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_outputs SET loading = 0, error = ?, content_hash = ?, updated_at = ? WHERE id = ? AND loading = 1",
        )
        .bind(error)
        .bind(final_content.map(content_hash))
        .bind(now_millis()?)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to finalize workflow output")?;

        Ok(result.rows_affected() > 0)
    }

    /// Force-finalize every in-flight lane with `error`
    pub async fn interrupt_loading(&self, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE workflow_outputs SET loading = 0, error = ?, updated_at = ? WHERE loading = 1",
        )
        .bind(error)
        .bind(now_millis()?)
        .execute(&self.pool)
        .await
        .context("Failed to interrupt loading workflow outputs")?;

        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowOutput>> {
        let row = sqlx::query(
            "SELECT id, workflow_id, row_index, loading, error, rating, content_hash, created_at, updated_at FROM workflow_outputs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch workflow output")?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// All lanes of a workflow, newest first
    pub async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<WorkflowOutput>> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, row_index, loading, error, rating, content_hash, created_at, updated_at FROM workflow_outputs WHERE workflow_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workflow outputs")?;

        let mut outputs = Vec::with_capacity(rows.len());
        for row in rows {
            outputs.push(self.hydrate(row).await?);
        }
        Ok(outputs)
    }

    pub async fn count_loading(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM workflow_outputs WHERE loading = 1")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count loading workflow outputs")
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_outputs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete workflow output")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn rate(&self, id: &str, rating: Rating) -> Result<bool> {
        let result =
            sqlx::query("UPDATE workflow_outputs SET rating = ?, updated_at = ? WHERE id = ?")
                .bind(rating.as_str())
                .bind(now_millis()?)
                .bind(id)
                .execute(&self.pool)
                .await
                .context("Failed to rate workflow output")?;

        Ok(result.rows_affected() > 0)
    }

    async fn hydrate(&self, row: SqliteRow) -> Result<WorkflowOutput> {
        let id: String = row.get("id");

        let completions = sqlx::query(
            "SELECT chain_id, chain_name, model_id, content, error, token_usage FROM workflow_completions WHERE workflow_output_id = ? ORDER BY id ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch workflow completions")?
        .into_iter()
        .map(|r| WorkflowCompletion {
            chain_id: r.get("chain_id"),
            chain_name: r.get("chain_name"),
            model_id: r.get("model_id"),
            content: r.get("content"),
            error: r.get("error"),
            token_usage: decode_usage(r.get("token_usage")),
        })
        .collect();

        Ok(WorkflowOutput {
            id,
            workflow_id: row.get("workflow_id"),
            row_index: row.get::<i64, _>("row_index").max(0) as usize,
            completions,
            loading: row.get::<i64, _>("loading") != 0,
            error: row.get("error"),
            rating: parse_rating(&row.get::<String, _>("rating")),
            content_hash: row.get("content_hash"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn step(chain: &str, content: &str) -> WorkflowCompletion {
        WorkflowCompletion {
            chain_id: chain.to_string(),
            chain_name: chain.to_uppercase(),
            model_id: "gpt".to_string(),
            content: Some(content.to_string()),
            error: None,
            token_usage: Some(TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 4,
                total_tokens: 7,
            }),
        }
    }

    #[tokio::test]
    async fn test_create_many_lanes() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.workflow_outputs();

        let lanes = vec![("l1".to_string(), 0), ("l2".to_string(), 1)];
        repo.create_many(&lanes, "w1").await.unwrap();
        let lane = repo.get("l2").await.unwrap().unwrap();
        assert!(lane.loading);
        assert_eq!(lane.row_index, 1);

        let clash = vec![("l3".to_string(), 2), ("l1".to_string(), 0)];
        assert!(repo.create_many(&clash, "w1").await.is_err());
        assert!(repo.get("l3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lane_accumulates_until_finished() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.workflow_outputs();

        repo.create("lane-1", "wf-1", 2).await.unwrap();
        assert!(repo.append_completion("lane-1", &step("a", "one")).await.unwrap());
        assert!(repo.append_completion("lane-1", &step("b", "two")).await.unwrap());
        assert!(repo.finish("lane-1", None, Some("two")).await.unwrap());

        // Terminal lanes accept nothing further
        assert!(!repo.append_completion("lane-1", &step("c", "three")).await.unwrap());
        assert!(!repo.finish("lane-1", Some("again"), None).await.unwrap());

        let lane = repo.get("lane-1").await.unwrap().unwrap();
        assert!(!lane.loading);
        assert_eq!(lane.row_index, 2);
        assert_eq!(lane.completions.len(), 2);
        assert_eq!(lane.last_completion().unwrap().chain_name, "B");
        assert_eq!(lane.content_hash, Some(content_hash("two")));
        assert_eq!(lane.completions[0].token_usage.unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn test_interrupt_loading_lanes() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.workflow_outputs();

        repo.create("lane-1", "wf-1", 0).await.unwrap();
        repo.create("lane-2", "wf-1", 1).await.unwrap();

        assert_eq!(repo.interrupt_loading("Interrupted").await.unwrap(), 2);
        assert_eq!(repo.interrupt_loading("Interrupted").await.unwrap(), 0);
        assert_eq!(repo.count_loading().await.unwrap(), 0);
    }
}
