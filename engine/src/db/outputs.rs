/// Output persistence
///
/// An Output is the result record for one (model, dataset row) cell of a
/// chain run. It is created with `loading = 1` before dispatch and finalized
/// exactly once: every terminal update is conditional on `loading = 1`, so a
/// second finalization (or a late result after recovery) changes nothing.
use anyhow::{Context, Result};
use sdk::{RunResponse, TokenUsage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::now_millis;

/// SHA-256 hex digest of completion content
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// User feedback on an Output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Like,
    Dislike,
    #[default]
    #[serde(rename = "none")]
    Unrated,
}

impl Rating {
    pub fn as_str(&self) -> &str {
        match self {
            Rating::Like => "like",
            Rating::Dislike => "dislike",
            Rating::Unrated => "none",
        }
    }
}

impl FromStr for Rating {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "like" => Ok(Rating::Like),
            "dislike" => Ok(Rating::Dislike),
            "none" => Ok(Rating::Unrated),
            other => anyhow::bail!("unknown rating '{}'", other),
        }
    }
}

/// One model response recorded on an Output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub model_id: String,
    pub content: Option<String>,
    pub error: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl Completion {
    pub fn from_response(response: &RunResponse) -> Self {
        Self {
            model_id: response.model.clone(),
            content: response.content.clone(),
            error: response.error.clone(),
            token_usage: response.token_usage,
        }
    }

    pub fn failed(model_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            content: None,
            error: Some(error.into()),
            token_usage: None,
        }
    }
}

/// Output record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub id: String,
    pub chain_id: String,
    pub completions: Vec<Completion>,
    pub loading: bool,
    pub error: Option<String>,
    pub rating: Rating,
    pub content_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub(crate) fn encode_usage(usage: Option<TokenUsage>) -> Result<Option<String>> {
    usage
        .map(|u| serde_json::to_string(&u))
        .transpose()
        .context("Failed to encode token usage")
}

pub(crate) fn decode_usage(raw: Option<String>) -> Option<TokenUsage> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn parse_rating(raw: &str) -> Rating {
    raw.parse().unwrap_or_default()
}

/// Output repository for database operations
pub struct OutputRepository {
    pool: SqlitePool,
}

impl OutputRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an in-flight Output
    pub async fn create(&self, id: &str, chain_id: &str) -> Result<Output> {
        let now = now_millis()?;

        sqlx::query(
            "INSERT INTO outputs (id, chain_id, loading, rating, created_at, updated_at) VALUES (?, ?, 1, 'none', ?, ?)",
        )
        .bind(id)
        .bind(chain_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create output")?;

        Ok(Output {
            id: id.to_string(),
            chain_id: chain_id.to_string(),
            completions: vec![],
            loading: true,
            error: None,
            rating: Rating::Unrated,
            content_hash: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Create several in-flight Outputs of one chain, all or none
    pub async fn create_many(&self, ids: &[String], chain_id: &str) -> Result<()> {
        let now = now_millis()?;
        let mut tx = self.pool.begin().await?;

        for id in ids {
            sqlx::query(
                "INSERT INTO outputs (id, chain_id, loading, rating, created_at, updated_at) VALUES (?, ?, 1, 'none', ?, ?)",
            )
            .bind(id)
            .bind(chain_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to create output")?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Apply the terminal event for an Output
    ///
    /// Returns `false` without writing anything if the Output no longer
    /// exists or was already finalized.
    pub async fn finish(&self, id: &str, completion: &Completion) -> Result<bool> {
        let now = now_millis()?;
        let hash = completion.content.as_deref().map(content_hash);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE outputs SET loading = 0, error = ?, content_hash = ?, updated_at = ? WHERE id = ? AND loading = 1",
        )
        .bind(&completion.error)
        .bind(&hash)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to finalize output")?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO output_completions (output_id, model_id, content, error, token_usage, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&completion.model_id)
        .bind(&completion.content)
        .bind(&completion.error)
        .bind(encode_usage(completion.token_usage)?)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to record completion")?;

        tx.commit().await?;
        Ok(true)
    }

    /// Force-finalize every in-flight Output with `error`
    ///
    /// Returns the number of Outputs changed. Running it again returns 0.
    pub async fn interrupt_loading(&self, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outputs SET loading = 0, error = ?, updated_at = ? WHERE loading = 1",
        )
        .bind(error)
        .bind(now_millis()?)
        .execute(&self.pool)
        .await
        .context("Failed to interrupt loading outputs")?;

        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Output>> {
        let row = sqlx::query(
            "SELECT id, chain_id, loading, error, rating, content_hash, created_at, updated_at FROM outputs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch output")?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// All Outputs of a chain, newest first
    pub async fn list_for_chain(&self, chain_id: &str) -> Result<Vec<Output>> {
        let rows = sqlx::query(
            "SELECT id, chain_id, loading, error, rating, content_hash, created_at, updated_at FROM outputs WHERE chain_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list outputs")?;

        let mut outputs = Vec::with_capacity(rows.len());
        for row in rows {
            outputs.push(self.hydrate(row).await?);
        }
        Ok(outputs)
    }

    pub async fn count_loading(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM outputs WHERE loading = 1")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count loading outputs")
    }

    /// Delete an Output and its completions
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outputs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete output")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn rate(&self, id: &str, rating: Rating) -> Result<bool> {
        let result = sqlx::query("UPDATE outputs SET rating = ?, updated_at = ? WHERE id = ?")
            .bind(rating.as_str())
            .bind(now_millis()?)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to rate output")?;

        Ok(result.rows_affected() > 0)
    }

    async fn hydrate(&self, row: SqliteRow) -> Result<Output> {
        let id: String = row.get("id");

        let completions = sqlx::query(
            "SELECT model_id, content, error, token_usage FROM output_completions WHERE output_id = ? ORDER BY id ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch completions")?
        .into_iter()
        .map(|r| Completion {
            model_id: r.get("model_id"),
            content: r.get("content"),
            error: r.get("error"),
            token_usage: decode_usage(r.get("token_usage")),
        })
        .collect();

        Ok(Output {
            id,
            chain_id: row.get("chain_id"),
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

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_create_many_is_all_or_nothing() {
        let (_temp, db) = setup().await;
        let repo = db.outputs();

        let ids = vec!["a".to_string(), "b".to_string()];
        repo.create_many(&ids, "chain-1").await.unwrap();
        assert_eq!(repo.count_loading().await.unwrap(), 2);

        // "b" already exists, so "c" must not be kept either
        let clash = vec!["c".to_string(), "b".to_string()];
        assert!(repo.create_many(&clash, "chain-1").await.is_err());
        assert!(repo.get("c").await.unwrap().is_none());
        assert_eq!(repo.count_loading().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_finish_applies_once() {
        let (_temp, db) = setup().await;
        let repo = db.outputs();
        repo.create("out-1", "chain-1").await.unwrap();

        let first = Completion::from_response(&RunResponse::success("gpt", "hello"));
        let second = Completion::failed("gpt", "late");

        assert!(repo.finish("out-1", &first).await.unwrap());
        assert!(!repo.finish("out-1", &second).await.unwrap());

        let output = repo.get("out-1").await.unwrap().unwrap();
        assert!(!output.loading);
        assert_eq!(output.completions, vec![first]);
        assert_eq!(output.content_hash, Some(content_hash("hello")));
        assert!(output.error.is_none());
    }

    #[tokio::test]
    async fn test_finish_deleted_output_is_discarded() {
        let (_temp, db) = setup().await;
        let repo = db.outputs();
        repo.create("out-1", "chain-1").await.unwrap();
        assert!(repo.delete("out-1").await.unwrap());

        let completion = Completion::from_response(&RunResponse::success("gpt", "hi"));
        assert!(!repo.finish("out-1", &completion).await.unwrap());
        assert!(repo.get("out-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupt_loading_is_idempotent() {
        let (_temp, db) = setup().await;
        let repo = db.outputs();
        for i in 0..3 {
            repo.create(&format!("out-{}", i), "chain-1").await.unwrap();
        }
        repo.finish("out-0", &Completion::failed("gpt", "boom"))
            .await
            .unwrap();

        assert_eq!(repo.interrupt_loading("Interrupted").await.unwrap(), 2);
        assert_eq!(repo.interrupt_loading("Interrupted").await.unwrap(), 0);
        assert_eq!(repo.count_loading().await.unwrap(), 0);

        let output = repo.get("out-1").await.unwrap().unwrap();
        assert_eq!(output.error.as_deref(), Some("Interrupted"));
    }

    #[tokio::test]
    async fn test_list_newest_first_and_rate() {
        let (_temp, db) = setup().await;
        let repo = db.outputs();
        repo.create("a", "chain-1").await.unwrap();
        repo.create("b", "chain-1").await.unwrap();
        repo.create("c", "chain-2").await.unwrap();

        let ids: Vec<String> = repo
            .list_for_chain("chain-1")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert!(repo.rate("a", Rating::Dislike).await.unwrap());
        assert_eq!(repo.get("a").await.unwrap().unwrap().rating, Rating::Dislike);
        assert!(!repo.rate("missing", Rating::Like).await.unwrap());
    }

    #[test]
    fn test_rating_parse() {
        assert_eq!("like".parse::<Rating>().unwrap(), Rating::Like);
        assert_eq!("none".parse::<Rating>().unwrap(), Rating::Unrated);
        assert!("meh".parse::<Rating>().is_err());
    }
}
