/// Connector settings persistence
///
/// Saved settings (API keys, endpoints, ...) are passed to a connector on
/// every call. The last dynamic model list fetched for a connector is cached
/// alongside them.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::now_millis;

/// ConnectorSetting record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSetting {
    pub connector_id: String,
    pub settings: Map<String, Value>,
    pub dynamic_models: Vec<String>,
    pub updated_at: i64,
}

/// Connector settings repository for database operations
pub struct ConnectorSettingsRepository {
    pool: SqlitePool,
}

impl ConnectorSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, connector_id: &str) -> Result<Option<ConnectorSetting>> {
        let row = sqlx::query(
            "SELECT connector_id, settings, dynamic_models, updated_at FROM connector_settings WHERE connector_id = ?",
        )
        .bind(connector_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch connector settings")?;

        row.map(setting_from_row).transpose()
    }

    /// Saved settings for a connector, empty when none were saved
    pub async fn settings_for(&self, connector_id: &str) -> Result<Map<String, Value>> {
        Ok(self
            .get(connector_id)
            .await?
            .map(|s| s.settings)
            .unwrap_or_default())
    }

    pub async fn save_settings(&self, connector_id: &str, settings: &Map<String, Value>) -> Result<()> {
        sqlx::query(
            "INSERT INTO connector_settings (connector_id, settings, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(connector_id) DO UPDATE SET settings = excluded.settings, updated_at = excluded.updated_at",
        )
        .bind(connector_id)
        .bind(serde_json::to_string(settings)?)
        .bind(now_millis()?)
        .execute(&self.pool)
        .await
        .context("Failed to save connector settings")?;

        Ok(())
    }

    pub async fn save_dynamic_models(&self, connector_id: &str, models: &[String]) -> Result<()> {
        sqlx::query(
            "INSERT INTO connector_settings (connector_id, dynamic_models, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(connector_id) DO UPDATE SET dynamic_models = excluded.dynamic_models, updated_at = excluded.updated_at",
        )
        .bind(connector_id)
        .bind(serde_json::to_string(models)?)
        .bind(now_millis()?)
        .execute(&self.pool)
        .await
        .context("Failed to save dynamic models")?;

        Ok(())
    }

    pub async fn delete(&self, connector_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM connector_settings WHERE connector_id = ?")
            .bind(connector_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete connector settings")?;

        Ok(result.rows_affected() > 0)
    }
}

fn setting_from_row(row: SqliteRow) -> Result<ConnectorSetting> {
    Ok(ConnectorSetting {
        connector_id: row.get("connector_id"),
        settings: serde_json::from_str(&row.get::<String, _>("settings"))
            .context("Malformed connector settings")?,
        dynamic_models: serde_json::from_str(&row.get::<String, _>("dynamic_models"))
            .context("Malformed dynamic model list")?,
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_settings_and_models_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.connector_settings();

        assert!(repo.settings_for("openai").await.unwrap().is_empty());

        let mut settings = Map::new();
        settings.insert("api_key".into(), json!("sk-test"));
        repo.save_settings("openai", &settings).await.unwrap();
        repo.save_dynamic_models("openai", &["gpt-4o".to_string()])
            .await
            .unwrap();

        let saved = repo.get("openai").await.unwrap().unwrap();
        assert_eq!(saved.settings["api_key"], json!("sk-test"));
        assert_eq!(saved.dynamic_models, vec!["gpt-4o"]);
    }
}
