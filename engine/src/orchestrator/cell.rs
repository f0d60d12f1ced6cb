//! Run-matrix cells and connector request assembly

use crate::db::{Database, ModelSelection};
use crate::runtime::normalize::normalize_map;
use crate::runtime::ConnectorLoader;
use sdk::errors::EngineError;
use sdk::{RunRequest, RunResponse, SchemaField};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// Record a cell's result is applied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellTarget {
    /// An Output of a chain run
    Output { output_id: String },
    /// A workflow lane at one of its steps
    Lane {
        lane_id: String,
        workflow_id: String,
        row_index: usize,
        step: usize,
        /// Position of the cell's model among the step's runnable models
        slot: usize,
    },
}

impl CellTarget {
    /// Id of the Output or WorkflowOutput this cell finalizes
    pub fn record_id(&self) -> &str {
        match self {
            CellTarget::Output { output_id } => output_id,
            CellTarget::Lane { lane_id, .. } => lane_id,
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            CellTarget::Output { .. } => None,
            CellTarget::Lane { workflow_id, .. } => Some(workflow_id),
        }
    }
}

/// Everything about a cell except its request payload
#[derive(Debug, Clone)]
pub struct CellMeta {
    pub target: CellTarget,
    pub chain_id: String,
    pub chain_name: String,
    pub connector_id: String,
    pub model_id: String,
}

/// A cell ready to dispatch
#[derive(Debug, Clone)]
pub struct CellPlan {
    pub meta: CellMeta,
    pub request: RunRequest,
}

/// A dispatched cell's outcome, sent back to the coordination loop
#[derive(Debug)]
pub struct CellResult {
    pub meta: CellMeta,
    pub response: RunResponse,
}

/// Builds typed connector requests, caching schemas and settings per run
pub struct RequestBuilder<'a> {
    loader: &'a ConnectorLoader,
    db: &'a Database,
    schemas: HashMap<String, Option<(Vec<SchemaField>, Vec<SchemaField>)>>,
    settings: HashMap<String, Map<String, Value>>,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(loader: &'a ConnectorLoader, db: &'a Database) -> Self {
        Self {
            loader,
            db,
            schemas: HashMap::new(),
            settings: HashMap::new(),
        }
    }

    /// Request for `selection` with normalized properties and settings
    ///
    /// When the connector cannot describe itself the values are passed
    /// through unnormalized; the call itself will report the failure.
    pub async fn build(
        &mut self,
        selection: &ModelSelection,
        prompts: Vec<String>,
    ) -> Result<RunRequest, EngineError> {
        let connector_id = selection.connector_id.as_str();

        if !self.schemas.contains_key(connector_id) {
            let schemas = match self.loader.describe(connector_id).await {
                Ok(d) => Some((d.properties_schema, d.settings_schema)),
                Err(e) => {
                    warn!("No schema for connector '{}': {}", connector_id, e);
                    None
                }
            };
            self.schemas.insert(connector_id.to_string(), schemas);
        }

        if !self.settings.contains_key(connector_id) {
            let saved = self
                .db
                .connector_settings()
                .settings_for(connector_id)
                .await
                .map_err(|e| EngineError::Database(e.to_string()))?;
            self.settings.insert(connector_id.to_string(), saved);
        }

        let saved = self.settings.get(connector_id).cloned().unwrap_or_default();
        let (properties, settings) = match self.schemas.get(connector_id).and_then(Option::as_ref) {
            Some((properties_schema, settings_schema)) => (
                normalize_map(&selection.properties, properties_schema),
                normalize_map(&saved, settings_schema),
            ),
            None => (selection.properties.clone(), saved),
        };

        Ok(RunRequest {
            model: selection.model_id.clone(),
            prompts,
            properties,
            settings,
        })
    }
}
