//! Workflow sequencer
//!
//! A workflow run starts by fanning its first chain out over the full run
//! matrix, one WorkflowOutput ("lane") per cell. After that each lane moves
//! on by itself. Every later step dispatches one cell per runnable model of
//! that step's chain, all rendered at the lane's dataset row and all
//! appending their completion to the lane.
//!
//! A lane advances once every cell of its current step has reported. The
//! first error ends the lane; results still arriving for it are discarded.
//! The content handed on as context, and kept as the lane's final content,
//! is that of the step's first runnable model. Variables take the workflow's
//! override values.
//!
//! The sequencer only plans. It is called from the orchestrator's
//! coordination loop, which dispatches whatever it returns, so step N+1 can
//! never be dispatched before step N is terminal.

use crate::db::variables::bindings;
use crate::db::{Chain, Database, WorkflowCompletion};
use crate::message_bus::{Event, MessageBus, OutputEvent};
use crate::orchestrator::{db_error, CellMeta, CellPlan, CellResult, CellTarget, RequestBuilder, RunMatrix};
use crate::runtime::ConnectorLoader;
use crate::template::DatasetIndex;
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Cells of a lane's current step still to report
struct StepProgress {
    step: usize,
    pending: usize,
    /// Content of each cell, by model position
    contents: Vec<Option<String>>,
}

impl StepProgress {
    fn new(step: usize, cells: usize) -> Self {
        Self {
            step,
            pending: cells,
            contents: vec![None; cells],
        }
    }
}

/// Plans workflow lanes and their successive steps
pub struct Sequencer {
    db: Database,
    loader: Arc<ConnectorLoader>,
    bus: Arc<MessageBus>,
    separator: String,
    /// lane id -> progress of its current step
    steps: HashMap<String, StepProgress>,
}

impl Sequencer {
    pub fn new(
        db: Database,
        loader: Arc<ConnectorLoader>,
        bus: Arc<MessageBus>,
        separator: String,
    ) -> Self {
        Self {
            db,
            loader,
            bus,
            separator,
            steps: HashMap::new(),
        }
    }

    async fn load_chain(&self, chain_id: &str) -> Result<Chain, EngineError> {
        self.db
            .chains()
            .get(chain_id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("chain '{}'", chain_id)))
    }

    async fn run_inputs(
        &self,
        workflow_id: &str,
    ) -> Result<(HashMap<String, String>, DatasetIndex), EngineError> {
        let variables = self.db.variables().list().await.map_err(db_error)?;
        let datasets = self.db.datasets().list().await.map_err(db_error)?;
        Ok((
            bindings(&variables, Some(workflow_id)),
            DatasetIndex::new(datasets),
        ))
    }

    /// Create one lane per cell of the first chain's run matrix
    ///
    /// Every request is built before any lane is stored, and the lanes are
    /// stored together, so a failure leaves no lane behind.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the workflow, or its first chain, does not exist
    /// - `NoRunnableModel` if the first chain has no model to run
    pub async fn start(&mut self, workflow_id: &str) -> Result<Vec<CellPlan>, EngineError> {
        let workflow = self
            .db
            .workflows()
            .get(workflow_id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{}'", workflow_id)))?;

        let first_id = workflow
            .chain_at(0)
            .ok_or_else(|| EngineError::NotFound(format!("chains of workflow '{}'", workflow_id)))?;
        let chain = self.load_chain(first_id).await?;

        let (variables, index) = self.run_inputs(workflow_id).await?;
        let matrix = RunMatrix::build(&chain.fragments, &chain.models, &variables, &index);
        if matrix.is_empty() {
            return Err(EngineError::NoRunnableModel(chain.name));
        }

        info!(
            "Starting workflow '{}' with {} lanes",
            workflow.name,
            matrix.len()
        );

        let mut builder = RequestBuilder::new(&self.loader, &self.db);
        let mut plans = Vec::with_capacity(matrix.len());

        for (model, row) in matrix.cells() {
            let request = builder
                .build(model, matrix.prompts_for_row(row, &index))
                .await?;

            plans.push(CellPlan {
                meta: CellMeta {
                    target: CellTarget::Lane {
                        lane_id: Uuid::new_v4().to_string(),
                        workflow_id: workflow_id.to_string(),
                        row_index: row,
                        step: 0,
                        slot: 0,
                    },
                    chain_id: chain.id.clone(),
                    chain_name: chain.name.clone(),
                    connector_id: model.connector_id.clone(),
                    model_id: model.model_id.clone(),
                },
                request,
            });
        }

        let lanes: Vec<(String, usize)> = plans
            .iter()
            .filter_map(|plan| match &plan.meta.target {
                CellTarget::Lane {
                    lane_id, row_index, ..
                } => Some((lane_id.clone(), *row_index)),
                CellTarget::Output { .. } => None,
            })
            .collect();
        self.db
            .workflow_outputs()
            .create_many(&lanes, workflow_id)
            .await
            .map_err(db_error)?;

        for (lane_id, _) in lanes {
            self.steps.insert(lane_id, StepProgress::new(0, 1));
        }

        Ok(plans)
    }

    /// Apply a finished lane cell and plan the lane's next step
    ///
    /// Returns no plans while the step still has cells out, when the lane is
    /// over, or when the result was discarded. Storage failures end the lane
    /// with that error instead of leaving it loading.
    pub async fn on_step_finished(&mut self, result: &CellResult) -> Vec<CellPlan> {
        let CellTarget::Lane {
            lane_id,
            workflow_id,
            row_index,
            step,
            slot,
        } = &result.meta.target
        else {
            return Vec::new();
        };

        match self
            .advance(lane_id, workflow_id, *row_index, *step, *slot, result)
            .await
        {
            Ok(next) => next,
            Err(e) => {
                error!(lane_id = %lane_id, "Workflow step failed: {}", e);
                self.steps.remove(lane_id);
                self.finish(lane_id, workflow_id, Some(e.to_string()), None)
                    .await;
                Vec::new()
            }
        }
    }

    async fn advance(
        &mut self,
        lane_id: &str,
        workflow_id: &str,
        row_index: usize,
        step: usize,
        slot: usize,
        result: &CellResult,
    ) -> Result<Vec<CellPlan>, EngineError> {
        let meta = &result.meta;
        let response = &result.response;

        let completion = WorkflowCompletion {
            chain_id: meta.chain_id.clone(),
            chain_name: meta.chain_name.clone(),
            model_id: meta.model_id.clone(),
            content: response.content.clone(),
            error: response.error.clone(),
            token_usage: response.token_usage,
        };

        let appended = self
            .db
            .workflow_outputs()
            .append_completion(lane_id, &completion)
            .await
            .map_err(db_error)?;
        if !appended {
            debug!(lane_id, "Discarding result: lane deleted or already final");
            self.steps.remove(lane_id);
            return Ok(Vec::new());
        }

        self.bus
            .publish(Event::OutputFinished(OutputEvent {
                output_id: lane_id.to_string(),
                chain_id: meta.chain_id.clone(),
                model_id: meta.model_id.clone(),
                workflow_id: Some(workflow_id.to_string()),
                content: completion.content.clone(),
                error: completion.error.clone(),
                token_usage: completion.token_usage,
            }))
            .await;

        if let Some(error) = &response.error {
            self.steps.remove(lane_id);
            self.finish(lane_id, workflow_id, Some(error.clone()), None)
                .await;
            return Ok(Vec::new());
        }

        let Some(progress) = self.steps.get_mut(lane_id).filter(|p| p.step == step) else {
            debug!(lane_id, step, "No open step for result");
            return Ok(Vec::new());
        };
        if let Some(content) = progress.contents.get_mut(slot) {
            *content = response.content.clone();
        }
        progress.pending = progress.pending.saturating_sub(1);
        if progress.pending > 0 {
            return Ok(Vec::new());
        }

        let context = self
            .steps
            .remove(lane_id)
            .and_then(|p| p.contents.into_iter().next())
            .flatten();

        let workflow = self
            .db
            .workflows()
            .get(workflow_id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{}'", workflow_id)))?;

        let next_step = step + 1;
        let Some(next_id) = workflow.chain_at(next_step) else {
            self.finish(lane_id, workflow_id, None, context).await;
            return Ok(Vec::new());
        };
        let chain = self.load_chain(next_id).await?;

        let (variables, index) = self.run_inputs(workflow_id).await?;
        let matrix = RunMatrix::build(&chain.fragments, &chain.models, &variables, &index);

        if matrix.models().is_empty() {
            let error = EngineError::NoRunnableModel(chain.name.clone()).to_string();
            let failed = WorkflowCompletion {
                chain_id: chain.id.clone(),
                chain_name: chain.name.clone(),
                model_id: String::new(),
                content: None,
                error: Some(error.clone()),
                token_usage: None,
            };
            self.db
                .workflow_outputs()
                .append_completion(lane_id, &failed)
                .await
                .map_err(db_error)?;
            self.finish(lane_id, workflow_id, Some(error), None).await;
            return Ok(Vec::new());
        }

        let prompts = with_context(
            context.as_deref().unwrap_or_default(),
            matrix.prompts_for_row(row_index, &index),
            &self.separator,
        );

        let mut builder = RequestBuilder::new(&self.loader, &self.db);
        let mut plans = Vec::with_capacity(matrix.models().len());
        for (slot, model) in matrix.models().iter().enumerate() {
            let request = builder.build(model, prompts.clone()).await?;
            plans.push(CellPlan {
                meta: CellMeta {
                    target: CellTarget::Lane {
                        lane_id: lane_id.to_string(),
                        workflow_id: workflow_id.to_string(),
                        row_index,
                        step: next_step,
                        slot,
                    },
                    chain_id: chain.id.clone(),
                    chain_name: chain.name.clone(),
                    connector_id: model.connector_id.clone(),
                    model_id: model.model_id.clone(),
                },
                request,
            });
        }

        debug!(
            lane_id,
            step = next_step,
            chain = %chain.name,
            cells = plans.len(),
            "Advancing workflow lane"
        );
        self.steps
            .insert(lane_id.to_string(), StepProgress::new(next_step, plans.len()));
        self.bus
            .publish(Event::WorkflowAdvanced {
                workflow_output_id: lane_id.to_string(),
                workflow_id: workflow_id.to_string(),
                chain_id: chain.id.clone(),
                step: next_step,
            })
            .await;

        Ok(plans)
    }

    async fn finish(
        &self,
        lane_id: &str,
        workflow_id: &str,
        error: Option<String>,
        final_content: Option<String>,
    ) {
        match self
            .db
            .workflow_outputs()
            .finish(lane_id, error.as_deref(), final_content.as_deref())
            .await
        {
            Ok(true) => {
                info!(lane_id, failed = error.is_some(), "Workflow lane finished");
                self.bus
                    .publish(Event::WorkflowFinished {
                        workflow_output_id: lane_id.to_string(),
                        workflow_id: workflow_id.to_string(),
                        error,
                    })
                    .await;
            }
            Ok(false) => debug!(lane_id, "Lane already final"),
            Err(e) => error!(lane_id, "Failed to finish workflow lane: {:#}", e),
        }
    }
}

/// Prepend a previous step's content to the first prompt
fn with_context(context: &str, mut prompts: Vec<String>, separator: &str) -> Vec<String> {
    if context.is_empty() {
        return prompts;
    }

    match prompts.first_mut() {
        Some(first) => *first = format!("{}{}{}", context, separator, first),
        None => prompts.push(context.to_string()),
    }
    prompts
}
