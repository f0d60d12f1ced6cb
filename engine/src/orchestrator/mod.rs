//! Execution orchestrator
//!
//! All coordination happens on one tokio task, the coordinator. It owns the
//! running-models table and the in-flight count, creates
//! Output records, dispatches cells and applies their results. Nothing else
//! mutates that state, so none of it sits behind a lock.
//!
//! # Cell lifecycle
//!
//! 1. The coordinator creates the run's Outputs (`loading = 1`) together,
//!    once every request is built, or reuses the workflow lane. It registers
//!    the model as running and spawns a task.
//! 2. The task waits for a concurrency permit when a cap is configured, calls
//!    the connector on the blocking pool and sends the response back.
//! 3. The coordinator applies the result with a conditional update, so each
//!    record is finalized exactly once. Lane results go to the
//!    [`Sequencer`](crate::sequencer::Sequencer), which may hand back the
//!    cells of the lane's next step.
//!
//! Cells never wait on each other. Mid-flight cancellation is not offered;
//! the tokens exist so shutdown can stop every task at once. Results already
//! received when the loop stops are still applied. Records whose task was
//! stopped stay loading and are recovered on the next start.

pub mod cell;
pub mod matrix;
pub mod recovery;

pub use cell::{CellMeta, CellPlan, CellResult, CellTarget, RequestBuilder};
pub use matrix::RunMatrix;
pub use recovery::{recover_interrupted, RecoveryReport};

use crate::db::{Completion, Database, Dataset, ModelSelection, PromptFragment};
use crate::message_bus::{Event, MessageBus, OutputEvent};
use crate::runtime::ConnectorLoader;
use crate::sequencer::Sequencer;
use crate::template::DatasetIndex;
use sdk::errors::EngineError;
use sdk::RunResponse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared services the coordinator works with
#[derive(Clone)]
pub struct OrchestratorContext {
    pub db: Database,
    pub loader: Arc<ConnectorLoader>,
    pub bus: Arc<MessageBus>,
    /// Upper bound on concurrent connector calls, `None` for unlimited
    pub max_concurrent_calls: Option<usize>,
    /// Placed between a workflow step's context and the next prompts
    pub context_separator: String,
}

/// Input to a chain run
#[derive(Debug, Clone, Default)]
pub struct ChainRun {
    pub chain_id: String,
    pub models: Vec<ModelSelection>,
    pub fragments: Vec<PromptFragment>,
    pub variables: HashMap<String, String>,
    /// Datasets `[[Dataset.Column]]` links may refer to
    pub datasets: Vec<Dataset>,
}

enum Command {
    RunChain {
        run: ChainRun,
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
    RunWorkflow {
        workflow_id: String,
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
    RunningModels {
        chain_id: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    InFlight {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the coordination loop
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
}

impl Orchestrator {
    /// Start the coordination loop
    ///
    /// Run [`recover_interrupted`] before this so recovery cannot touch
    /// records the new loop creates.
    pub fn spawn(ctx: OrchestratorContext) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(ctx);
        let handle = tokio::spawn(coordinator.run(commands_rx));
        (
            Self {
                commands: commands_tx,
            },
            handle,
        )
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| EngineError::Runtime("orchestrator is not running".to_string()))?;
        rx.await
            .map_err(|_| EngineError::Runtime("orchestrator stopped before replying".to_string()))
    }

    /// Create and dispatch one Output per run-matrix cell
    ///
    /// Returns the Output ids once every cell is dispatched. Results arrive
    /// later as [`Event::OutputFinished`].
    pub async fn run_chain(&self, run: ChainRun) -> Result<Vec<String>, EngineError> {
        self.request(|reply| Command::RunChain { run, reply }).await?
    }

    /// Start a workflow; returns one WorkflowOutput id per lane
    pub async fn run_workflow(&self, workflow_id: &str) -> Result<Vec<String>, EngineError> {
        let workflow_id = workflow_id.to_string();
        self.request(|reply| Command::RunWorkflow { workflow_id, reply })
            .await?
    }

    /// Models with cells in flight for a chain
    pub async fn running_models(&self, chain_id: &str) -> Result<Vec<String>, EngineError> {
        let chain_id = chain_id.to_string();
        self.request(|reply| Command::RunningModels { chain_id, reply })
            .await
    }

    /// Number of dispatched cells that have not reported back
    pub async fn in_flight(&self) -> Result<usize, EngineError> {
        self.request(|reply| Command::InFlight { reply }).await
    }

    /// Cancel every in-flight cell and stop the loop
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("Orchestrator already stopped");
        }
    }
}

struct Coordinator {
    ctx: OrchestratorContext,
    sequencer: Sequencer,
    limiter: Option<Arc<Semaphore>>,
    results_tx: mpsc::UnboundedSender<CellResult>,
    results_rx: mpsc::UnboundedReceiver<CellResult>,
    shutdown: CancellationToken,
    /// chain id -> model id -> cells in flight
    running: HashMap<String, HashMap<String, usize>>,
    /// Dispatched cells that have not reported back
    in_flight: usize,
}

impl Coordinator {
    fn new(ctx: OrchestratorContext) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let sequencer = Sequencer::new(
            ctx.db.clone(),
            Arc::clone(&ctx.loader),
            Arc::clone(&ctx.bus),
            ctx.context_separator.clone(),
        );
        let limiter = ctx
            .max_concurrent_calls
            .map(|n| Arc::new(Semaphore::new(n)));

        Self {
            ctx,
            sequencer,
            limiter,
            results_tx,
            results_rx,
            shutdown: CancellationToken::new(),
            running: HashMap::new(),
            in_flight: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Orchestrator started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(result) = self.results_rx.recv() => self.finish_cell(result).await,
            }
        }

        info!("Orchestrator stopped");
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();

        while let Ok(result) = self.results_rx.try_recv() {
            self.finish_cell(result).await;
        }

        if self.in_flight > 0 {
            warn!(
                "Stopping with {} cells in flight; they will be recovered on next start",
                self.in_flight
            );
        }
        self.in_flight = 0;
        self.running.clear();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::RunChain { run, reply } => {
                let result = self.run_chain(run).await;
                let _ = reply.send(result);
            }
            Command::RunWorkflow { workflow_id, reply } => {
                let result = self.run_workflow(&workflow_id).await;
                let _ = reply.send(result);
            }
            Command::RunningModels { chain_id, reply } => {
                let mut models: Vec<String> = self
                    .running
                    .get(&chain_id)
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                models.sort();
                let _ = reply.send(models);
            }
            Command::InFlight { reply } => {
                let _ = reply.send(self.in_flight);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn run_chain(&mut self, run: ChainRun) -> Result<Vec<String>, EngineError> {
        let db = self.ctx.db.clone();
        let loader = Arc::clone(&self.ctx.loader);

        let index = DatasetIndex::new(run.datasets);
        let matrix = RunMatrix::build(&run.fragments, &run.models, &run.variables, &index);
        info!(
            "Running chain '{}': {} models x {} rows",
            run.chain_id,
            matrix.models().len(),
            matrix.rows()
        );

        let chain_name = db
            .chains()
            .get(&run.chain_id)
            .await
            .map_err(db_error)?
            .map(|c| c.name)
            .unwrap_or_else(|| run.chain_id.clone());

        let mut builder = RequestBuilder::new(&loader, &db);
        let mut plans = Vec::with_capacity(matrix.len());

        for (model, row) in matrix.cells() {
            let request = builder
                .build(model, matrix.prompts_for_row(row, &index))
                .await?;

            plans.push(CellPlan {
                meta: CellMeta {
                    target: CellTarget::Output {
                        output_id: Uuid::new_v4().to_string(),
                    },
                    chain_id: run.chain_id.clone(),
                    chain_name: chain_name.clone(),
                    connector_id: model.connector_id.clone(),
                    model_id: model.model_id.clone(),
                },
                request,
            });
        }

        let output_ids: Vec<String> = plans
            .iter()
            .map(|plan| plan.meta.target.record_id().to_string())
            .collect();
        db.outputs()
            .create_many(&output_ids, &run.chain_id)
            .await
            .map_err(db_error)?;

        for plan in plans {
            self.dispatch(plan).await;
        }

        Ok(output_ids)
    }

    async fn run_workflow(&mut self, workflow_id: &str) -> Result<Vec<String>, EngineError> {
        let plans = self.sequencer.start(workflow_id).await?;
        let lane_ids = plans
            .iter()
            .map(|p| p.meta.target.record_id().to_string())
            .collect();

        for plan in plans {
            self.dispatch(plan).await;
        }

        Ok(lane_ids)
    }

    async fn dispatch(&mut self, plan: CellPlan) {
        let CellPlan { meta, request } = plan;

        if self.shutdown.is_cancelled() {
            debug!(
                output_id = meta.target.record_id(),
                "Not dispatching after shutdown; the record stays loading"
            );
            return;
        }

        *self
            .running
            .entry(meta.chain_id.clone())
            .or_default()
            .entry(meta.model_id.clone())
            .or_insert(0) += 1;

        let token = self.shutdown.child_token();
        self.in_flight += 1;

        self.ctx
            .bus
            .publish(Event::OutputCreated {
                output_id: meta.target.record_id().to_string(),
                chain_id: meta.chain_id.clone(),
                model_id: meta.model_id.clone(),
                workflow_id: meta.target.workflow_id().map(str::to_string),
            })
            .await;

        debug!(
            output_id = meta.target.record_id(),
            connector = %meta.connector_id,
            model = %meta.model_id,
            "Dispatching cell"
        );

        let loader = Arc::clone(&self.ctx.loader);
        let limiter = self.limiter.clone();
        let results = self.results_tx.clone();
        let connector_id = meta.connector_id.clone();

        tokio::spawn(async move {
            let response = tokio::select! {
                _ = token.cancelled() => {
                    debug!(output_id = meta.target.record_id(), "Cell cancelled");
                    return;
                }
                response = call_connector(loader, limiter, connector_id, request) => response,
            };

            let _ = results.send(CellResult { meta, response });
        });
    }

    fn release(&mut self, meta: &CellMeta) {
        self.in_flight = self.in_flight.saturating_sub(1);

        if let Some(models) = self.running.get_mut(&meta.chain_id) {
            if let Some(count) = models.get_mut(&meta.model_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    models.remove(&meta.model_id);
                }
            }
            if models.is_empty() {
                self.running.remove(&meta.chain_id);
            }
        }
    }

    async fn finish_cell(&mut self, result: CellResult) {
        self.release(&result.meta);

        if let Some(error) = &result.response.error {
            self.ctx
                .bus
                .publish(Event::ConnectorFailed {
                    connector_id: result.meta.connector_id.clone(),
                    model_id: result.meta.model_id.clone(),
                    error: error.clone(),
                })
                .await;
        }

        match &result.meta.target {
            CellTarget::Output { output_id } => self.finish_output(output_id, &result).await,
            CellTarget::Lane { .. } => {
                for next in self.sequencer.on_step_finished(&result).await {
                    self.dispatch(next).await;
                }
            }
        }
    }

    async fn finish_output(&self, output_id: &str, result: &CellResult) {
        let response = &result.response;
        let completion = Completion {
            model_id: result.meta.model_id.clone(),
            content: response.content.clone(),
            error: response.error.clone(),
            token_usage: response.token_usage,
        };

        match self.ctx.db.outputs().finish(output_id, &completion).await {
            Ok(true) => {
                debug!(output_id, failed = response.is_failure(), "Output finalized");
                self.ctx
                    .bus
                    .publish(Event::OutputFinished(OutputEvent {
                        output_id: output_id.to_string(),
                        chain_id: result.meta.chain_id.clone(),
                        model_id: result.meta.model_id.clone(),
                        workflow_id: None,
                        content: completion.content,
                        error: completion.error,
                        token_usage: completion.token_usage,
                    }))
                    .await;
            }
            Ok(false) => debug!(output_id, "Discarding result: output deleted or already final"),
            Err(e) => error!(output_id, "Failed to finalize output: {:#}", e),
        }
    }
}

async fn call_connector(
    loader: Arc<ConnectorLoader>,
    limiter: Option<Arc<Semaphore>>,
    connector_id: String,
    request: sdk::RunRequest,
) -> RunResponse {
    let _permit = match limiter {
        Some(semaphore) => match semaphore.acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                return RunResponse::failure(request.model, "dispatch limiter closed");
            }
        },
        None => None,
    };

    loader.run(&connector_id, request).await
}

pub(crate) fn db_error(e: anyhow::Error) -> EngineError {
    EngineError::Database(format!("{:#}", e))
}
