//! Engine facade
//!
//! [`Engine`] owns the database, the connector loader, the message bus and
//! the orchestrator, and exposes the operations a front end needs: connector
//! management, chain and workflow runs, output bookkeeping and the event
//! stream.
//!
//! Opening an engine takes the data directory's lock and, when it gets it,
//! runs startup recovery before the orchestrator starts, so every Output
//! left loading by a previous process is finalized as interrupted before any
//! new work is dispatched. An engine opened while another one holds the lock
//! skips recovery and leaves the owner's in-flight records alone.

use crate::config::Config;
use crate::db::variables::bindings;
use crate::db::{
    ChainRepository, ConnectorSettingsRepository, Database, DatasetRepository, EngineLock, Output,
    Rating,
    VariableRepository, WorkflowOutput, WorkflowRepository,
};
use crate::message_bus::{Event, EventType, MessageBus};
use crate::orchestrator::{
    db_error, recover_interrupted, ChainRun, Orchestrator, OrchestratorContext, RecoveryReport,
};
use crate::runtime::{ConnectorLoader, ModuleFactory, WasmModuleFactory};
use loom_connectors::{ConnectorRegistry, InstalledPackage};
use sdk::errors::{EngineError, InstallError};
use sdk::ConnectorDescriptor;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running Loom engine
pub struct Engine {
    config: Config,
    db: Database,
    loader: Arc<ConnectorLoader>,
    bus: Arc<MessageBus>,
    orchestrator: Orchestrator,
    coordinator: JoinHandle<()>,
    recovery: RecoveryReport,
    /// `None` when another engine owns the data directory
    lock: Option<EngineLock>,
}

impl Engine {
    /// Open the engine with the WASM connector runtime
    pub async fn open(config: Config) -> Result<Self, EngineError> {
        let factory = Arc::new(WasmModuleFactory::new(
            config.connectors.allowed_hosts.clone(),
        ));
        Self::open_with_factory(config, factory).await
    }

    /// Open the engine loading connectors through `factory`
    pub async fn open_with_factory(
        config: Config,
        factory: Arc<dyn ModuleFactory>,
    ) -> Result<Self, EngineError> {
        let db = Database::new(&config.database_path())
            .await
            .map_err(db_error)?;

        let client = reqwest::Client::builder()
            .user_agent(config.connectors.user_agent.clone())
            .timeout(Duration::from_secs(config.connectors.download_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let registry = Arc::new(ConnectorRegistry::with_client(
            config.connectors.dir.clone(),
            client,
        ));
        let loader = Arc::new(ConnectorLoader::new(registry, factory));
        let bus = Arc::new(MessageBus::new());

        let lock = EngineLock::acquire(&config.core.data_dir)
            .await
            .map_err(db_error)?;
        let recovery = match &lock {
            Some(_) => recover_interrupted(&db).await?,
            None => {
                warn!(
                    "Another engine owns {}; skipping recovery",
                    config.core.data_dir.display()
                );
                RecoveryReport::default()
            }
        };

        let (orchestrator, coordinator) = Orchestrator::spawn(OrchestratorContext {
            db: db.clone(),
            loader: Arc::clone(&loader),
            bus: Arc::clone(&bus),
            max_concurrent_calls: config.orchestrator.max_concurrent_calls,
            context_separator: config.orchestrator.workflow_context_separator.clone(),
        });

        info!("Engine ready (data dir: {})", config.core.data_dir.display());

        Ok(Self {
            config,
            db,
            loader,
            bus,
            orchestrator,
            coordinator,
            recovery,
            lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What startup recovery finalized when this engine was opened
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// Whether this engine holds the data directory lock and ran recovery
    pub fn owns_data_dir(&self) -> bool {
        self.lock.is_some()
    }

    pub fn loader(&self) -> &ConnectorLoader {
        &self.loader
    }

    // ---- connectors ----

    /// Install or upgrade a connector from a release description URL
    ///
    /// The cached handle is dropped so the next call loads the new version.
    pub async fn install(
        &self,
        connector_id: &str,
        release_url: &str,
    ) -> Result<InstalledPackage, InstallError> {
        let installed = self.loader.registry().install(connector_id, release_url).await?;
        self.loader.invalidate(connector_id).await;

        self.bus
            .publish(Event::ConnectorInstalled {
                connector_id: connector_id.to_string(),
                version_tag: installed.version_tag.clone(),
            })
            .await;

        Ok(installed)
    }

    /// Remove a connector package; no-op when it is not installed
    pub async fn uninstall(&self, connector_id: &str) -> Result<(), InstallError> {
        self.loader.registry().uninstall(connector_id).await?;
        self.loader.invalidate(connector_id).await;

        self.bus
            .publish(Event::ConnectorUninstalled {
                connector_id: connector_id.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn list_installed_connectors(&self) -> Result<Vec<ConnectorDescriptor>, EngineError> {
        self.loader.list().await
    }

    /// Live model list of a connector
    ///
    /// A successful listing is saved alongside the connector's settings. When
    /// the connector cannot list models the static list from its
    /// configuration is returned unchanged.
    pub async fn fetch_dynamic_model_list(
        &self,
        connector_id: &str,
        saved_settings: Map<String, Value>,
    ) -> Result<Vec<String>, EngineError> {
        if let Some(models) = self
            .loader
            .list_dynamic_models(connector_id, saved_settings)
            .await
        {
            self.db
                .connector_settings()
                .save_dynamic_models(connector_id, &models)
                .await
                .map_err(db_error)?;
            return Ok(models);
        }

        Ok(self.loader.describe(connector_id).await?.models)
    }

    // ---- runs ----

    /// Fan a chain out over its run matrix; returns the new Output ids
    pub async fn run_chain(&self, run: ChainRun) -> Result<Vec<String>, EngineError> {
        self.orchestrator.run_chain(run).await
    }

    /// Run a stored chain with its saved models, the global variable values
    /// and every stored dataset
    pub async fn run_saved_chain(&self, chain_id: &str) -> Result<Vec<String>, EngineError> {
        let chain = self
            .db
            .chains()
            .get(chain_id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| EngineError::NotFound(format!("chain '{}'", chain_id)))?;
        let variables = self.db.variables().list().await.map_err(db_error)?;
        let datasets = self.db.datasets().list().await.map_err(db_error)?;

        self.run_chain(ChainRun {
            chain_id: chain.id,
            models: chain.models,
            fragments: chain.fragments,
            variables: bindings(&variables, None),
            datasets,
        })
        .await
    }

    /// Start a workflow; returns one WorkflowOutput id per lane
    pub async fn run_workflow(&self, workflow_id: &str) -> Result<Vec<String>, EngineError> {
        self.orchestrator.run_workflow(workflow_id).await
    }

    /// Models of a chain that still have cells in flight
    pub async fn running_models(&self, chain_id: &str) -> Result<Vec<String>, EngineError> {
        self.orchestrator.running_models(chain_id).await
    }

    pub async fn in_flight(&self) -> Result<usize, EngineError> {
        self.orchestrator.in_flight().await
    }

    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        self.bus.subscribe(event_type).await
    }

    // ---- outputs ----

    /// Outputs of a chain, newest first
    pub async fn list_outputs(&self, chain_id: &str) -> Result<Vec<Output>, EngineError> {
        self.db
            .outputs()
            .list_for_chain(chain_id)
            .await
            .map_err(db_error)
    }

    pub async fn get_output(&self, output_id: &str) -> Result<Option<Output>, EngineError> {
        self.db.outputs().get(output_id).await.map_err(db_error)
    }

    /// Delete an Output record; a result still in flight for it is discarded
    pub async fn delete_output(&self, output_id: &str) -> Result<bool, EngineError> {
        self.db.outputs().delete(output_id).await.map_err(db_error)
    }

    pub async fn rate_output(&self, output_id: &str, rating: Rating) -> Result<bool, EngineError> {
        self.db
            .outputs()
            .rate(output_id, rating)
            .await
            .map_err(db_error)
    }

    pub async fn get_workflow_output(
        &self,
        lane_id: &str,
    ) -> Result<Option<WorkflowOutput>, EngineError> {
        self.db.workflow_outputs().get(lane_id).await.map_err(db_error)
    }

    pub async fn list_workflow_outputs(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowOutput>, EngineError> {
        self.db
            .workflow_outputs()
            .list_for_workflow(workflow_id)
            .await
            .map_err(db_error)
    }

    // ---- stored objects ----

    pub fn chains(&self) -> ChainRepository {
        self.db.chains()
    }

    pub fn workflows(&self) -> WorkflowRepository {
        self.db.workflows()
    }

    pub fn datasets(&self) -> DatasetRepository {
        self.db.datasets()
    }

    pub fn variables(&self) -> VariableRepository {
        self.db.variables()
    }

    pub fn connector_settings(&self) -> ConnectorSettingsRepository {
        self.db.connector_settings()
    }

    /// Stop the orchestrator and close the database
    ///
    /// Cells still in flight are abandoned and stay loading until the next
    /// start recovers them.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        self.orchestrator.shutdown().await;
        if let Err(e) = self.coordinator.await {
            warn!("Orchestrator task ended abnormally: {}", e);
        }

        self.db.flush_wal().await.map_err(db_error)?;
        self.db.close().await.map_err(db_error)?;
        if let Some(lock) = self.lock {
            lock.release().await.map_err(db_error)?;
        }
        info!("Engine stopped");
        Ok(())
    }
}
