//! Connector module contract
//!
//! A loaded connector is a [`ConnectorModule`]. Which optional exports it
//! provides is asked explicitly through [`ConnectorModule::supports`] rather
//! than discovered by calling and failing. Modules are produced by a
//! [`ModuleFactory`]; the engine uses [`super::WasmModuleFactory`], tests
//! plug in in-process fakes.
//!
//! Module calls are synchronous and may block for as long as the remote
//! model takes. Callers run them on the blocking pool.

use async_trait::async_trait;
use loom_connectors::ResolvedEntry;
use sdk::errors::EngineError;
use sdk::{ConnectorConfig, DynamicModelsRequest, RunRequest, RunResponse};
use std::sync::Arc;

/// Exports a connector module may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `config`: static descriptor (required)
    Config,
    /// `run`: execute one model call (required)
    Run,
    /// `list_dynamic_models`: fetch the model list with saved settings
    ListDynamicModels,
}

impl Capability {
    /// Name of the export backing this capability
    pub fn export_name(&self) -> &'static str {
        match self {
            Capability::Config => "config",
            Capability::Run => "run",
            Capability::ListDynamicModels => "list_dynamic_models",
        }
    }

    pub const ALL: [Capability; 3] = [
        Capability::Config,
        Capability::Run,
        Capability::ListDynamicModels,
    ];
}

/// A loaded connector
pub trait ConnectorModule: Send + Sync {
    fn supports(&self, capability: Capability) -> bool;

    /// Static descriptor exported by the module
    fn config(&self) -> Result<ConnectorConfig, EngineError>;

    /// Execute one model call
    ///
    /// # Errors
    ///
    /// `EngineError::Runtime` for anything the module raises. The loader
    /// converts these into failure responses.
    fn run(&self, request: &RunRequest) -> Result<RunResponse, EngineError>;

    /// Fetch the live model list. Only called when
    /// `supports(Capability::ListDynamicModels)` is true.
    fn list_dynamic_models(&self, _request: &DynamicModelsRequest) -> Result<Vec<String>, EngineError> {
        Err(EngineError::Runtime(
            "list_dynamic_models is not supported".to_string(),
        ))
    }
}

/// Loads connector modules from resolved entry files
#[async_trait]
pub trait ModuleFactory: Send + Sync {
    /// Load the module at `entry`
    ///
    /// # Errors
    ///
    /// - `EngineError::Load` if the entry file is missing or unreadable
    /// - `EngineError::Runtime` if the module's own initialisation fails
    async fn load(&self, entry: &ResolvedEntry) -> Result<Arc<dyn ConnectorModule>, EngineError>;
}
