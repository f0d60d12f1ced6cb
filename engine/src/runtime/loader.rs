//! Connector loader
//!
//! Resolves a connector id to its installed entry file, loads it through the
//! configured [`ModuleFactory`] and caches the handle. The cache key carries
//! the version tag and entry path, so a handle loaded before an upgrade is
//! discarded the first time the upgraded package resolves differently.
//!
//! Nothing a connector does can fail a caller of [`ConnectorLoader::run`]:
//! load errors, error returns, traps, panics and missing exports all become
//! a failure [`RunResponse`] carrying the requested model id.

use super::module::{Capability, ConnectorModule, ModuleFactory};
use loom_connectors::{ConnectorRegistry, ResolvedEntry};
use sdk::errors::EngineError;
use sdk::{ConnectorConfig, ConnectorDescriptor, DynamicModelsRequest, RunRequest, RunResponse};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Identity of a loaded module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub connector_id: String,
    pub version_tag: Option<String>,
    pub entry_path: PathBuf,
}

impl From<&ResolvedEntry> for HandleKey {
    fn from(entry: &ResolvedEntry) -> Self {
        Self {
            connector_id: entry.connector_id.clone(),
            version_tag: entry.version_tag.clone(),
            entry_path: entry.path.clone(),
        }
    }
}

struct CachedHandle {
    key: HandleKey,
    module: Arc<dyn ConnectorModule>,
    /// Descriptor config, fetched from the module once per handle
    config: Option<ConnectorConfig>,
}

/// Loads and invokes installed connectors
///
/// The handle map is only locked for lookups and inserts. Loading a module
/// and calling into one both happen outside the lock, so a slow compile or
/// model call never holds up other connectors.
pub struct ConnectorLoader {
    registry: Arc<ConnectorRegistry>,
    factory: Arc<dyn ModuleFactory>,
    handles: Mutex<HashMap<String, CachedHandle>>,
}

impl ConnectorLoader {
    pub fn new(registry: Arc<ConnectorRegistry>, factory: Arc<dyn ModuleFactory>) -> Self {
        Self {
            registry,
            factory,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Load a connector, reusing the cached handle while its key still matches
    pub async fn load_module(&self, connector_id: &str) -> Result<Arc<dyn ConnectorModule>, EngineError> {
        let (_, module) = self.load_handle(connector_id).await?;
        Ok(module)
    }

    async fn load_handle(
        &self,
        connector_id: &str,
    ) -> Result<(HandleKey, Arc<dyn ConnectorModule>), EngineError> {
        let entry = self.registry.resolve_entry_point(connector_id).await;
        let key = HandleKey::from(&entry);

        {
            let mut handles = self.handles.lock().await;
            if let Some(cached) = handles.get(connector_id) {
                if cached.key == key {
                    return Ok((key, Arc::clone(&cached.module)));
                }
                debug!(
                    "Discarding stale handle for '{}' ({:?} -> {:?})",
                    connector_id, cached.key.version_tag, key.version_tag
                );
                handles.remove(connector_id);
            }
        }

        let module = self.factory.load(&entry).await?;

        // The package may have changed while loading; only cache what is
        // still current
        let current = HandleKey::from(&self.registry.resolve_entry_point(connector_id).await);
        let mut handles = self.handles.lock().await;
        if let Some(cached) = handles.get(connector_id) {
            if cached.key == key {
                return Ok((key, Arc::clone(&cached.module)));
            }
        }
        if current == key {
            handles.insert(
                connector_id.to_string(),
                CachedHandle {
                    key: key.clone(),
                    module: Arc::clone(&module),
                    config: None,
                },
            );
        }
        Ok((key, module))
    }

    async fn cached_config(&self, connector_id: &str, key: &HandleKey) -> Option<ConnectorConfig> {
        let handles = self.handles.lock().await;
        handles
            .get(connector_id)
            .filter(|cached| &cached.key == key)
            .and_then(|cached| cached.config.clone())
    }

    async fn store_config(&self, connector_id: &str, key: &HandleKey, config: &ConnectorConfig) {
        let mut handles = self.handles.lock().await;
        if let Some(cached) = handles.get_mut(connector_id) {
            if &cached.key == key {
                cached.config = Some(config.clone());
            }
        }
    }

    /// Drop any cached handle for a connector
    pub async fn invalidate(&self, connector_id: &str) {
        if self.handles.lock().await.remove(connector_id).is_some() {
            debug!("Invalidated handle for '{}'", connector_id);
        }
    }

    /// Key of the cached handle, if one is loaded
    pub async fn cached_key(&self, connector_id: &str) -> Option<HandleKey> {
        self.handles
            .lock()
            .await
            .get(connector_id)
            .map(|c| c.key.clone())
    }

    /// Descriptor of one installed connector
    ///
    /// The module's config is read once per loaded handle; later calls are
    /// answered from the cache without entering the module.
    pub async fn describe(&self, connector_id: &str) -> Result<ConnectorDescriptor, EngineError> {
        let (key, module) = self.load_handle(connector_id).await?;
        if !module.supports(Capability::Config) {
            return Err(EngineError::Runtime(format!(
                "'{}' does not export config",
                connector_id
            )));
        }
        let supports_dynamic = module.supports(Capability::ListDynamicModels);

        let config = match self.cached_config(connector_id, &key).await {
            Some(config) => config,
            None => {
                let config = blocking(move || module.config()).await?;
                self.store_config(connector_id, &key, &config).await;
                config
            }
        };

        Ok(ConnectorDescriptor::from_config(
            connector_id,
            config,
            key.version_tag,
            supports_dynamic,
        ))
    }

    /// Reload and describe every installed connector
    ///
    /// A connector that fails to load is logged and left out of the list.
    pub async fn list(&self) -> Result<Vec<ConnectorDescriptor>, EngineError> {
        let ids = self.registry.installed_ids().await?;
        let mut descriptors = Vec::with_capacity(ids.len());

        for id in ids {
            self.invalidate(&id).await;
            match self.describe(&id).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => warn!("Skipping connector '{}': {}", id, e),
            }
        }

        info!("Found {} usable connectors", descriptors.len());
        Ok(descriptors)
    }

    /// Run one model call; never fails
    pub async fn run(&self, connector_id: &str, request: RunRequest) -> RunResponse {
        let model = request.model.clone();

        let module = match self.load_module(connector_id).await {
            Ok(module) => module,
            Err(e) => {
                error!("Connector '{}' could not be loaded: {}", connector_id, e);
                return RunResponse::failure(model, e.to_string());
            }
        };

        if !module.supports(Capability::Run) {
            let e = EngineError::Runtime(format!("'{}' does not export run", connector_id));
            return RunResponse::failure(model, e.to_string());
        }

        match blocking(move || module.run(&request)).await {
            Ok(mut response) => {
                if response.model.is_empty() {
                    response.model = model;
                }
                response
            }
            Err(e) => {
                error!(connector = connector_id, model = %model, "Connector run failed: {}", e);
                RunResponse::failure(model, e.to_string())
            }
        }
    }

    /// Ask a connector for its live model list
    ///
    /// Returns `None` when the connector lacks the capability or the call
    /// fails; failures are logged, never raised.
    pub async fn list_dynamic_models(
        &self,
        connector_id: &str,
        settings: Map<String, Value>,
    ) -> Option<Vec<String>> {
        let module = match self.load_module(connector_id).await {
            Ok(module) => module,
            Err(e) => {
                warn!("Cannot list models for '{}': {}", connector_id, e);
                return None;
            }
        };

        if !module.supports(Capability::ListDynamicModels) {
            return None;
        }

        let request = DynamicModelsRequest { settings };
        match blocking(move || module.list_dynamic_models(&request)).await {
            Ok(models) => Some(models),
            Err(e) => {
                warn!("Dynamic model listing failed for '{}': {}", connector_id, e);
                None
            }
        }
    }
}

/// Run a module call on the blocking pool, turning a panic into an error
async fn blocking<T, F>(call: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| EngineError::Runtime(format!("connector panicked: {}", e)))?
}
