//! WASM connector runtime using Extism
//!
//! Connectors are compiled to WebAssembly and run in the Extism sandbox. The
//! host talks to them in JSON through three exports:
//!
//! - `config` → `ConnectorConfig`
//! - `run(RunRequest)` → `RunResponse`
//! - `list_dynamic_models(DynamicModelsRequest)` → `string[]` (optional)
//!
//! # Isolation
//!
//! A connector has no filesystem access. Outbound HTTP is limited to the
//! hosts listed in `connectors.allowed_hosts`. A trap inside the module
//! surfaces as an `Err` from `Plugin::call`, never as a host panic.
//!
//! # Example
//!
//! ```no_run
//! use loom_engine::runtime::{ModuleFactory, WasmModuleFactory};
//! use loom_connectors::ConnectorRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ConnectorRegistry::new("/home/me/.loom/connectors")?;
//! let entry = registry.resolve_entry_point("openai").await;
//!
//! let factory = WasmModuleFactory::new(vec!["api.openai.com".to_string()]);
//! let module = factory.load(&entry).await?;
//! println!("{}", module.config()?.name);
//! # Ok(())
//! # }
//! ```

use super::module::{Capability, ConnectorModule, ModuleFactory};
use async_trait::async_trait;
use extism::{Function, Manifest as ExtismManifest, Plugin, Wasm};
use loom_connectors::ResolvedEntry;
use sdk::errors::EngineError;
use sdk::{ConnectorConfig, DynamicModelsRequest, RunRequest, RunResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Builds Extism plugins from connector entry files
pub struct WasmModuleFactory {
    allowed_hosts: Vec<String>,
}

impl WasmModuleFactory {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self { allowed_hosts }
    }
}

#[async_trait]
impl ModuleFactory for WasmModuleFactory {
    async fn load(&self, entry: &ResolvedEntry) -> Result<Arc<dyn ConnectorModule>, EngineError> {
        tracing::info!(
            "Loading connector '{}' from {}",
            entry.connector_id,
            entry.path.display()
        );

        let wasm_bytes = tokio::fs::read(&entry.path).await.map_err(|e| {
            tracing::error!("Failed to read WASM file {}: {}", entry.path.display(), e);
            EngineError::Load(format!(
                "'{}': cannot read {}: {}",
                entry.connector_id,
                entry.path.display(),
                e
            ))
        })?;

        if wasm_bytes.is_empty() {
            return Err(EngineError::Load(format!(
                "'{}': entry file {} is empty",
                entry.connector_id,
                entry.path.display()
            )));
        }

        let connector_id = entry.connector_id.clone();
        let allowed_hosts = self.allowed_hosts.clone();

        // Compiling the module is CPU bound, keep it off the async workers
        let module = tokio::task::spawn_blocking(move || {
            WasmConnector::instantiate(connector_id, wasm_bytes, allowed_hosts)
        })
        .await
        .map_err(|e| EngineError::Runtime(format!("connector initialisation panicked: {}", e)))??;

        tracing::info!("Connector '{}' loaded successfully", entry.connector_id);
        Ok(Arc::new(module))
    }
}

/// Idle instances kept per connector once their calls return
const MAX_IDLE_INSTANCES: usize = 8;

/// Reusable instances of one module
///
/// A call takes an idle instance or creates a new one, so concurrent calls
/// never share an instance and never wait for each other. Instances are
/// returned after a successful call only; one that failed may be left in a
/// broken state.
struct InstancePool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T> InstancePool<T> {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    fn put(&self, instance: T) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(instance);
        }
    }

    fn with_instance<R>(
        &self,
        create: impl FnOnce() -> Result<T, EngineError>,
        call: impl FnOnce(&mut T) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut instance = match idle {
            Some(instance) => instance,
            None => create()?,
        };

        let result = call(&mut instance);
        if result.is_ok() {
            self.put(instance);
        }
        result
    }
}

/// A compiled connector and its pool of Extism plugin instances
///
/// Extism plugins are not reentrant, so each in-flight call gets its own
/// instance from the pool.
struct WasmConnector {
    connector_id: String,
    manifest: ExtismManifest,
    instances: InstancePool<Plugin>,
    exports: HashSet<Capability>,
}

impl WasmConnector {
    fn instantiate(
        connector_id: String,
        wasm_bytes: Vec<u8>,
        allowed_hosts: Vec<String>,
    ) -> Result<Self, EngineError> {
        let manifest = ExtismManifest::new([Wasm::data(wasm_bytes)])
            .with_allowed_hosts(allowed_hosts.into_iter());

        let plugin = new_plugin(&connector_id, &manifest)?;
        let exports = Capability::ALL
            .into_iter()
            .filter(|c| plugin.function_exists(c.export_name()))
            .collect();

        let instances = InstancePool::new(MAX_IDLE_INSTANCES);
        instances.put(plugin);

        Ok(Self {
            connector_id,
            manifest,
            instances,
            exports,
        })
    }

    fn call_raw(&self, function: &str, input: &[u8]) -> Result<Vec<u8>, EngineError> {
        tracing::debug!("Calling connector '{}' export '{}'", self.connector_id, function);

        self.instances.with_instance(
            || new_plugin(&self.connector_id, &self.manifest),
            |plugin| {
                plugin
                    .call::<&[u8], Vec<u8>>(function, input)
                    .map_err(|e| {
                        tracing::error!(
                            "Connector '{}' export '{}' failed: {}",
                            self.connector_id,
                            function,
                            e
                        );
                        EngineError::Runtime(format!("{} failed: {}", function, e))
                    })
            },
        )
    }

    fn call_json<I: Serialize, O: DeserializeOwned>(
        &self,
        function: &str,
        input: &I,
    ) -> Result<O, EngineError> {
        let input = serde_json::to_vec(input)
            .map_err(|e| EngineError::Runtime(format!("cannot encode {} input: {}", function, e)))?;
        let output = self.call_raw(function, &input)?;
        decode(function, &output)
    }
}

fn new_plugin(connector_id: &str, manifest: &ExtismManifest) -> Result<Plugin, EngineError> {
    Plugin::new(manifest, Vec::<Function>::new(), true).map_err(|e| {
        tracing::error!("Failed to create Extism plugin for '{}': {}", connector_id, e);
        EngineError::Runtime(format!("'{}' failed to initialise: {}", connector_id, e))
    })
}

fn decode<O: DeserializeOwned>(function: &str, output: &[u8]) -> Result<O, EngineError> {
    serde_json::from_slice(output)
        .map_err(|e| EngineError::Runtime(format!("{} returned invalid JSON: {}", function, e)))
}

impl ConnectorModule for WasmConnector {
    fn supports(&self, capability: Capability) -> bool {
        self.exports.contains(&capability)
    }

    fn config(&self) -> Result<ConnectorConfig, EngineError> {
        let output = self.call_raw(Capability::Config.export_name(), &[])?;
        decode(Capability::Config.export_name(), &output)
    }

    fn run(&self, request: &RunRequest) -> Result<RunResponse, EngineError> {
        self.call_json(Capability::Run.export_name(), request)
    }

    fn list_dynamic_models(&self, request: &DynamicModelsRequest) -> Result<Vec<String>, EngineError> {
        self.call_json(Capability::ListDynamicModels.export_name(), request)
    }
}
