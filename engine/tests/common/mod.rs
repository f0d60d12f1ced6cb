//! Shared fixtures for engine integration tests
//!
//! Connectors are in-process fakes loaded through the `ModuleFactory` seam.
//! Their behavior is picked by model id:
//!
//! - `boom`: the module returns an error
//! - `slow`: sleeps before answering
//! - `props`: answers with the request's properties as JSON
//! - anything else: answers with the prompts joined by " | "
#![allow(dead_code)]

use async_trait::async_trait;
use loom_connectors::ResolvedEntry;
use loom_engine::config::Config;
use loom_engine::message_bus::{Event, OutputEvent};
use loom_engine::runtime::{Capability, ConnectorModule, ModuleFactory};
use loom_engine::Engine;
use sdk::errors::EngineError;
use sdk::manifest::PackageManifest;
use sdk::{
    ConnectorConfig, DynamicModelsRequest, PropertyType, RunRequest, RunResponse, SchemaField,
    TokenUsage,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SLOW_CALL: Duration = Duration::from_millis(150);
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Call counters shared by every fake module of a factory
#[derive(Default)]
pub struct CallStats {
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

pub struct FakeModule {
    connector_id: String,
    stats: Arc<CallStats>,
}

impl ConnectorModule for FakeModule {
    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Config | Capability::Run => true,
            Capability::ListDynamicModels => self.connector_id == "dynamic",
        }
    }

    fn config(&self) -> Result<ConnectorConfig, EngineError> {
        Ok(ConnectorConfig {
            name: format!("Fake {}", self.connector_id),
            version: Some("0.1.0".to_string()),
            models: vec!["static-a".to_string(), "static-b".to_string()],
            settings_schema: vec![],
            properties_schema: vec![
                SchemaField {
                    name: "temperature".to_string(),
                    label: None,
                    kind: PropertyType::Number,
                    default: None,
                },
                SchemaField {
                    name: "stream".to_string(),
                    label: None,
                    kind: PropertyType::Boolean,
                    default: Some(serde_json::json!(false)),
                },
            ],
        })
    }

    fn run(&self, request: &RunRequest) -> Result<RunResponse, EngineError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(active, Ordering::SeqCst);

        let result = match request.model.as_str() {
            "boom" => Err(EngineError::Runtime("model exploded".to_string())),
            "slow" => {
                std::thread::sleep(SLOW_CALL);
                Ok(RunResponse::success("slow", request.prompts.join(" | ")))
            }
            "props" => Ok(RunResponse::success(
                "props",
                serde_json::Value::Object(request.properties.clone()).to_string(),
            )),
            model => Ok(RunResponse::success(model, request.prompts.join(" | ")).with_usage(
                TokenUsage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                },
            )),
        };

        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn list_dynamic_models(
        &self,
        request: &DynamicModelsRequest,
    ) -> Result<Vec<String>, EngineError> {
        if request.settings.contains_key("api_key") {
            Ok(vec!["live-1".to_string(), "live-2".to_string()])
        } else {
            Err(EngineError::Runtime("missing api_key".to_string()))
        }
    }
}

/// Loads a [`FakeModule`] for any connector whose entry file exists
#[derive(Default)]
pub struct FakeFactory {
    pub stats: Arc<CallStats>,
    pub loads: AtomicUsize,
}

#[async_trait]
impl ModuleFactory for FakeFactory {
    async fn load(&self, entry: &ResolvedEntry) -> Result<Arc<dyn ConnectorModule>, EngineError> {
        if !entry.path.exists() {
            return Err(EngineError::Load(format!(
                "entry file not found: {}",
                entry.path.display()
            )));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeModule {
            connector_id: entry.connector_id.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Lay out a connector package by hand; `None` uses the legacy layout
pub fn install_fake(connectors: &Path, id: &str, tag: Option<&str>) {
    let dir = connectors.join(id);
    match tag {
        Some(tag) => {
            std::fs::create_dir_all(dir.join(tag)).unwrap();
            std::fs::write(dir.join(tag).join("main.wasm"), b"\0asm").unwrap();
            let manifest = PackageManifest {
                version_tag: tag.to_string(),
                updated_at: "2026-01-01T00:00:00Z".to_string(),
                assets: vec!["main.wasm".to_string()],
            };
            std::fs::write(dir.join("manifest.json"), manifest.to_json().unwrap()).unwrap();
        }
        None => {
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("main.wasm"), b"\0asm").unwrap();
        }
    }
}

pub fn test_config(dir: &Path) -> Config {
    Config::rooted_at(dir)
}

/// Open an engine with the `fake` connector installed
pub async fn open_engine(config: Config) -> (Engine, Arc<FakeFactory>) {
    install_fake(&config.connectors.dir, "fake", Some("1.0.0"));
    let factory = Arc::new(FakeFactory::default());
    let engine = Engine::open_with_factory(config, Arc::clone(&factory) as Arc<dyn ModuleFactory>)
        .await
        .unwrap();
    (engine, factory)
}

/// Collect `n` OutputFinished events
pub async fn finished_outputs(rx: &mut mpsc::Receiver<Event>, n: usize) -> Vec<OutputEvent> {
    let mut events = Vec::with_capacity(n);
    while events.len() < n {
        match tokio::time::timeout(EVENT_TIMEOUT, rx.recv()).await {
            Ok(Some(Event::OutputFinished(event))) => events.push(event),
            Ok(Some(_)) => {}
            Ok(None) => panic!("event bus closed"),
            Err(_) => panic!("timed out with {} of {} outputs finished", events.len(), n),
        }
    }
    events
}

/// Collect `n` WorkflowFinished events as (lane id, error)
pub async fn finished_lanes(
    rx: &mut mpsc::Receiver<Event>,
    n: usize,
) -> Vec<(String, Option<String>)> {
    let mut lanes = Vec::with_capacity(n);
    while lanes.len() < n {
        match tokio::time::timeout(EVENT_TIMEOUT, rx.recv()).await {
            Ok(Some(Event::WorkflowFinished {
                workflow_output_id,
                error,
                ..
            })) => lanes.push((workflow_output_id, error)),
            Ok(Some(_)) => {}
            Ok(None) => panic!("event bus closed"),
            Err(_) => panic!("timed out with {} of {} lanes finished", lanes.len(), n),
        }
    }
    lanes
}

/// Wait until every dispatched cell has reported back
pub async fn wait_idle(engine: &Engine) {
    for _ in 0..100 {
        if engine.in_flight().await.unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cells still in flight");
}
