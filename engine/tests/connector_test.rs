//! Integration tests for connector management through the engine

mod common;

use common::{install_fake, open_engine, test_config};
use loom_engine::message_bus::{Event, EventType};
use sdk::errors::InstallError;
use serde_json::{json, Map};
use std::sync::atomic::Ordering;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_release(server: &MockServer, release: &str, tag: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", release)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": tag,
            "assets": [{
                "name": "main.wasm",
                "browser_download_url": format!("{}/assets/{}/main.wasm", server.uri(), release),
            }],
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/assets/{}/main.wasm", release)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\0asm".to_vec()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_list_reports_layouts_and_skips_broken_connectors() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    install_fake(&config.connectors.dir, "legacy", None);
    // a folder without an entry file cannot be loaded
    std::fs::create_dir_all(config.connectors.dir.join("broken")).unwrap();

    let (engine, _) = open_engine(config).await;
    let connectors = engine.list_installed_connectors().await.unwrap();

    let ids: Vec<_> = connectors.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["fake", "legacy"]);

    let fake = &connectors[0];
    assert_eq!(fake.installed_version.as_deref(), Some("1.0.0"));
    assert_eq!(fake.models, vec!["static-a", "static-b"]);
    assert!(!fake.supports_dynamic_models);

    // no manifest: the module's declared version
    assert_eq!(connectors[1].installed_version.as_deref(), Some("0.1.0"));
}

#[tokio::test]
async fn test_dynamic_model_list_is_saved() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    install_fake(&config.connectors.dir, "dynamic", Some("2.0.0"));
    let (engine, _) = open_engine(config).await;

    let mut settings = Map::new();
    settings.insert("api_key".to_string(), json!("secret"));
    let models = engine
        .fetch_dynamic_model_list("dynamic", settings)
        .await
        .unwrap();
    assert_eq!(models, vec!["live-1", "live-2"]);

    let saved = engine
        .connector_settings()
        .get("dynamic")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.dynamic_models, vec!["live-1", "live-2"]);
}

#[tokio::test]
async fn test_dynamic_model_list_falls_back_to_static_models() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    install_fake(&config.connectors.dir, "dynamic", Some("2.0.0"));
    let (engine, _) = open_engine(config).await;

    // listing fails without an api key
    let models = engine
        .fetch_dynamic_model_list("dynamic", Map::new())
        .await
        .unwrap();
    assert_eq!(models, vec!["static-a", "static-b"]);

    // no dynamic listing at all
    let models = engine
        .fetch_dynamic_model_list("fake", Map::new())
        .await
        .unwrap();
    assert_eq!(models, vec!["static-a", "static-b"]);

    assert!(engine
        .connector_settings()
        .get("dynamic")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_install_upgrade_and_uninstall() {
    let server = MockServer::start().await;
    mount_release(&server, "r1", "1.0.0").await;
    mount_release(&server, "r2", "1.1.0").await;

    let temp = TempDir::new().unwrap();
    let (engine, factory) = open_engine(test_config(temp.path())).await;
    let connector_dir = engine.config().connectors.dir.join("remote");
    let mut events = engine.subscribe(EventType::All).await;

    let installed = engine
        .install("remote", &format!("{}/r1", server.uri()))
        .await
        .unwrap();
    assert_eq!(installed.version_tag, "1.0.0");
    assert!(connector_dir.join("1.0.0").join("main.wasm").exists());

    engine.loader().load_module("remote").await.unwrap();
    let key = engine.loader().cached_key("remote").await.unwrap();
    assert_eq!(key.version_tag.as_deref(), Some("1.0.0"));

    engine
        .install("remote", &format!("{}/r2", server.uri()))
        .await
        .unwrap();
    assert!(engine.loader().cached_key("remote").await.is_none());
    assert!(!connector_dir.join("1.0.0").exists());

    let loads_before = factory.loads.load(Ordering::SeqCst);
    let descriptor = engine.loader().describe("remote").await.unwrap();
    assert_eq!(descriptor.installed_version.as_deref(), Some("1.1.0"));
    assert_eq!(factory.loads.load(Ordering::SeqCst), loads_before + 1);

    engine.uninstall("remote").await.unwrap();
    assert!(!connector_dir.exists());
    assert!(engine.loader().cached_key("remote").await.is_none());
    // uninstalling twice is a no-op
    engine.uninstall("remote").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            Event::ConnectorInstalled { version_tag, .. } => seen.push(version_tag),
            Event::ConnectorUninstalled { connector_id } => seen.push(format!("-{}", connector_id)),
            _ => {}
        }
    }
    assert_eq!(seen, vec!["1.0.0", "1.1.0", "-remote", "-remote"]);
}

#[tokio::test]
async fn test_install_rejects_invalid_connector_id() {
    let temp = TempDir::new().unwrap();
    let (engine, _) = open_engine(test_config(temp.path())).await;

    let result = engine.install("../escape", "http://127.0.0.1:9/release").await;
    assert!(matches!(result, Err(InstallError::InvalidConnectorId(_))));
    assert!(!temp.path().join("escape").exists());
}
