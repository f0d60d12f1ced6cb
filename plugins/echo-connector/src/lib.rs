//! Echo Connector
//!
//! Reference connector that answers with its own prompts. Useful for trying
//! chains and workflows without a model provider.
//!
//! Models:
//! - `echo`: the prompts joined by newlines
//! - `reverse`: the same text reversed
//! - `fail`: always reports an error

use extism_pdk::*;
use sdk::{
    ConnectorConfig, DynamicModelsRequest, PropertyType, RunRequest, RunResponse, SchemaField,
    TokenUsage,
};
use serde_json::{json, Value};

const MODELS: [&str; 3] = ["echo", "reverse", "fail"];

fn connector_config() -> ConnectorConfig {
    ConnectorConfig {
        name: "Echo".to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        models: MODELS.iter().map(|m| m.to_string()).collect(),
        settings_schema: vec![SchemaField {
            name: "prefix".to_string(),
            label: Some("Reply prefix".to_string()),
            kind: PropertyType::String,
            default: None,
        }],
        properties_schema: vec![
            SchemaField {
                name: "uppercase".to_string(),
                label: Some("Uppercase".to_string()),
                kind: PropertyType::Boolean,
                default: Some(json!(false)),
            },
            SchemaField {
                name: "repeat".to_string(),
                label: Some("Repeat count".to_string()),
                kind: PropertyType::Number,
                default: Some(json!(1)),
            },
        ],
    }
}

fn respond(request: &RunRequest) -> RunResponse {
    let mut text = request.prompts.join("\n");

    match request.model.as_str() {
        "echo" => {}
        "reverse" => text = text.chars().rev().collect(),
        "fail" => return RunResponse::failure(&request.model, "echo connector asked to fail"),
        other => {
            return RunResponse::failure(&request.model, format!("unknown model '{}'", other));
        }
    }

    if request.properties.get("uppercase").and_then(Value::as_bool) == Some(true) {
        text = text.to_uppercase();
    }

    let repeat = request
        .properties
        .get("repeat")
        .and_then(Value::as_f64)
        .map(|n| n.max(1.0) as usize)
        .unwrap_or(1);
    text = vec![text; repeat].join("\n");

    if let Some(prefix) = request.settings.get("prefix").and_then(Value::as_str) {
        text = format!("{}{}", prefix, text);
    }

    let prompt_tokens = request
        .prompts
        .iter()
        .map(|p| p.split_whitespace().count() as u64)
        .sum();
    let completion_tokens = text.split_whitespace().count() as u64;

    RunResponse::success(&request.model, text).with_usage(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

/// Models from settings: the static list plus any `extra_models`
fn dynamic_models(request: &DynamicModelsRequest) -> Vec<String> {
    let mut models: Vec<String> = MODELS.iter().map(|m| m.to_string()).collect();
    if let Some(extra) = request.settings.get("extra_models").and_then(Value::as_array) {
        models.extend(extra.iter().filter_map(Value::as_str).map(str::to_string));
    }
    models
}

/// Static connector configuration
#[plugin_fn]
pub fn config() -> FnResult<String> {
    Ok(serde_json::to_string(&connector_config())?)
}

/// Answer one run request
#[plugin_fn]
pub fn run(input: String) -> FnResult<String> {
    let request: RunRequest = serde_json::from_str(&input)?;
    Ok(serde_json::to_string(&respond(&request))?)
}

/// Live model list
#[plugin_fn]
pub fn list_dynamic_models(input: String) -> FnResult<String> {
    let request: DynamicModelsRequest = serde_json::from_str(&input)?;
    Ok(serde_json::to_string(&dynamic_models(&request))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn request(model: &str, prompts: &[&str]) -> RunRequest {
        RunRequest {
            model: model.to_string(),
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
            properties: Map::new(),
            settings: Map::new(),
        }
    }

    #[test]
    fn test_echo_joins_prompts() {
        let response = respond(&request("echo", &["hello", "world"]));
        assert_eq!(response.content.as_deref(), Some("hello\nworld"));
        assert_eq!(response.model, "echo");
        assert_eq!(response.token_usage.map(|u| u.total_tokens), Some(4));
    }

    #[test]
    fn test_reverse() {
        let response = respond(&request("reverse", &["abc"]));
        assert_eq!(response.content.as_deref(), Some("cba"));
    }

    #[test]
    fn test_fail_and_unknown_models_report_errors() {
        assert!(respond(&request("fail", &["x"])).is_failure());
        let unknown = respond(&request("gpt", &["x"]));
        assert_eq!(unknown.error.as_deref(), Some("unknown model 'gpt'"));
        assert_eq!(unknown.model, "gpt");
    }

    #[test]
    fn test_properties_and_settings() {
        let mut req = request("echo", &["hi"]);
        req.properties.insert("uppercase".into(), json!(true));
        req.properties.insert("repeat".into(), json!(2.0));
        req.settings.insert("prefix".into(), json!("> "));

        let response = respond(&req);
        assert_eq!(response.content.as_deref(), Some("> HI\nHI"));
    }

    #[test]
    fn test_dynamic_models_include_extras() {
        let mut settings = Map::new();
        settings.insert("extra_models".into(), json!(["shout"]));
        let models = dynamic_models(&DynamicModelsRequest { settings });
        assert_eq!(models, vec!["echo", "reverse", "fail", "shout"]);
    }

    #[test]
    fn test_config_declares_models() {
        let config = connector_config();
        assert_eq!(config.models.len(), 3);
        assert_eq!(config.properties_schema[0].name, "uppercase");
    }
}
