//! Host/connector wire contract types
//!
//! Every value crossing the WASM boundary is JSON. The host sends a
//! [`RunRequest`] to a connector's `run` export and expects a [`RunResponse`]
//! back; the `config` export returns a [`ConnectorConfig`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared type of a connector property or setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
}

impl PropertyType {
    pub fn as_str(&self) -> &str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Array => "array",
        }
    }
}

/// One entry of a connector's settings or properties schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: PropertyType,
    #[serde(default)]
    pub default: Option<Value>,
}

/// Static configuration exported by a connector module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Display name
    pub name: String,
    /// Version the module declares for itself
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub settings_schema: Vec<SchemaField>,
    #[serde(default)]
    pub properties_schema: Vec<SchemaField>,
}

/// Metadata for an installed connector, as shown to the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    /// Connector identifier (its folder name)
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
    pub settings_schema: Vec<SchemaField>,
    pub properties_schema: Vec<SchemaField>,
    /// Manifest version tag, else the module's declared version
    pub installed_version: Option<String>,
    /// Whether the module exports `list_dynamic_models`
    pub supports_dynamic_models: bool,
}

impl ConnectorDescriptor {
    pub fn from_config(
        id: impl Into<String>,
        config: ConnectorConfig,
        manifest_tag: Option<String>,
        supports_dynamic_models: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: config.name,
            models: config.models,
            settings_schema: config.settings_schema,
            properties_schema: config.properties_schema,
            installed_version: manifest_tag.or(config.version),
            supports_dynamic_models,
        }
    }
}

/// Input to a connector's `run` export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub model: String,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Input to a connector's optional `list_dynamic_models` export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicModelsRequest {
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Token accounting reported by a connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Output of a connector's `run` export
///
/// Exactly one of `content` and `error` is expected to be set. The host
/// treats a response with an error as a failed cell regardless of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub model: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

impl RunResponse {
    /// Create a successful response
    pub fn success(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            content: Some(content.into()),
            error: None,
            token_usage: None,
        }
    }

    /// Create a failure response carrying the model id
    pub fn failure(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            content: None,
            error: Some(error.into()),
            token_usage: None,
        }
    }

    /// Attach token usage
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_field_type_key() {
        let json = r#"{"name": "temperature", "type": "number", "default": 0.7}"#;
        let field: SchemaField = serde_json::from_str(json).unwrap();
        assert_eq!(field.kind, PropertyType::Number);
        assert_eq!(field.default, Some(serde_json::json!(0.7)));
    }

    #[test]
    fn test_schema_field_defaults_to_string() {
        let field: SchemaField = serde_json::from_str(r#"{"name": "api_key"}"#).unwrap();
        assert_eq!(field.kind, PropertyType::String);
        assert!(field.label.is_none());
    }

    #[test]
    fn test_descriptor_prefers_manifest_tag() {
        let config = ConnectorConfig {
            name: "Echo".to_string(),
            version: Some("0.3.0".to_string()),
            models: vec!["echo-1".to_string()],
            settings_schema: vec![],
            properties_schema: vec![],
        };

        let with_tag =
            ConnectorDescriptor::from_config("echo", config.clone(), Some("v9".into()), false);
        assert_eq!(with_tag.installed_version.as_deref(), Some("v9"));

        let without_tag = ConnectorDescriptor::from_config("echo", config, None, true);
        assert_eq!(without_tag.installed_version.as_deref(), Some("0.3.0"));
        assert!(without_tag.supports_dynamic_models);
    }

    #[test]
    fn test_run_response_failure() {
        let response = RunResponse::failure("gpt-4o", "boom");
        assert!(response.is_failure());
        assert_eq!(response.model, "gpt-4o");
        assert!(response.content.is_none());
    }

    #[test]
    fn test_run_response_missing_optional_fields() {
        let response: RunResponse =
            serde_json::from_str(r#"{"model": "m", "content": "hi"}"#).unwrap();
        assert_eq!(response.content.as_deref(), Some("hi"));
        assert!(response.token_usage.is_none());
        assert!(!response.is_failure());
    }
}
