//! Loom SDK
//!
//! Shared library providing the connector contract, descriptor types and the
//! error taxonomy. This crate is used by the engine, the connector registry
//! and connector plugins.

/// Error types and handling
pub mod errors;

/// Connector package manifest
pub mod manifest;

/// Host/connector wire contract types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, ErrorExt, InstallError};
pub use manifest::PackageManifest;
pub use types::{
    ConnectorConfig, ConnectorDescriptor, DynamicModelsRequest, PropertyType, RunRequest,
    RunResponse, SchemaField, TokenUsage,
};
