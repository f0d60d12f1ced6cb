//! Loom Connector Registry
//!
//! This crate installs, updates, uninstalls and version-resolves connector
//! packages on disk. A connector package lives under
//! `connectors/<connector_id>/` as one directory per installed version tag
//! plus a sibling `manifest.json` naming the current tag:
//!
//! ```text
//! connectors/
//!   openai/
//!     manifest.json        {"versionTag": "1.4.0", "updatedAt": ..., "assets": [...]}
//!     1.4.0/main.wasm
//! ```
//!
//! A connector installed before manifests existed keeps its entry file
//! directly under `connectors/<connector_id>/` (the legacy layout).

pub mod installer;
pub mod registry;
pub mod release;
pub mod verifier;

pub use registry::{ConnectorRegistry, InstalledPackage, ResolvedEntry, ENTRY_FILE};
pub use release::{Release, ReleaseAsset};
