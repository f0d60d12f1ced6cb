//! Manifest written next to an installed connector's version directories

use serde::{Deserialize, Serialize};

/// File name of the manifest inside `connectors/<id>/`
pub const MANIFEST_FILE: &str = "manifest.json";

/// Installed package manifest
///
/// The version tag is the only directory the loader resolves against until
/// a newer install replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub version_tag: String,
    /// RFC 3339 timestamp of the install
    pub updated_at: String,
    pub assets: Vec<String>,
}

impl PackageManifest {
    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize manifest to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
