//! On-disk connector layout, manifest reads and version resolution

use sdk::manifest::{PackageManifest, MANIFEST_FILE};
use sdk::InstallError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Entry file every connector package must ship
pub const ENTRY_FILE: &str = "main.wasm";

/// Prefix of in-progress install directories
pub(crate) const STAGING_PREFIX: &str = ".staging-";

/// Result of a successful install
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub connector_id: String,
    pub version_tag: String,
    /// Version directory the assets were moved into
    pub path: PathBuf,
    pub manifest: PackageManifest,
}

/// Where a connector's entry file is expected to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    pub connector_id: String,
    /// `None` for the legacy unversioned layout
    pub version_tag: Option<String>,
    pub path: PathBuf,
}

/// Connector package store rooted at a `connectors/` directory
///
/// Installs and uninstalls of the same connector id are serialized; different
/// connectors proceed independently.
pub struct ConnectorRegistry {
    root: PathBuf,
    pub(crate) client: reqwest::Client,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectorRegistry {
    /// Create a registry with a default HTTP client
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("loom-connectors/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InstallError::Metadata(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(root, client))
    }

    /// Create a registry using a preconfigured HTTP client
    pub fn with_client(root: impl Into<PathBuf>, client: reqwest::Client) -> Self {
        Self {
            root: root.into(),
            client,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The `connectors/` directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding every version of one connector
    pub fn connector_dir(&self, connector_id: &str) -> PathBuf {
        self.root.join(connector_id)
    }

    /// Path of a connector's manifest file
    pub fn manifest_path(&self, connector_id: &str) -> PathBuf {
        self.connector_dir(connector_id).join(MANIFEST_FILE)
    }

    /// Per-connector lock serializing installs and uninstalls
    pub(crate) fn lock_for(&self, connector_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(connector_id.to_string()).or_default())
    }

    /// Read a connector's manifest
    ///
    /// A missing manifest means the legacy layout and returns `None`. An
    /// unreadable or malformed manifest is logged and also treated as absent.
    pub async fn read_manifest(&self, connector_id: &str) -> Option<PackageManifest> {
        let path = self.manifest_path(connector_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read manifest for '{}': {}", connector_id, e);
                return None;
            }
        };

        match PackageManifest::from_json(&contents) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Malformed manifest for '{}': {}", connector_id, e);
                None
            }
        }
    }

    /// Resolve the entry file a connector should be loaded from
    ///
    /// Returns the entry under the manifest's version directory when a
    /// manifest exists, else the legacy unversioned path. Existence of the
    /// file is not checked here; loading reports a missing file.
    pub async fn resolve_entry_point(&self, connector_id: &str) -> ResolvedEntry {
        let dir = self.connector_dir(connector_id);
        match self.read_manifest(connector_id).await {
            Some(manifest) => ResolvedEntry {
                connector_id: connector_id.to_string(),
                path: dir.join(&manifest.version_tag).join(ENTRY_FILE),
                version_tag: Some(manifest.version_tag),
            },
            None => ResolvedEntry {
                connector_id: connector_id.to_string(),
                version_tag: None,
                path: dir.join(ENTRY_FILE),
            },
        }
    }

    /// List the ids of every installed connector folder
    pub async fn installed_ids(&self) -> Result<Vec<String>, InstallError> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(vec![]);
        }

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Remove a connector's whole folder; no-op if it is not installed
    pub async fn uninstall(&self, connector_id: &str) -> Result<(), InstallError> {
        validate_connector_id(connector_id)?;
        let lock = self.lock_for(connector_id);
        let _guard = lock.lock().await;

        let dir = self.connector_dir(connector_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Uninstalled connector: {}", connector_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Connector '{}' not installed, nothing to remove", connector_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject ids that would escape the connectors directory
pub fn validate_connector_id(connector_id: &str) -> Result<(), InstallError> {
    let valid = !connector_id.is_empty()
        && !connector_id.starts_with('.')
        && connector_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(InstallError::InvalidConnectorId(connector_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_connector_id() {
        assert!(validate_connector_id("openai").is_ok());
        assert!(validate_connector_id("my_connector-2").is_ok());
        assert!(validate_connector_id("").is_err());
        assert!(validate_connector_id("../etc").is_err());
        assert!(validate_connector_id(".hidden").is_err());
        assert!(validate_connector_id("a/b").is_err());
    }

    #[tokio::test]
    async fn test_resolve_versioned_and_legacy() {
        let temp = TempDir::new().unwrap();
        let registry = ConnectorRegistry::new(temp.path()).unwrap();

        let legacy = registry.resolve_entry_point("x").await;
        assert_eq!(legacy.version_tag, None);
        assert_eq!(legacy.path, temp.path().join("x").join(ENTRY_FILE));

        std::fs::create_dir_all(temp.path().join("x")).unwrap();
        std::fs::write(
            registry.manifest_path("x"),
            r#"{"versionTag":"v2","updatedAt":"2024-01-01T00:00:00Z","assets":["main.wasm"]}"#,
        )
        .unwrap();

        let versioned = registry.resolve_entry_point("x").await;
        assert_eq!(versioned.version_tag.as_deref(), Some("v2"));
        assert_eq!(
            versioned.path,
            temp.path().join("x").join("v2").join(ENTRY_FILE)
        );
    }

    #[tokio::test]
    async fn test_malformed_manifest_falls_back_to_legacy() {
        let temp = TempDir::new().unwrap();
        let registry = ConnectorRegistry::new(temp.path()).unwrap();
        std::fs::create_dir_all(temp.path().join("x")).unwrap();
        std::fs::write(registry.manifest_path("x"), "{not json").unwrap();

        let entry = registry.resolve_entry_point("x").await;
        assert_eq!(entry.version_tag, None);
    }

    #[tokio::test]
    async fn test_installed_ids_skips_files_and_hidden() {
        let temp = TempDir::new().unwrap();
        let registry = ConnectorRegistry::new(temp.path()).unwrap();
        std::fs::create_dir_all(temp.path().join("b")).unwrap();
        std::fs::create_dir_all(temp.path().join("a")).unwrap();
        std::fs::create_dir_all(temp.path().join(".trash")).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "x").unwrap();

        assert_eq!(registry.installed_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_installed_ids_missing_root() {
        let temp = TempDir::new().unwrap();
        let registry = ConnectorRegistry::new(temp.path().join("nope")).unwrap();
        assert!(registry.installed_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_is_noop_when_absent() {
        let temp = TempDir::new().unwrap();
        let registry = ConnectorRegistry::new(temp.path()).unwrap();
        registry.uninstall("ghost").await.unwrap();
    }
}
