//! Connector installation: download, stage, swap, prune
//!
//! An install never touches the currently installed version until every
//! asset has been downloaded. Assets land in a staging directory which is
//! renamed onto the version directory in one step; only then is the manifest
//! rewritten and older version directories pruned.

use chrono::Utc;
use sdk::manifest::{PackageManifest, MANIFEST_FILE};
use sdk::InstallError;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::registry::{validate_connector_id, ConnectorRegistry, InstalledPackage, STAGING_PREFIX};
use crate::release::{self, Release};
use crate::verifier;

impl ConnectorRegistry {
    /// Download and install a connector from a release description URL
    ///
    /// # Errors
    ///
    /// Returns `InstallError::MissingAssets` when the release has no
    /// non-archive asset, `InstallError::Metadata` when the release cannot be
    /// fetched, and `InstallError::Download` when any asset fails. In every
    /// error case the previously installed version stays in place.
    pub async fn install(
        &self,
        connector_id: &str,
        release_url: &str,
    ) -> Result<InstalledPackage, InstallError> {
        validate_connector_id(connector_id)?;
        let lock = self.lock_for(connector_id);
        let _guard = lock.lock().await;

        info!("Installing connector '{}' from {}", connector_id, release_url);

        let metadata = release::fetch_release(&self.client, release_url).await?;
        if metadata.installable_assets().is_empty() {
            return Err(InstallError::MissingAssets(connector_id.to_string()));
        }

        let connector_dir = self.connector_dir(connector_id);
        tokio::fs::create_dir_all(&connector_dir).await?;

        let staging = connector_dir.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
        let assets = match self.stage_assets(connector_id, &metadata, &staging).await {
            Ok(assets) => assets,
            Err(e) => {
                discard_staging(&staging).await;
                // A first install that failed leaves no empty connector folder behind
                let _ = tokio::fs::remove_dir(&connector_dir).await;
                return Err(e);
            }
        };

        let version_tag = metadata.version_tag().unwrap_or_else(release::generated_tag);
        let version_dir = connector_dir.join(&version_tag);

        if let Err(e) = swap_into_place(&staging, &version_dir).await {
            discard_staging(&staging).await;
            return Err(e);
        }

        let manifest = PackageManifest {
            version_tag: version_tag.clone(),
            updated_at: Utc::now().to_rfc3339(),
            assets,
        };
        write_manifest(&connector_dir, &manifest).await?;

        prune_versions(&connector_dir, &version_tag).await;

        info!("  Installed '{}' version {}", connector_id, version_tag);
        Ok(InstalledPackage {
            connector_id: connector_id.to_string(),
            version_tag,
            path: version_dir,
            manifest,
        })
    }

    /// Download every installable asset into `staging`
    async fn stage_assets(
        &self,
        connector_id: &str,
        metadata: &Release,
        staging: &Path,
    ) -> Result<Vec<String>, InstallError> {
        tokio::fs::create_dir_all(staging).await?;

        let mut names = Vec::new();
        for asset in metadata.installable_assets() {
            let Some(file_name) = asset.file_name() else {
                warn!("Skipping asset with unusable name: {:?}", asset.name);
                continue;
            };

            let bytes = release::download_asset(&self.client, asset).await?;
            debug!(
                "  Downloaded {} ({} bytes, sha256 {})",
                file_name,
                bytes.len(),
                verifier::short_hash(&bytes)
            );

            tokio::fs::write(staging.join(file_name), &bytes).await?;
            names.push(file_name.to_string());
        }

        if names.is_empty() {
            return Err(InstallError::MissingAssets(connector_id.to_string()));
        }

        Ok(names)
    }
}

/// Rename the staging directory onto the version directory
///
/// A directory already holding the same tag is first moved aside, and moved
/// back if the staging rename fails, so the old contents are only deleted
/// once the new ones are in place.
async fn swap_into_place(staging: &Path, version_dir: &Path) -> Result<(), InstallError> {
    if !tokio::fs::try_exists(version_dir).await? {
        tokio::fs::rename(staging, version_dir).await?;
        return Ok(());
    }

    let parent = version_dir.parent().unwrap_or_else(|| Path::new("."));
    let old = parent.join(format!("{}old-{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
    debug!(
        "Replacing existing version directory {} (moved to {})",
        version_dir.display(),
        old.display()
    );
    tokio::fs::rename(version_dir, &old).await?;

    if let Err(e) = tokio::fs::rename(staging, version_dir).await {
        if let Err(restore) = tokio::fs::rename(&old, version_dir).await {
            warn!(
                "Failed to restore {} from {}: {}",
                version_dir.display(),
                old.display(),
                restore
            );
        }
        return Err(e.into());
    }

    if let Err(e) = tokio::fs::remove_dir_all(&old).await {
        warn!("Failed to delete replaced version {}: {}", old.display(), e);
    }
    Ok(())
}

/// Write the manifest through a temporary file and rename
async fn write_manifest(connector_dir: &Path, manifest: &PackageManifest) -> Result<(), InstallError> {
    let json = manifest
        .to_json()
        .map_err(|e| InstallError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let tmp: PathBuf = connector_dir.join(format!("{}.tmp", MANIFEST_FILE));
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, connector_dir.join(MANIFEST_FILE)).await?;
    Ok(())
}

/// Delete every version directory except `keep` and staging directories
async fn prune_versions(connector_dir: &Path, keep: &str) {
    let mut entries = match tokio::fs::read_dir(connector_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to scan {} for pruning: {}", connector_dir.display(), e);
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_dir || name == keep || name.starts_with(STAGING_PREFIX) {
            continue;
        }

        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => debug!("  Pruned old version {}", name),
            Err(e) => warn!("Failed to prune {}: {}", entry.path().display(), e),
        }
    }
}

async fn discard_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staging directory {}: {}", staging.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_swap_restores_previous_version() {
        let temp = TempDir::new().unwrap();
        let version_dir = temp.path().join("1.0.0");
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join("main.js"), "old").unwrap();

        // staging vanished, so the second rename fails
        let staging = temp.path().join(format!("{}gone", STAGING_PREFIX));
        assert!(swap_into_place(&staging, &version_dir).await.is_err());

        assert_eq!(std::fs::read_to_string(version_dir.join("main.js")).unwrap(), "old");
        let names: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["1.0.0"]);
    }

    #[tokio::test]
    async fn test_swap_replaces_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let version_dir = temp.path().join("1.0.0");
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join("leftover.txt"), "old").unwrap();

        let staging = temp.path().join(format!("{}new", STAGING_PREFIX));
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("main.js"), "new").unwrap();

        swap_into_place(&staging, &version_dir).await.unwrap();

        assert!(!version_dir.join("leftover.txt").exists());
        assert_eq!(std::fs::read_to_string(version_dir.join("main.js")).unwrap(), "new");
        let names: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["1.0.0"]);
    }
}
