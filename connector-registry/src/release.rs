//! Release metadata and asset downloads

use sdk::manifest::MANIFEST_FILE;
use sdk::InstallError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File extensions of archive assets, which are never installed
const ARCHIVE_SUFFIXES: &[&str] = &[".zip", ".tar", ".tar.gz", ".tgz", ".tar.xz", ".7z"];

/// A single downloadable asset of a release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

impl ReleaseAsset {
    /// Whether this asset is a packed archive rather than a connector file
    pub fn is_archive(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }

    /// File name to store the asset under, stripped of any directory part
    pub fn file_name(&self) -> Option<&str> {
        std::path::Path::new(&self.name)
            .file_name()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
    }
}

/// Release description (GitHub release API shape)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// Assets that can be installed (everything except archives)
    pub fn installable_assets(&self) -> Vec<&ReleaseAsset> {
        self.assets.iter().filter(|a| !a.is_archive()).collect()
    }

    /// Version tag usable as a directory name, if the release declares one
    ///
    /// Names the package manifest or its temporary file are refused, since
    /// a version directory must never shadow them.
    pub fn version_tag(&self) -> Option<String> {
        self.tag_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| t.replace(['/', '\\'], "-"))
            .filter(|t| t != "." && t != ".." && !t.starts_with('.'))
            .filter(|t| !is_manifest_name(t))
    }
}

fn is_manifest_name(name: &str) -> bool {
    name == MANIFEST_FILE || name.strip_suffix(".tmp") == Some(MANIFEST_FILE)
}

/// Generate a version tag for releases that carry none
pub fn generated_tag() -> String {
    format!("ts-{}", chrono::Utc::now().format("%Y%m%d%H%M%S%3f"))
}

/// Fetch the release description at `url`
pub async fn fetch_release(client: &reqwest::Client, url: &str) -> Result<Release, InstallError> {
    debug!("Fetching release metadata from {}", url);

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| InstallError::Metadata(e.to_string()))?;

    response
        .json::<Release>()
        .await
        .map_err(|e| InstallError::Metadata(format!("invalid release JSON: {}", e)))
}

/// Download one asset into memory
pub async fn download_asset(
    client: &reqwest::Client,
    asset: &ReleaseAsset,
) -> Result<Vec<u8>, InstallError> {
    let download_err = |reason: String| InstallError::Download {
        asset: asset.name.clone(),
        reason,
    };

    let bytes = client
        .get(&asset.browser_download_url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| download_err(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| download_err(e.to_string()))?;

    if bytes.is_empty() {
        return Err(download_err("empty response body".to_string()));
    }

    Ok(bytes.to_vec())
}
