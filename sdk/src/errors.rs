//! Error types and handling
//!
//! This module provides the error types used throughout Loom. All errors
//! implement the `ErrorExt` trait which provides user-friendly hints and
//! indicates whether errors are recoverable.
//!
//! # Propagation
//!
//! Every error here is local to one Output or one install call. The engine
//! never lets an error raised for one run-matrix cell abort a sibling cell:
//! connector failures are converted into failure results at the loader
//! boundary, and install failures leave the previously installed version in
//! place.

use thiserror::Error;

/// Trait for Loom error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// settings values or file system paths.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require reinstalling a connector or fixing config.
    fn is_recoverable(&self) -> bool;
}

/// Errors raised while installing a connector package
///
/// An install failure never touches the currently installed version: the
/// staging directory is discarded and the manifest is left as it was.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Invalid connector id: {0}")]
    InvalidConnectorId(String),

    #[error("Release for '{0}' has no installable (non-archive) assets")]
    MissingAssets(String),

    #[error("Failed to fetch release metadata: {0}")]
    Metadata(String),

    #[error("Failed to download asset '{asset}': {reason}")]
    Download { asset: String, reason: String },

    #[error("Install IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for InstallError {
    fn user_hint(&self) -> &str {
        match self {
            Self::InvalidConnectorId(_) => "Connector ids may only contain letters, digits, '-', '_' and '.'",
            Self::MissingAssets(_) => "The release does not contain a connector build",
            Self::Metadata(_) => "Could not read the release. Check the release URL",
            Self::Download { .. } => "Download failed. Check your network and try again",
            Self::Io(_) => "Could not write the connector to disk",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidConnectorId(_) | Self::MissingAssets(_))
    }
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Load**: a connector's entry file is missing or unreadable
/// - **Runtime**: a loaded connector failed (trap, error return, missing export)
/// - **Interrupted**: an Output was still in flight when the engine stopped
/// - **Install**: connector package installation failed
/// - **Configuration / Database / Template**: ambient layers
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorExt};
///
/// let error = EngineError::Load("openai: entry file missing".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(!error.is_recoverable());
///
/// assert!(EngineError::Interrupted.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Connector errors
    #[error("Connector load error: {0}")]
    Load(String),

    #[error("Connector runtime error: {0}")]
    Runtime(String),

    #[error("Connector not installed: {0}")]
    ConnectorNotInstalled(String),

    #[error(transparent)]
    Install(#[from] InstallError),

    // Execution errors
    #[error("Interrupted: the engine stopped before this run finished")]
    Interrupted,

    #[error("No runnable model selected for chain {0}")]
    NoRunnableModel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Template error: {0}")]
    Template(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Database operation failed. Try restarting Loom",
            Self::Load(_) => "Connector files are missing. Reinstall the connector",
            Self::Runtime(_) => "The connector failed. Check its settings and logs",
            Self::ConnectorNotInstalled(_) => "Install the connector with 'loom connector install'",
            Self::Install(e) => e.user_hint(),
            Self::Interrupted => "The run was interrupted. Run the chain again",
            Self::NoRunnableModel(_) => "Select at least one model for every chain in the workflow",
            Self::NotFound(_) => "The requested record does not exist",
            Self::Template(_) => "Check the variables and dataset references in your prompts",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Load(_) | Self::ConnectorNotInstalled(_) | Self::Config(_) => false,
            Self::Install(e) => e.is_recoverable(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_error_hint_passthrough() {
        let err = EngineError::from(InstallError::MissingAssets("x".to_string()));
        assert_eq!(
            err.user_hint(),
            "The release does not contain a connector build"
        );
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_download_error_is_recoverable() {
        let err = InstallError::Download {
            asset: "main.wasm".to_string(),
            reason: "HTTP 502".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("main.wasm"));
    }

    #[test]
    fn test_interrupted_message() {
        assert!(EngineError::Interrupted.to_string().starts_with("Interrupted"));
    }
}
