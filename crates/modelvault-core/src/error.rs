//! Error types for modelvault.
//!
//! One enum covers the whole download/dependency lifecycle. Persistence
//! failures (`Io`, `Json`) are always fatal to the operation that hit them.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for modelvault.
#[derive(Debug, Error)]
pub enum ModelVaultError {
    // Download lifecycle errors
    #[error("Another model is being downloaded")]
    AlreadyDownloading,

    #[error("Model is not tracked: {model}")]
    UnknownModel { model: String },

    #[error("Model is already tracked: {model}")]
    ModelAlreadyTracked { model: String },

    #[error("No compatible version known for model: {model}")]
    UnresolvedModel { model: String },

    #[error("Download of {model} installed no packages")]
    EmptyManifest { model: String },

    #[error("Fetching {model} failed: {message}")]
    FetchFailed { model: String, message: String },

    #[error("Download cancelled")]
    DownloadCancelled,

    #[error("Shared environment changed unexpectedly, packages disappeared: {missing:?}")]
    EnvironmentRace { missing: Vec<String> },

    // Persistence errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Dependency store is locked by another process: {path}")]
    StoreLocked { path: PathBuf },

    // Process errors
    #[error("Process {pid} error: {message}")]
    Process { pid: u32, message: String },

    #[error("Background task failed: {message}")]
    TaskFailed { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for modelvault operations.
pub type Result<T> = std::result::Result<T, ModelVaultError>;

impl From<std::io::Error> for ModelVaultError {
    fn from(err: std::io::Error) -> Self {
        ModelVaultError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ModelVaultError {
    fn from(err: serde_json::Error) -> Self {
        ModelVaultError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ModelVaultError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        ModelVaultError::Io {
            message: format!("{} ({})", err, path.display()),
            path: Some(path),
            source: Some(err),
        }
    }

    /// Map to the HTTP status code the transport layer answers with.
    ///
    /// - 400: the request itself is invalid
    /// - 404: the referenced model is not tracked
    /// - 503: a download is already in flight
    /// - 500: everything else
    pub fn http_status(&self) -> u16 {
        match self {
            ModelVaultError::AlreadyDownloading => 503,

            ModelVaultError::UnknownModel { .. } => 404,

            ModelVaultError::Validation { .. } | ModelVaultError::UnresolvedModel { .. } => 400,

            _ => 500,
        }
    }

    /// Whether the failure concerns persisted state and must not be swallowed.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            ModelVaultError::Io { .. }
                | ModelVaultError::Json { .. }
                | ModelVaultError::StoreLocked { .. }
        )
    }
}
