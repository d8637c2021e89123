//! Modelvault Core - reference-counted download manager for optional model
//! bundles.
//!
//! Models are installed into a shared package directory by an external
//! installer. Every package a model pulled in is moved into isolated storage
//! and counted; packages shared by several models are stored once and only
//! deleted when the last model owning them is removed.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelvault_core::{ManagerConfig, ModelDownloader};
//!
//! #[tokio::main]
//! async fn main() -> modelvault_core::Result<()> {
//!     let downloader = ModelDownloader::new(ManagerConfig::from_env()?)?;
//!
//!     downloader.download("en_core_web_sm").await?;
//!     println!("{:?}", downloader.status().await);
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod compatibility;
pub mod config;
pub mod dependencies;
pub mod downloader;
pub mod environment;
pub mod error;
pub mod fetcher;
pub mod platform;
pub mod relocator;
pub mod store;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use compatibility::{CompatibilityTable, ResolvedModel};
pub use config::{DownloadConfig, ManagerConfig};
pub use dependencies::{DependencyManager, StorageAudit};
pub use downloader::{
    DownloadOutcome, DownloadRequest, DownloadStatus, DownloadStatusReport, ModelDownloader,
};
pub use environment::{EnvironmentDiff, EnvironmentSnapshot, InstallManifest};
pub use error::{ModelVaultError, Result};
pub use fetcher::{CommandFetcher, ModelFetcher};
pub use relocator::PackageRelocator;
pub use store::{DependencyStore, ModelDependencies};
