//! Single-flight download orchestration.
//!
//! At most one model is fetched at a time. The fetch runs on a worker task
//! that reports back exactly once over a channel. The orchestrator moves to
//! `Committing`, releases its state lock, and applies the report through the
//! [`DependencyManager`] on the blocking pool, so status queries stay
//! responsive while packages are moved.
//!
//! ```text
//! Idle --download--> Downloading --report--> Committing --commit--> Idle
//!                         |
//!                       cancel
//!                         v
//!                     Cancelling --rollback--> Idle
//! ```
//!
//! A commit cannot be cancelled; `cancel` during `Committing` is a no-op.

use crate::cancel::CancellationToken;
use crate::compatibility::{CompatibilityTable, ResolvedModel};
use crate::config::ManagerConfig;
use crate::dependencies::{DependencyManager, StorageAudit};
use crate::environment::{EnvironmentSnapshot, InstallManifest};
use crate::error::{ModelVaultError, Result};
use crate::fetcher::{CommandFetcher, ModelFetcher};
use crate::relocator::PackageRelocator;
use crate::store::DependencyStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Answer to a download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadRequest {
    /// A worker was started.
    Accepted { download_id: String },
    /// The model is already tracked; nothing was started.
    #[serde(rename = "installed")]
    AlreadyInstalled,
}

/// Coarse state reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Running,
    Done,
}

/// How the last finished download ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadOutcome {
    Installed {
        download_id: String,
        model: String,
        packages: Vec<String>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        download_id: String,
        model: String,
        reason: String,
        finished_at: DateTime<Utc>,
    },
    Cancelled {
        download_id: String,
        model: String,
        finished_at: DateTime<Utc>,
    },
}

impl DownloadOutcome {
    pub fn model(&self) -> &str {
        match self {
            DownloadOutcome::Installed { model, .. }
            | DownloadOutcome::Failed { model, .. }
            | DownloadOutcome::Cancelled { model, .. } => model,
        }
    }

    pub fn download_id(&self) -> &str {
        match self {
            DownloadOutcome::Installed { download_id, .. }
            | DownloadOutcome::Failed { download_id, .. }
            | DownloadOutcome::Cancelled { download_id, .. } => download_id,
        }
    }
}

/// Snapshot of the orchestrator for status polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStatusReport {
    pub status: DownloadStatus,
    /// Model currently being downloaded or cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<DownloadOutcome>,
}

enum DownloadState {
    Idle,
    Downloading {
        download_id: String,
        model: String,
        token: CancellationToken,
        /// Shared directory contents before the fetch started.
        baseline: EnvironmentSnapshot,
        worker: JoinHandle<()>,
    },
    Committing {
        download_id: String,
        model: String,
    },
    Cancelling {
        download_id: String,
        model: String,
    },
}

struct Orchestration {
    state: DownloadState,
    last_outcome: Option<DownloadOutcome>,
}

struct Inner {
    config: ManagerConfig,
    compatibility: CompatibilityTable,
    fetcher: Arc<dyn ModelFetcher>,
    /// Lock order: `orchestration` before `manager`. The manager is locked
    /// with `blocking_lock` on the blocking pool, never while a task holds
    /// `orchestration` there.
    orchestration: Mutex<Orchestration>,
    manager: Mutex<DependencyManager>,
}

/// Drives model downloads and owns the dependency state.
#[derive(Clone)]
pub struct ModelDownloader {
    inner: Arc<Inner>,
}

impl ModelDownloader {
    /// Create a downloader that installs models with pip.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let fetcher = Arc::new(CommandFetcher::pip(&config));
        Self::with_fetcher(config, fetcher)
    }

    /// Create a downloader with a custom fetch primitive.
    ///
    /// The compatibility table is loaded from `config.compatibility_path`.
    pub fn with_fetcher(config: ManagerConfig, fetcher: Arc<dyn ModelFetcher>) -> Result<Self> {
        let compatibility = CompatibilityTable::load(&config.compatibility_path)?;
        Self::with_parts(config, compatibility, fetcher)
    }

    /// Create a downloader from already loaded parts.
    pub fn with_parts(
        config: ManagerConfig,
        compatibility: CompatibilityTable,
        fetcher: Arc<dyn ModelFetcher>,
    ) -> Result<Self> {
        let store = DependencyStore::open(config.store_path.clone())?;
        let relocator = PackageRelocator::new(config.shared_dir.clone(), config.isolated_dir.clone())?;
        let manager = DependencyManager::new(store, relocator)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                compatibility,
                fetcher,
                orchestration: Mutex::new(Orchestration {
                    state: DownloadState::Idle,
                    last_outcome: None,
                }),
                manager: Mutex::new(manager),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Run `task` against the dependency manager on the blocking pool.
    async fn with_manager<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut DependencyManager) -> T + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut manager = inner.manager.blocking_lock();
            task(&mut manager)
        })
        .await
        .map_err(|e| ModelVaultError::TaskFailed {
            message: e.to_string(),
        })
    }

    // ========================================
    // Download operations
    // ========================================

    /// Start downloading `model` in the background.
    ///
    /// Returns `AlreadyInstalled` without doing anything if the model is
    /// tracked, and `AlreadyDownloading` if another download is in flight.
    pub async fn download(&self, model: &str) -> Result<DownloadRequest> {
        if model.trim().is_empty() {
            return Err(ModelVaultError::Validation {
                field: "model".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let mut orchestration = self.inner.orchestration.lock().await;
        let busy = !matches!(orchestration.state, DownloadState::Idle);
        let tracked = if busy {
            // A commit may hold the manager; don't wait for it under this lock.
            self.inner
                .manager
                .try_lock()
                .map(|manager| manager.is_tracked(model))
                .unwrap_or(false)
        } else {
            self.inner.manager.lock().await.is_tracked(model)
        };
        if tracked {
            debug!("Model {} already installed", model);
            return Ok(DownloadRequest::AlreadyInstalled);
        }
        if busy {
            return Err(ModelVaultError::AlreadyDownloading);
        }

        let resolved = self.inner.compatibility.resolve(model)?;
        let baseline = EnvironmentSnapshot::capture(&self.inner.config.shared_dir)?;
        let download_id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();

        let (tx, rx) = oneshot::channel();
        let worker = tokio::spawn(run_worker(
            self.inner.fetcher.clone(),
            resolved.clone(),
            token.clone(),
            tx,
        ));
        tokio::spawn(
            self.clone()
                .apply_report(download_id.clone(), model.to_string(), rx),
        );

        info!("Started download {} of {}", download_id, resolved);
        orchestration.state = DownloadState::Downloading {
            download_id: download_id.clone(),
            model: model.to_string(),
            token,
            baseline,
            worker,
        };

        Ok(DownloadRequest::Accepted { download_id })
    }

    /// Check if a download is in flight, including one being cancelled.
    pub async fn is_downloading(&self) -> bool {
        !matches!(
            self.inner.orchestration.lock().await.state,
            DownloadState::Idle
        )
    }

    /// Current state plus the outcome of the last finished download.
    pub async fn status(&self) -> DownloadStatusReport {
        let orchestration = self.inner.orchestration.lock().await;
        let (status, model, download_id) = match &orchestration.state {
            DownloadState::Idle => (DownloadStatus::Done, None, None),
            DownloadState::Downloading {
                download_id, model, ..
            }
            | DownloadState::Committing { download_id, model }
            | DownloadState::Cancelling { download_id, model } => (
                DownloadStatus::Running,
                Some(model.clone()),
                Some(download_id.clone()),
            ),
        };

        DownloadStatusReport {
            status,
            model,
            download_id,
            last_outcome: orchestration.last_outcome.clone(),
        }
    }

    /// Cancel the download in flight and roll back what it installed.
    ///
    /// Returns `false` if nothing was downloading, the download is already
    /// being committed, or a cancel is already running. Otherwise returns
    /// once the installer has stopped and the shared directory is back at
    /// its pre-download contents.
    pub async fn cancel(&self) -> Result<bool> {
        let (download_id, model, token, baseline, mut worker) = {
            let mut orchestration = self.inner.orchestration.lock().await;
            match std::mem::replace(&mut orchestration.state, DownloadState::Idle) {
                DownloadState::Downloading {
                    download_id,
                    model,
                    token,
                    baseline,
                    worker,
                } => {
                    orchestration.state = DownloadState::Cancelling {
                        download_id: download_id.clone(),
                        model: model.clone(),
                    };
                    (download_id, model, token, baseline, worker)
                }
                other => {
                    orchestration.state = other;
                    return Ok(false);
                }
            }
        };

        info!("Cancelling download {} of {}", download_id, model);
        token.cancel();

        let timeout = self.inner.config.cancel_timeout;
        if tokio::time::timeout(timeout, &mut worker).await.is_err() {
            warn!(
                "Download worker did not stop within {:?}, aborting it",
                timeout
            );
            // Dropping the fetch lets its process-group guard kill the installer.
            worker.abort();
            let _ = worker.await;
        }

        let rollback = self
            .with_manager(move |manager| manager.handle_download_cancel(&baseline))
            .await
            .and_then(|purged| purged);

        let mut orchestration = self.inner.orchestration.lock().await;
        orchestration.state = DownloadState::Idle;
        orchestration.last_outcome = Some(DownloadOutcome::Cancelled {
            download_id,
            model: model.clone(),
            finished_at: Utc::now(),
        });

        match rollback {
            Ok(purged) => {
                info!("Cancelled download of {}, purged {:?}", model, purged);
                Ok(true)
            }
            Err(e) => {
                error!("Rollback after cancelling {} failed: {}", model, e);
                Err(e)
            }
        }
    }

    /// Apply the worker's report, unless the download was cancelled or
    /// replaced in the meantime.
    async fn apply_report(
        self,
        download_id: String,
        requested: String,
        report: oneshot::Receiver<Result<InstallManifest>>,
    ) {
        let result = report.await.unwrap_or_else(|_| {
            Err(ModelVaultError::FetchFailed {
                model: requested,
                message: "download worker exited without reporting".to_string(),
            })
        });

        let (model, baseline) = {
            let mut orchestration = self.inner.orchestration.lock().await;
            match std::mem::replace(&mut orchestration.state, DownloadState::Idle) {
                DownloadState::Downloading {
                    download_id: id,
                    model,
                    baseline,
                    ..
                } if id == download_id => {
                    orchestration.state = DownloadState::Committing {
                        download_id: id,
                        model: model.clone(),
                    };
                    (model, baseline)
                }
                other => {
                    orchestration.state = other;
                    debug!("Discarding report of download {}", download_id);
                    return;
                }
            }
        };

        let commit = {
            let download_id = download_id.clone();
            let model = model.clone();
            self.with_manager(move |manager| {
                commit_report(manager, download_id, model, baseline, result)
            })
            .await
        };
        let outcome = commit.unwrap_or_else(|e| {
            error!("Commit of {} did not complete: {}", model, e);
            failed(download_id, model, &e)
        });
        debug!(
            "Download {} of {} settled",
            outcome.download_id(),
            outcome.model()
        );

        let mut orchestration = self.inner.orchestration.lock().await;
        orchestration.state = DownloadState::Idle;
        orchestration.last_outcome = Some(outcome);
    }

    // ========================================
    // Model operations
    // ========================================

    /// Remove a tracked model. Returns `false` if it was not tracked.
    pub async fn remove(&self, model: &str) -> Result<bool> {
        let model = model.to_string();
        self.with_manager(move |manager| {
            if !manager.is_tracked(&model) {
                debug!("Model {} is not tracked, nothing to remove", model);
                return Ok(false);
            }
            let left_behind = manager.handle_model_remove(&model)?;
            if !left_behind.is_empty() {
                warn!(
                    "Removed {} but could not delete {:?}; prune orphans to reclaim them",
                    model, left_behind
                );
            }
            Ok(true)
        })
        .await?
    }

    /// Tracked models, sorted.
    pub async fn models(&self) -> Vec<String> {
        self.inner.manager.lock().await.models()
    }

    /// Packages owned by `model`, if tracked.
    pub async fn packages(&self, model: &str) -> Option<Vec<String>> {
        self.inner
            .manager
            .lock()
            .await
            .packages(model)
            .map(<[String]>::to_vec)
    }

    pub async fn reference_count(&self, package: &str) -> usize {
        self.inner.manager.lock().await.reference_count(package)
    }

    /// Compare isolated storage with the tracked models.
    pub async fn audit(&self) -> Result<StorageAudit> {
        self.with_manager(|manager| manager.audit()).await?
    }

    /// Delete isolated entries no tracked model references.
    pub async fn prune_orphans(&self) -> Result<Vec<String>> {
        self.with_manager(|manager| manager.prune_orphans()).await?
    }
}

async fn run_worker(
    fetcher: Arc<dyn ModelFetcher>,
    model: ResolvedModel,
    token: CancellationToken,
    report: oneshot::Sender<Result<InstallManifest>>,
) {
    let result = fetcher.fetch(&model, &token).await;
    if report.send(result).is_err() {
        debug!("Report for {} had no receiver", model);
    }
}

/// Apply a worker report to the manager.
fn commit_report(
    manager: &mut DependencyManager,
    download_id: String,
    model: String,
    baseline: EnvironmentSnapshot,
    result: Result<InstallManifest>,
) -> DownloadOutcome {
    match result {
        Ok(manifest) => match manager.handle_download_complete(&model, &manifest) {
            Ok(()) => DownloadOutcome::Installed {
                download_id,
                model,
                packages: manifest.packages.into_iter().collect(),
                finished_at: Utc::now(),
            },
            Err(e) => {
                if e.is_persistence_failure() {
                    error!("Failed to commit download of {}: {}", model, e);
                } else {
                    warn!("Rejected download of {}: {}", model, e);
                }
                roll_back(manager, &baseline, Some(&manifest));
                failed(download_id, model, &e)
            }
        },
        Err(e) => {
            warn!("Download of {} failed: {}", model, e);
            roll_back(manager, &baseline, None);
            failed(download_id, model, &e)
        }
    }
}

/// Purge what a failed download left in the shared directory.
fn roll_back(
    manager: &DependencyManager,
    baseline: &EnvironmentSnapshot,
    manifest: Option<&InstallManifest>,
) {
    match manager.handle_download_cancel(baseline) {
        Ok(purged) if !purged.is_empty() => info!("Rolled back {:?}", purged),
        Ok(_) => {}
        Err(e) => error!("Rollback of failed download failed: {}", e),
    }
    if let Some(manifest) = manifest {
        if let Err(e) = manager.release_uncommitted(manifest) {
            error!("Failed to release uncommitted packages: {}", e);
        }
    }
}

fn failed(download_id: String, model: String, err: &ModelVaultError) -> DownloadOutcome {
    DownloadOutcome::Failed {
        download_id,
        model,
        reason: err.to_string(),
        finished_at: Utc::now(),
    }
}
