//! Fetch primitive: installs one resolved model into the shared directory.
//!
//! [`ModelFetcher`] is the seam the orchestrator drives. The production
//! implementation, [`CommandFetcher`], runs the package installer as a child
//! process in its own session and reports which packages appeared.

use crate::cancel::CancellationToken;
use crate::compatibility::ResolvedModel;
use crate::config::{DownloadConfig, ManagerConfig};
use crate::environment::{diff, EnvironmentSnapshot, InstallManifest};
use crate::error::{ModelVaultError, Result};
use crate::platform;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Installs a model and reports the packages it put into the shared
/// directory.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Install `model`, stopping early once `cancel` fires.
    ///
    /// Returns `DownloadCancelled` when cancelled; any packages installed
    /// before that stay in place for the caller to roll back.
    async fn fetch(&self, model: &ResolvedModel, cancel: &CancellationToken)
        -> Result<InstallManifest>;
}

/// Runs an installer command per model.
///
/// Arguments may contain the placeholders `{url}`, `{package}`, `{model}`
/// and `{version}`, substituted per download.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    shared_dir: PathBuf,
    program: PathBuf,
    args: Vec<String>,
    download_url: String,
    grace_period: Duration,
}

impl CommandFetcher {
    /// Arguments for `python -m pip install` of a model wheel.
    pub const PIP_ARGS: &'static [&'static str] = &["-m", "pip", "install", "--no-input", "{url}"];

    pub fn new(shared_dir: impl Into<PathBuf>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            program: program.into(),
            args,
            download_url: DownloadConfig::DEFAULT_DOWNLOAD_URL.to_string(),
            grace_period: DownloadConfig::CANCEL_GRACE_PERIOD,
        }
    }

    /// The pip-based fetcher described by `config`.
    pub fn pip(config: &ManagerConfig) -> Self {
        Self::new(
            config.shared_dir.clone(),
            config.python.clone(),
            Self::PIP_ARGS.iter().map(|arg| arg.to_string()).collect(),
        )
        .with_download_url(config.download_url.clone())
        .with_grace_period(config.cancel_grace_period)
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Command-line arguments for one model.
    pub fn render_args(&self, model: &ResolvedModel) -> Vec<String> {
        let url = model.wheel_url(&self.download_url);
        let package = model.package_name();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{url}", &url)
                    .replace("{package}", &package)
                    .replace("{model}", &model.name)
                    .replace("{version}", &model.version)
            })
            .collect()
    }

    fn spawn(&self, model: &ResolvedModel) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(model))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::detach_process_group(&mut cmd);

        cmd.spawn().map_err(|e| ModelVaultError::FetchFailed {
            model: model.name.clone(),
            message: format!("failed to start {}: {}", self.program.display(), e),
        })
    }

    /// Stop the installer and everything it started, then reap it.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            match platform::terminate_process_tree(pid, self.grace_period).await {
                Ok(count) => debug!("Terminated installer {} and {} descendants", pid, count),
                Err(e) => warn!("Failed to terminate installer tree {}: {}", pid, e),
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => debug!("Installer exited after cancel with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for installer: {}", e),
            Err(_) => {
                warn!("Installer ignored SIGTERM, killing");
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill installer: {}", e);
                }
                if let Err(e) = child.wait().await {
                    warn!("Failed to reap installer: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl ModelFetcher for CommandFetcher {
    async fn fetch(
        &self,
        model: &ResolvedModel,
        cancel: &CancellationToken,
    ) -> Result<InstallManifest> {
        let before = EnvironmentSnapshot::capture(&self.shared_dir)?;
        cancel.check()?;

        info!("Installing {} into {}", model, self.shared_dir.display());
        let mut child = self.spawn(model)?;
        // Nothing the installer started outlives the fetch, aborted or not.
        let _group = child.id().map(platform::ProcessGroupGuard::new);
        let _stdout = child.stdout.take().map(|out| forward_output(out, "stdout"));
        let stderr = child.stderr.take().map(|err| forward_output(err, "stderr"));

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match exit {
            Some(status) => status.map_err(|e| ModelVaultError::FetchFailed {
                model: model.name.clone(),
                message: format!("failed to wait for installer: {}", e),
            })?,
            None => {
                info!("Cancelling install of {}", model);
                self.terminate(&mut child).await;
                return Err(ModelVaultError::DownloadCancelled);
            }
        };

        if !status.success() {
            let last_line = match stderr {
                Some(handle) => last_output_line(handle, self.grace_period).await,
                None => None,
            };
            let message = match last_line {
                Some(line) => format!("installer exited with {}: {}", status, line),
                None => format!("installer exited with {}", status),
            };
            return Err(ModelVaultError::FetchFailed {
                model: model.name.clone(),
                message,
            });
        }

        let after = EnvironmentSnapshot::capture(&self.shared_dir)?;
        let changes = diff(&before, &after);
        changes.ensure_no_removals()?;

        let manifest = changes.into_manifest();
        info!("Installed {} ({} packages)", model, manifest.len());
        Ok(manifest)
    }
}

/// Log each line of a child stream; resolves to the last non-empty line.
fn forward_output<R>(stream: R, name: &'static str) -> JoinHandle<Option<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut last = None;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "modelvault::installer", "[{}] {}", name, line);
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read installer {}: {}", name, e);
                    break;
                }
            }
        }
        last
    })
}

async fn last_output_line(handle: JoinHandle<Option<String>>, wait: Duration) -> Option<String> {
    match tokio::time::timeout(wait, handle).await {
        Ok(Ok(line)) => line,
        _ => None,
    }
}
