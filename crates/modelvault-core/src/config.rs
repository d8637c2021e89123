//! Centralized configuration for modelvault.
//!
//! `ManagerConfig` carries the paths the manager works on and is normally
//! built from the environment. Constant timeouts live in `DownloadConfig`.

use crate::error::{ModelVaultError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Timeouts and constants for the download lifecycle.
pub struct DownloadConfig;

impl DownloadConfig {
    /// Time a terminated fetch process gets before SIGKILL.
    pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(3);
    /// Time `cancel()` waits for the worker before aborting it.
    pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(15);
    /// Poll interval while waiting for terminated processes to exit.
    pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_DOWNLOAD_URL: &'static str =
        "https://github.com/explosion/spacy-models/releases/download";
    pub const DEFAULT_PYTHON: &'static str = "python";
}

/// File names used inside the managed directories.
pub struct PathsConfig;

impl PathsConfig {
    pub const STORE_FILE_NAME: &'static str = "model_dependencies.json";
    pub const COMPATIBILITY_FILE_NAME: &'static str = "spacy_model_compatibility.json";
}

/// Environment variable names read by [`ManagerConfig::from_env`].
pub struct EnvVars;

impl EnvVars {
    pub const SHARED_DIR: &'static str = "MODELVAULT_SHARED_DIR";
    pub const ISOLATED_DIR: &'static str = "MODELVAULT_ISOLATED_DIR";
    pub const STORE_FILE: &'static str = "MODELVAULT_STORE_FILE";
    pub const COMPATIBILITY_FILE: &'static str = "MODELVAULT_COMPATIBILITY_FILE";
    pub const PYTHON: &'static str = "MODELVAULT_PYTHON";
    pub const DOWNLOAD_URL: &'static str = "MODELVAULT_DOWNLOAD_URL";
    pub const VIRTUAL_ENV: &'static str = "VIRTUAL_ENV";
    pub const PYTHONPATH: &'static str = "PYTHONPATH";
}

/// Paths and settings for a [`crate::ModelDownloader`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory the fetch primitive installs packages into.
    pub shared_dir: PathBuf,
    /// Directory holding one copy of every referenced package.
    pub isolated_dir: PathBuf,
    /// Persisted model -> packages mapping.
    pub store_path: PathBuf,
    /// Version-resolution table.
    pub compatibility_path: PathBuf,
    /// Interpreter the default fetch command runs.
    pub python: PathBuf,
    /// Base URL model wheels are downloaded from.
    pub download_url: String,
    pub cancel_grace_period: Duration,
    pub cancel_timeout: Duration,
}

impl ManagerConfig {
    /// Create a config for the given shared and isolated directories.
    ///
    /// The store defaults to `<isolated_dir>/model_dependencies.json`.
    pub fn new(shared_dir: impl Into<PathBuf>, isolated_dir: impl Into<PathBuf>) -> Self {
        let isolated_dir = isolated_dir.into();
        Self {
            shared_dir: shared_dir.into(),
            store_path: isolated_dir.join(PathsConfig::STORE_FILE_NAME),
            isolated_dir,
            compatibility_path: PathBuf::from(PathsConfig::COMPATIBILITY_FILE_NAME),
            python: PathBuf::from(DownloadConfig::DEFAULT_PYTHON),
            download_url: DownloadConfig::DEFAULT_DOWNLOAD_URL.to_string(),
            cancel_grace_period: DownloadConfig::CANCEL_GRACE_PERIOD,
            cancel_timeout: DownloadConfig::CANCEL_TIMEOUT,
        }
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_compatibility_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.compatibility_path = path.into();
        self
    }

    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period = grace;
        self
    }

    /// Build the config from environment variables.
    ///
    /// The shared directory falls back to the virtualenv's `site-packages`
    /// and the isolated directory to the first `PYTHONPATH` entry. Inside a
    /// virtualenv the interpreter defaults to the virtualenv's own, so pip
    /// installs into the same `site-packages`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let shared_dir = match lookup(EnvVars::SHARED_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let venv = lookup(EnvVars::VIRTUAL_ENV).ok_or_else(|| ModelVaultError::Config {
                    message: format!(
                        "Neither {} nor {} is set",
                        EnvVars::SHARED_DIR,
                        EnvVars::VIRTUAL_ENV
                    ),
                })?;
                find_site_packages(Path::new(&venv))?
            }
        };

        let isolated_dir = match lookup(EnvVars::ISOLATED_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => lookup(EnvVars::PYTHONPATH)
                .and_then(|pp| std::env::split_paths(&pp).find(|p| !p.as_os_str().is_empty()))
                .ok_or_else(|| ModelVaultError::Config {
                    message: format!(
                        "Neither {} nor {} is set",
                        EnvVars::ISOLATED_DIR,
                        EnvVars::PYTHONPATH
                    ),
                })?,
        };

        let mut config = Self::new(shared_dir, isolated_dir);
        if let Some(venv) = lookup(EnvVars::VIRTUAL_ENV) {
            config = config.with_python(venv_python(Path::new(&venv)));
        }
        if let Some(path) = lookup(EnvVars::STORE_FILE) {
            config = config.with_store_path(path);
        }
        if let Some(path) = lookup(EnvVars::COMPATIBILITY_FILE) {
            config = config.with_compatibility_path(path);
        }
        if let Some(python) = lookup(EnvVars::PYTHON) {
            config = config.with_python(python);
        }
        if let Some(url) = lookup(EnvVars::DOWNLOAD_URL) {
            config = config.with_download_url(url);
        }

        debug!(
            "Loaded config: shared={}, isolated={}, store={}",
            config.shared_dir.display(),
            config.isolated_dir.display(),
            config.store_path.display()
        );
        Ok(config)
    }
}

/// Interpreter of a virtualenv.
fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

/// Locate `lib/python*/site-packages` (or `Lib/site-packages` on Windows)
/// under a virtualenv root.
fn find_site_packages(venv: &Path) -> Result<PathBuf> {
    let windows_layout = venv.join("Lib").join("site-packages");
    if windows_layout.is_dir() {
        return Ok(windows_layout);
    }

    let lib_dir = venv.join("lib");
    let entries =
        std::fs::read_dir(&lib_dir).map_err(|e| ModelVaultError::io_with_path(e, &lib_dir))?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("python"))
        .map(|entry| entry.path().join("site-packages"))
        .filter(|path| path.is_dir())
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ModelVaultError::Config {
            message: format!("No site-packages directory under {}", venv.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from<'a>(
        vars: &'a HashMap<&'static str, String>,
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::new("/venv/site-packages", "/data/packages");
        assert_eq!(
            config.store_path,
            PathBuf::from("/data/packages/model_dependencies.json")
        );
        assert_eq!(config.cancel_timeout, DownloadConfig::CANCEL_TIMEOUT);
        assert!(config.download_url.starts_with("https://"));
    }

    #[test]
    fn test_explicit_env_vars() {
        let mut vars = HashMap::new();
        vars.insert(EnvVars::SHARED_DIR, "/shared".to_string());
        vars.insert(EnvVars::ISOLATED_DIR, "/isolated".to_string());
        vars.insert(EnvVars::STORE_FILE, "/state/deps.json".to_string());

        let config = ManagerConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.shared_dir, PathBuf::from("/shared"));
        assert_eq!(config.isolated_dir, PathBuf::from("/isolated"));
        assert_eq!(config.store_path, PathBuf::from("/state/deps.json"));
    }

    #[test]
    fn test_virtualenv_fallback() {
        let temp = TempDir::new().unwrap();
        let site = temp.path().join("lib/python3.11/site-packages");
        std::fs::create_dir_all(&site).unwrap();

        let mut vars = HashMap::new();
        vars.insert(EnvVars::VIRTUAL_ENV, temp.path().display().to_string());
        vars.insert(EnvVars::PYTHONPATH, "/opt/models".to_string());

        let config = ManagerConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.shared_dir, site);
        assert_eq!(config.isolated_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.python, venv_python(temp.path()));
    }

    #[test]
    fn test_explicit_python_overrides_virtualenv() {
        let mut vars = HashMap::new();
        vars.insert(EnvVars::SHARED_DIR, "/shared".to_string());
        vars.insert(EnvVars::ISOLATED_DIR, "/isolated".to_string());
        vars.insert(EnvVars::VIRTUAL_ENV, "/venv".to_string());
        vars.insert(EnvVars::PYTHON, "/usr/bin/python3".to_string());

        let config = ManagerConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.python, PathBuf::from("/usr/bin/python3"));
    }

    #[cfg(unix)]
    #[test]
    fn test_virtualenv_python_path() {
        assert_eq!(
            venv_python(Path::new("/venv")),
            PathBuf::from("/venv/bin/python")
        );
    }

    #[test]
    fn test_grace_period_builder() {
        let config = ManagerConfig::new("/shared", "/isolated")
            .with_cancel_grace_period(Duration::from_millis(250));
        assert_eq!(config.cancel_grace_period, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_shared_dir_is_config_error() {
        let vars = HashMap::new();
        let err = ManagerConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ModelVaultError::Config { .. }));
    }
}
