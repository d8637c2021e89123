//! Persisted model -> packages mapping.
//!
//! The store file is the single source of truth. Reference counts are never
//! persisted; they are derived with [`reference_counts`].
//!
//! A [`DependencyStore`] holds an exclusive advisory lock on `<store>.lock`
//! for as long as it lives, so only one manager process mutates a store.

mod atomic;

pub use atomic::{atomic_read_json, atomic_write_json};

use crate::error::{ModelVaultError, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Model name -> names of the packages it owns.
pub type ModelDependencies = BTreeMap<String, Vec<String>>;

/// Tally how many models reference each package.
pub fn reference_counts(dependencies: &ModelDependencies) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for packages in dependencies.values() {
        for package in packages {
            *counts.entry(package.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// JSON-backed dependency store.
#[derive(Debug)]
pub struct DependencyStore {
    path: PathBuf,
    /// Held for the store's lifetime; the lock drops with the file.
    _lock: File,
}

impl DependencyStore {
    /// Open the store at `path`, taking the store lock.
    ///
    /// Fails with `StoreLocked` if another owner holds it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ModelVaultError::io_with_path(e, parent))?;
            }
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| ModelVaultError::io_with_path(e, &lock_path))?;
        lock.try_lock_exclusive()
            .map_err(|_| ModelVaultError::StoreLocked { path: path.clone() })?;

        debug!("Opened dependency store {}", path.display());
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted mapping, or an empty one if no file exists yet.
    ///
    /// Entries with an empty package list are dropped; a committed model
    /// always owns at least one package.
    pub fn load(&self) -> Result<ModelDependencies> {
        let mut dependencies: ModelDependencies =
            atomic_read_json(&self.path)?.unwrap_or_default();

        dependencies.retain(|model, packages| {
            if packages.is_empty() {
                warn!("Dropping model {} with no packages from {}", model, self.path.display());
                false
            } else {
                true
            }
        });

        debug!(
            "Loaded {} models from {}",
            dependencies.len(),
            self.path.display()
        );
        Ok(dependencies)
    }

    /// Overwrite the persisted mapping atomically.
    pub fn save(&self, dependencies: &ModelDependencies) -> Result<()> {
        debug!(
            "Writing {} models to {}",
            dependencies.len(),
            self.path.display()
        );
        atomic_write_json(&self.path, dependencies)
    }

    /// Whether a directory entry name belongs to the store's own files
    /// (data, lock, temp files) rather than to a package.
    pub fn owns_entry(&self, name: &str) -> bool {
        self.path
            .file_name()
            .map(|store_name| name.starts_with(&*store_name.to_string_lossy()))
            .unwrap_or(false)
            || is_temp_entry(name)
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// `tempfile` names its files `.tmp<random>`.
fn is_temp_entry(name: &str) -> bool {
    name.starts_with(".tmp")
}
