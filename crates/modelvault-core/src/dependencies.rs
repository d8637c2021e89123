//! Reference-counted ownership of packages by models.
//!
//! Installs compute the new mapping, move packages into isolated storage,
//! persist once, and only then replace the in-memory state. Removals persist
//! first and delete afterwards, so a failed deletion leaves an orphan rather
//! than a tracked model with missing packages. If persisting fails the
//! in-memory view keeps the last committed mapping.

use crate::environment::{diff, EnvironmentSnapshot, InstallManifest};
use crate::error::{ModelVaultError, Result};
use crate::relocator::{validate_package_name, PackageRelocator};
use crate::store::{reference_counts, DependencyStore, ModelDependencies};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Result of comparing isolated storage with the derived reference counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageAudit {
    /// In isolated storage but referenced by no model.
    pub orphaned: Vec<String>,
    /// Referenced by some model but absent from isolated storage.
    pub missing: Vec<String>,
}

impl StorageAudit {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty()
    }
}

/// Tracks which models own which packages.
#[derive(Debug)]
pub struct DependencyManager {
    store: DependencyStore,
    relocator: PackageRelocator,
    dependencies: ModelDependencies,
    references: BTreeMap<String, usize>,
}

impl DependencyManager {
    /// Open the store and derive reference counts from it.
    pub fn new(store: DependencyStore, relocator: PackageRelocator) -> Result<Self> {
        let dependencies = store.load()?;
        for packages in dependencies.values() {
            for package in packages {
                validate_package_name(package)?;
            }
        }
        let references = reference_counts(&dependencies);

        info!(
            "Tracking {} models sharing {} packages ({})",
            dependencies.len(),
            references.len(),
            store.path().display()
        );
        Ok(Self {
            store,
            relocator,
            dependencies,
            references,
        })
    }

    /// Currently tracked models, sorted.
    pub fn models(&self) -> Vec<String> {
        self.dependencies.keys().cloned().collect()
    }

    pub fn is_tracked(&self, model: &str) -> bool {
        self.dependencies.contains_key(model)
    }

    /// Packages owned by `model`, if tracked.
    pub fn packages(&self, model: &str) -> Option<&[String]> {
        self.dependencies.get(model).map(Vec::as_slice)
    }

    /// Number of tracked models that own `package`.
    pub fn reference_count(&self, package: &str) -> usize {
        self.references.get(package).copied().unwrap_or(0)
    }

    /// Commit a completed download.
    ///
    /// Each package's count goes up by one. On a 0 -> 1 transition the
    /// package moves into isolated storage; otherwise the isolated copy
    /// already exists and the freshly installed shared copy is dropped.
    pub fn handle_download_complete(&mut self, model: &str, manifest: &InstallManifest) -> Result<()> {
        if self.is_tracked(model) {
            return Err(ModelVaultError::ModelAlreadyTracked {
                model: model.to_string(),
            });
        }
        if manifest.is_empty() {
            return Err(ModelVaultError::EmptyManifest {
                model: model.to_string(),
            });
        }
        for package in &manifest.packages {
            validate_package_name(package)?;
        }

        let mut references = self.references.clone();
        for package in &manifest.packages {
            let count = references.entry(package.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.relocator.on_package_first_referenced(package)?;
            } else {
                self.relocator.discard_shared_duplicate(package)?;
            }
        }

        let mut dependencies = self.dependencies.clone();
        dependencies.insert(model.to_string(), manifest.packages.iter().cloned().collect());
        self.store.save(&dependencies)?;

        self.dependencies = dependencies;
        self.references = references;
        info!("Model {} installed with {} packages", model, manifest.len());
        Ok(())
    }

    /// Commit a completed download whose manifest is whatever appeared in
    /// the shared directory since `before`.
    pub fn handle_download_complete_since(
        &mut self,
        model: &str,
        before: &EnvironmentSnapshot,
    ) -> Result<()> {
        let manifest = InstallManifest::since(before, self.relocator.shared_dir())?;
        self.handle_download_complete(model, &manifest)
    }

    /// Roll back an aborted download: delete everything that appeared in
    /// the shared directory since `before`. The store is not touched.
    ///
    /// Returns the purged package names.
    pub fn handle_download_cancel(&self, before: &EnvironmentSnapshot) -> Result<Vec<String>> {
        let after = EnvironmentSnapshot::capture(self.relocator.shared_dir())?;
        let change = diff(before, &after);
        if !change.removed.is_empty() {
            warn!(
                "Packages disappeared from the shared directory during the download: {:?}",
                change.removed
            );
        }
        self.relocator.purge_from_shared_directory(&change.added)
    }

    /// Delete isolated copies of `manifest` packages that no model owns.
    ///
    /// Cleans up after a commit that relocated packages but failed to
    /// persist. Packages still referenced are left alone.
    pub fn release_uncommitted(&self, manifest: &InstallManifest) -> Result<Vec<String>> {
        let mut released = Vec::new();
        for package in &manifest.packages {
            if self.reference_count(package) > 0 || !self.relocator.is_isolated(package)? {
                continue;
            }
            let mut count = 1;
            self.relocator.on_package_reference_dropped(package, &mut count)?;
            released.push(package.clone());
        }
        if !released.is_empty() {
            warn!("Released uncommitted packages from isolated storage: {:?}", released);
        }
        Ok(released)
    }

    /// Remove a tracked model and release its packages.
    ///
    /// The updated mapping is persisted before anything is deleted. Released
    /// packages whose isolated copy cannot be deleted stay behind as orphans
    /// for `audit` and `prune_orphans`; the removal itself still stands.
    ///
    /// Untracked models are a precondition failure here (`UnknownModel`).
    /// Returns the released packages that were left behind.
    pub fn handle_model_remove(&mut self, model: &str) -> Result<Vec<String>> {
        let packages = self
            .dependencies
            .get(model)
            .cloned()
            .ok_or_else(|| ModelVaultError::UnknownModel {
                model: model.to_string(),
            })?;

        let mut references = self.references.clone();
        let mut released = Vec::new();
        for package in &packages {
            match references.get_mut(package) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    references.remove(package);
                    released.push(package.clone());
                }
                None => warn!("Package {} of {} had no reference count", package, model),
            }
        }

        let mut dependencies = self.dependencies.clone();
        dependencies.remove(model);
        self.store.save(&dependencies)?;

        self.dependencies = dependencies;
        self.references = references;
        info!("Model {} removed", model);

        let mut left_behind = Vec::new();
        for package in released {
            let mut count = 1;
            if let Err(e) = self.relocator.on_package_reference_dropped(&package, &mut count) {
                warn!("Failed to delete released package {}: {}", package, e);
                left_behind.push(package);
            }
        }
        Ok(left_behind)
    }

    /// Compare isolated storage against the reference counts.
    pub fn audit(&self) -> Result<StorageAudit> {
        let isolated = EnvironmentSnapshot::capture(self.relocator.isolated_dir())?;

        let orphaned = isolated
            .packages()
            .iter()
            .filter(|name| !self.store.owns_entry(name))
            .filter(|name| self.reference_count(name) == 0)
            .cloned()
            .collect();
        let missing = self
            .references
            .keys()
            .filter(|name| !isolated.contains(name))
            .cloned()
            .collect();

        let audit = StorageAudit { orphaned, missing };
        if !audit.is_clean() {
            warn!(
                "Isolated storage audit: {} orphaned, {} missing",
                audit.orphaned.len(),
                audit.missing.len()
            );
        }
        Ok(audit)
    }

    /// Delete orphaned entries from isolated storage.
    pub fn prune_orphans(&self) -> Result<Vec<String>> {
        let audit = self.audit()?;
        for package in &audit.orphaned {
            let mut count = 1;
            self.relocator.on_package_reference_dropped(package, &mut count)?;
            debug!("Pruned orphaned package {}", package);
        }
        Ok(audit.orphaned)
    }
}
