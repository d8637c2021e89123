//! Moves packages between the shared directory and isolated storage.
//!
//! Isolated storage keeps exactly one copy of every package some tracked
//! model references. The relocator only acts on reference-count transitions
//! it is told about; the counts themselves belong to the dependency manager.

use crate::error::{ModelVaultError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Reject names that are not a single plain path component.
pub fn validate_package_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(ModelVaultError::Validation {
            field: "package".to_string(),
            message: format!("invalid package name {:?}", name),
        });
    }
    Ok(())
}

/// Relocates package entries between the two directories.
#[derive(Debug, Clone)]
pub struct PackageRelocator {
    shared_dir: PathBuf,
    isolated_dir: PathBuf,
}

impl PackageRelocator {
    /// Create a relocator, creating isolated storage if absent.
    pub fn new(shared_dir: impl Into<PathBuf>, isolated_dir: impl Into<PathBuf>) -> Result<Self> {
        let isolated_dir = isolated_dir.into();
        fs::create_dir_all(&isolated_dir)
            .map_err(|e| ModelVaultError::io_with_path(e, &isolated_dir))?;
        Ok(Self {
            shared_dir: shared_dir.into(),
            isolated_dir,
        })
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn isolated_dir(&self) -> &Path {
        &self.isolated_dir
    }

    pub fn shared_path(&self, package: &str) -> Result<PathBuf> {
        validate_package_name(package)?;
        Ok(self.shared_dir.join(package))
    }

    pub fn isolated_path(&self, package: &str) -> Result<PathBuf> {
        validate_package_name(package)?;
        Ok(self.isolated_dir.join(package))
    }

    pub fn is_isolated(&self, package: &str) -> Result<bool> {
        Ok(entry_exists(&self.isolated_path(package)?))
    }

    /// Handle a 0 -> 1 reference transition.
    ///
    /// Moves the shared copy into isolated storage, or drops it if an
    /// isolated copy is already there.
    pub fn on_package_first_referenced(&self, package: &str) -> Result<()> {
        let source = self.shared_path(package)?;
        let target = self.isolated_path(package)?;

        if entry_exists(&target) {
            debug!("{} already isolated, dropping shared copy", package);
            if entry_exists(&source) {
                remove_entry(&source)?;
            }
            return Ok(());
        }

        if !entry_exists(&source) {
            return Err(ModelVaultError::Io {
                message: format!("Package {} is missing from the shared directory", package),
                path: Some(source),
                source: None,
            });
        }

        move_entry(&source, &target)?;
        debug!("Isolated package {}", package);
        Ok(())
    }

    /// Handle an n -> n+1 transition with n > 0: the isolated copy exists,
    /// so a freshly installed shared copy is a duplicate.
    pub fn discard_shared_duplicate(&self, package: &str) -> Result<()> {
        let source = self.shared_path(package)?;
        if entry_exists(&source) {
            debug!("Removing shared duplicate of {}", package);
            remove_entry(&source)?;
        }
        if !self.is_isolated(package)? {
            warn!("Package {} is referenced but not in isolated storage", package);
        }
        Ok(())
    }

    /// Decrement `count`; delete the isolated copy when it reaches zero.
    ///
    /// Returns `true` if the package was deleted.
    pub fn on_package_reference_dropped(&self, package: &str, count: &mut usize) -> Result<bool> {
        let target = self.isolated_path(package)?;
        *count = count.saturating_sub(1);
        if *count > 0 {
            return Ok(false);
        }

        if entry_exists(&target) {
            remove_entry(&target)?;
            debug!("Deleted unreferenced package {}", package);
        } else {
            warn!("Unreferenced package {} was already gone", package);
        }
        Ok(true)
    }

    /// Rollback: delete packages an aborted download left in the shared
    /// directory. Entries already gone are skipped.
    pub fn purge_from_shared_directory<'a, I>(&self, packages: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut purged = Vec::new();
        for package in packages {
            let path = self.shared_path(package)?;
            if entry_exists(&path) {
                remove_entry(&path)?;
                purged.push(package.clone());
            }
        }
        if !purged.is_empty() {
            info!("Purged {} packages from {}", purged.len(), self.shared_dir.display());
        }
        Ok(purged)
    }
}

/// True for files, directories and dangling symlinks alike.
fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_entry(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| ModelVaultError::io_with_path(e, path))?;
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| ModelVaultError::io_with_path(e, path))
}

/// Rename, falling back to copy + delete when the directories live on
/// different filesystems.
fn move_entry(source: &Path, target: &Path) -> Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                "rename {} -> {} failed ({}), copying instead",
                source.display(),
                target.display(),
                rename_err
            );
            if let Err(e) = copy_entry(source, target) {
                if entry_exists(target) {
                    let _ = remove_entry(target);
                }
                return Err(e);
            }
            remove_entry(source)
        }
    }
}

fn copy_entry(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| ModelVaultError::Io {
            message: format!("Failed to walk {}: {}", source.display(), e),
            path: Some(source.to_path_buf()),
            source: e.into_io_error(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| ModelVaultError::Io {
                message: e.to_string(),
                path: Some(entry.path().to_path_buf()),
                source: None,
            })?;
        let dest = if relative.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| ModelVaultError::io_with_path(e, &dest))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest).map_err(|e| ModelVaultError::io_with_path(e, &dest))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> Result<()> {
    let link = fs::read_link(source).map_err(|e| ModelVaultError::io_with_path(e, source))?;
    std::os::unix::fs::symlink(&link, dest).map_err(|e| ModelVaultError::io_with_path(e, dest))
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, dest: &Path) -> Result<()> {
    fs::copy(source, dest)
        .map(|_| ())
        .map_err(|e| ModelVaultError::io_with_path(e, dest))
}
