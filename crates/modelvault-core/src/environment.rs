//! Snapshots of the shared package directory.
//!
//! The package installer does not report what it wrote, so the only signal
//! available is which entries appeared in the shared directory during the
//! download window. This assumes nothing else mutates the directory inside
//! that window.

use crate::error::{ModelVaultError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

/// Set of entry names present in a package directory at one moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    packages: BTreeSet<String>,
}

impl EnvironmentSnapshot {
    /// Read the current entry names of `dir`.
    pub fn capture(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| ModelVaultError::io_with_path(e, dir))?;

        let mut packages = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| ModelVaultError::io_with_path(e, dir))?;
            match entry.file_name().into_string() {
                Ok(name) => {
                    packages.insert(name);
                }
                Err(name) => warn!("Skipping non UTF-8 entry {:?} in {}", name, dir.display()),
            }
        }

        Ok(Self { packages })
    }

    pub fn contains(&self, package: &str) -> bool {
        self.packages.contains(package)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn packages(&self) -> &BTreeSet<String> {
        &self.packages
    }
}

impl FromIterator<String> for EnvironmentSnapshot {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            packages: iter.into_iter().collect(),
        }
    }
}

/// Difference between two snapshots of the same directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentDiff {
    /// Present after, absent before.
    pub added: BTreeSet<String>,
    /// Present before, absent after.
    pub removed: BTreeSet<String>,
}

impl EnvironmentDiff {
    /// `EnvironmentRace` if anything disappeared during the window.
    pub fn ensure_no_removals(&self) -> Result<()> {
        if self.removed.is_empty() {
            Ok(())
        } else {
            Err(ModelVaultError::EnvironmentRace {
                missing: self.removed.iter().cloned().collect(),
            })
        }
    }

    pub fn into_manifest(self) -> InstallManifest {
        InstallManifest {
            packages: self.added,
        }
    }
}

/// Compare two snapshots.
pub fn diff(before: &EnvironmentSnapshot, after: &EnvironmentSnapshot) -> EnvironmentDiff {
    EnvironmentDiff {
        added: after.packages.difference(&before.packages).cloned().collect(),
        removed: before.packages.difference(&after.packages).cloned().collect(),
    }
}

/// Packages one fetch installed into the shared directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    pub packages: BTreeSet<String>,
}

impl InstallManifest {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    /// Packages that appeared in `dir` since `before` was taken.
    pub fn since(before: &EnvironmentSnapshot, dir: &Path) -> Result<Self> {
        let after = EnvironmentSnapshot::capture(dir)?;
        Ok(diff(before, &after).into_manifest())
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(names: &[&str]) -> EnvironmentSnapshot {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_capture_lists_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("numpy")).unwrap();
        std::fs::write(tmp.path().join("distutils-precedence.pth"), "").unwrap();

        let snap = EnvironmentSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(snap.len(), 2);
        assert!(snap.contains("numpy"));
        assert!(snap.contains("distutils-precedence.pth"));
    }

    #[test]
    fn test_capture_missing_directory_is_error() {
        let tmp = TempDir::new().unwrap();
        let result = EnvironmentSnapshot::capture(&tmp.path().join("missing"));
        assert!(matches!(result, Err(ModelVaultError::Io { .. })));
    }

    #[test]
    fn test_diff() {
        let before = snapshot(&["numpy", "spacy"]);
        let after = snapshot(&["numpy", "spacy", "en_core_web_sm", "pkgB"]);

        let d = diff(&before, &after);
        assert_eq!(
            d.added.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["en_core_web_sm", "pkgB"]
        );
        assert!(d.removed.is_empty());
        assert!(d.ensure_no_removals().is_ok());
    }

    #[test]
    fn test_diff_flags_disappearances() {
        let before = snapshot(&["numpy-1.26.4.dist-info", "spacy"]);
        let after = snapshot(&["numpy-2.0.0.dist-info", "spacy"]);

        let d = diff(&before, &after);
        match d.ensure_no_removals() {
            Err(ModelVaultError::EnvironmentRace { missing }) => {
                assert_eq!(missing, vec!["numpy-1.26.4.dist-info".to_string()])
            }
            other => panic!("expected race, got {other:?}"),
        }
    }

    #[test]
    fn test_manifest_since() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("spacy")).unwrap();
        let before = EnvironmentSnapshot::capture(tmp.path()).unwrap();

        std::fs::create_dir(tmp.path().join("en_core_web_sm")).unwrap();
        let manifest = InstallManifest::since(&before, tmp.path()).unwrap();

        assert_eq!(manifest, InstallManifest::new(["en_core_web_sm"]));
    }
}
