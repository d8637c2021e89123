//! Version-resolution table for downloadable models.
//!
//! The table is a JSON object mapping each model name to its compatible
//! versions, newest first:
//!
//! ```json
//! { "en_core_web_sm": ["3.7.1", "3.7.0"] }
//! ```

use crate::error::{ModelVaultError, Result};
use crate::store::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// A model pinned to a concrete, fetchable version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub name: String,
    pub version: String,
}

impl ResolvedModel {
    /// Distribution name, e.g. `en_core_web_sm-3.7.1`.
    pub fn package_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Wheel file name as published for the model.
    pub fn wheel_file_name(&self) -> String {
        format!("{}-py3-none-any.whl", self.package_name())
    }

    /// Wheel URL under the release download base.
    pub fn wheel_url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.package_name(),
            self.wheel_file_name()
        )
    }
}

impl fmt::Display for ResolvedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.package_name())
    }
}

/// Model name -> compatible versions, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatibilityTable {
    models: BTreeMap<String, Vec<String>>,
}

impl CompatibilityTable {
    /// Load the table from disk. A missing file yields an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        match atomic_read_json::<Self>(path)? {
            Some(table) => {
                debug!("Loaded {} model versions from {}", table.models.len(), path.display());
                Ok(table)
            }
            None => {
                warn!(
                    "Compatibility table {} not found, no model can be resolved",
                    path.display()
                );
                Ok(Self::default())
            }
        }
    }

    pub fn insert(&mut self, model: impl Into<String>, versions: Vec<String>) {
        self.models.insert(model.into(), versions);
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Pin `model` to its newest compatible version.
    pub fn resolve(&self, model: &str) -> Result<ResolvedModel> {
        let version = self
            .models
            .get(model)
            .and_then(|versions| versions.first())
            .ok_or_else(|| ModelVaultError::UnresolvedModel {
                model: model.to_string(),
            })?;

        Ok(ResolvedModel {
            name: model.to_string(),
            version: version.clone(),
        })
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<String>)> for CompatibilityTable {
    fn from_iter<I: IntoIterator<Item = (S, Vec<String>)>>(iter: I) -> Self {
        Self {
            models: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_picks_first_version() {
        let table: CompatibilityTable = [(
            "en_core_web_sm",
            vec!["3.7.1".to_string(), "3.7.0".to_string()],
        )]
        .into_iter()
        .collect();

        let resolved = table.resolve("en_core_web_sm").unwrap();
        assert_eq!(resolved.version, "3.7.1");
        assert_eq!(resolved.package_name(), "en_core_web_sm-3.7.1");
    }

    #[test]
    fn test_resolve_unknown_model() {
        let table = CompatibilityTable::default();
        assert!(matches!(
            table.resolve("xx_ent_wiki_sm"),
            Err(ModelVaultError::UnresolvedModel { .. })
        ));
    }

    #[test]
    fn test_resolve_model_without_versions() {
        let mut table = CompatibilityTable::default();
        table.insert("en_core_web_sm", vec![]);
        assert!(table.resolve("en_core_web_sm").is_err());
    }

    #[test]
    fn test_wheel_url() {
        let resolved = ResolvedModel {
            name: "es_core_news_sm".to_string(),
            version: "3.7.0".to_string(),
        };
        assert_eq!(
            resolved.wheel_url("https://example.com/download/"),
            "https://example.com/download/es_core_news_sm-3.7.0/es_core_news_sm-3.7.0-py3-none-any.whl"
        );
    }

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spacy_model_compatibility.json");
        std::fs::write(
            &path,
            r#"{"en_core_web_sm": ["3.7.1"], "fr_core_news_sm": ["3.7.0", "3.6.0"]}"#,
        )
        .unwrap();

        let table = CompatibilityTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("fr_core_news_sm").unwrap().version, "3.7.0");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let table = CompatibilityTable::load(&tmp.path().join("missing.json")).unwrap();
        assert!(table.is_empty());
    }
}
