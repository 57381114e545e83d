//! Context model registry.
//!
//! Holds one [`ContextModel`] per [`RecordKind`], loaded once at startup from
//! declarative JSON files. Official definitions load first; custom definitions
//! are an overlay and replace the official model for the same kind.
//!
//! A definition file is a JSON array of models:
//! ```json
//! [
//!   {
//!     "kind": "stop",
//!     "entity_type": "GtfsStop",
//!     "context": ["https://smartdatamodels.org/context.jsonld"],
//!     "attributes": [
//!       { "target": "name", "rule": "property", "source": "stop_name", "mandatory": true },
//!       { "target": "location", "rule": "geo_point", "lat": "stop_lat", "lon": "stop_lon" },
//!       { "target": "hasParentStation", "rule": "relationship", "source": "parent_station", "object": "stop" }
//!     ]
//!   }
//! ]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::model::RecordKind;

/// How a source field is converted into a property value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Text,
    Integer,
    Float,
    /// GTFS `YYYYMMDD` date, published as ISO `YYYY-MM-DD`.
    Date,
    /// Structured values passed through as JSON.
    Json,
}

/// Where an attribute's value comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AttributeSource {
    Property {
        source: String,
        #[serde(default)]
        value: ValueType,
    },
    /// GeoJSON point built from two coordinate fields.
    GeoPoint { lat: String, lon: String },
    /// Field that already holds a GeoJSON geometry.
    GeoJson { source: String },
    /// Reference to the entity of kind `object` keyed by the field value.
    Relationship { source: String, object: RecordKind },
}

impl AttributeSource {
    /// Source fields this attribute consumes.
    pub fn source_fields(&self) -> Vec<&str> {
        match self {
            AttributeSource::Property { source, .. }
            | AttributeSource::GeoJson { source }
            | AttributeSource::Relationship { source, .. } => vec![source.as_str()],
            AttributeSource::GeoPoint { lat, lon } => vec![lat.as_str(), lon.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttributeRule {
    pub target: String,
    #[serde(flatten)]
    pub source: AttributeSource,
    #[serde(default)]
    pub mandatory: bool,
}

/// Mapping declaration for one record kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContextModel {
    pub kind: RecordKind,
    pub entity_type: String,
    pub context: Vec<String>,
    pub attributes: Vec<AttributeRule>,
}

impl ContextModel {
    fn validate(&self, path: &str) -> Result<(), ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedModel {
            path: path.to_string(),
            reason,
        };

        if self.entity_type.trim().is_empty() {
            return Err(malformed(format!("model for '{}' has no entity_type", self.kind)));
        }
        if self.context.is_empty() || self.context.iter().any(|c| c.trim().is_empty()) {
            return Err(malformed(format!("model for '{}' has no @context", self.kind)));
        }

        let mut targets = HashSet::new();
        for rule in &self.attributes {
            if matches!(rule.target.as_str(), "id" | "type" | "@context") || rule.target.is_empty() {
                return Err(malformed(format!(
                    "model for '{}' uses reserved attribute name '{}'",
                    self.kind, rule.target
                )));
            }
            if !targets.insert(rule.target.as_str()) {
                return Err(malformed(format!(
                    "model for '{}' maps '{}' twice",
                    self.kind, rule.target
                )));
            }
        }
        Ok(())
    }
}

/// Immutable, process-wide set of context models.
#[derive(Debug, Clone, Default)]
pub struct ContextRegistry {
    models: BTreeMap<RecordKind, ContextModel>,
}

impl ContextRegistry {
    /// Loads official definitions, then applies the custom overlay.
    pub fn load(official: &[PathBuf], custom: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut registry = ContextRegistry::default();

        for (layer, paths) in [("official", official), ("custom", custom)] {
            let mut seen = HashSet::new();
            for file in expand_paths(paths)? {
                let shown = file.display().to_string();
                for model in read_models(&file)? {
                    model.validate(&shown)?;
                    if !seen.insert(model.kind) {
                        return Err(ConfigError::DuplicateModel {
                            kind: model.kind,
                            layer,
                        });
                    }
                    if registry.models.contains_key(&model.kind) {
                        debug!(kind = %model.kind, file = %shown, "Custom model overrides official definition");
                    }
                    registry.models.insert(model.kind, model);
                }
            }
        }

        info!(models = registry.models.len(), "Context model registry loaded");
        Ok(registry)
    }

    /// Builds a registry from in-memory models; later entries override earlier ones.
    pub fn from_models(models: impl IntoIterator<Item = ContextModel>) -> Result<Self, ConfigError> {
        let mut registry = ContextRegistry::default();
        for model in models {
            model.validate("<inline>")?;
            registry.models.insert(model.kind, model);
        }
        Ok(registry)
    }

    pub fn resolve(&self, kind: RecordKind) -> Result<&ContextModel, ConfigError> {
        self.models
            .get(&kind)
            .ok_or(ConfigError::UnresolvedKind(kind))
    }

    /// Fails on the first kind without a model.
    pub fn ensure_kinds(
        &self,
        kinds: impl IntoIterator<Item = RecordKind>,
    ) -> Result<(), ConfigError> {
        for kind in kinds {
            self.resolve(kind)?;
        }
        Ok(())
    }

    pub fn models(&self) -> impl Iterator<Item = &ContextModel> {
        self.models.values()
    }
}

/// Files are taken as-is; directories contribute their `*.json` files in name order.
fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let entries = std::fs::read_dir(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let mut jsons: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
                .collect();
            jsons.sort();
            files.extend(jsons);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn read_models(path: &Path) -> Result<Vec<ContextModel>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::MalformedModel {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
