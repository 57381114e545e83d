//! Pipeline configuration file.
//!
//! ```json
//! {
//!   "broker": { "url": "http://localhost:1026" },
//!   "loading": { "batch_size": 1000, "concurrency": 4 },
//!   "models": { "official": ["../models/official"], "custom": ["../models/custom"] },
//!   "sources": [
//!     { "name": "sofia-static", "namespace": "sofia", "format": "gtfs_static", "location": "data/gtfs.zip" },
//!     { "name": "sofia-rt", "namespace": "sofia", "format": "gtfs_realtime", "feeds": ["https://example.org/trip-updates.pb"] }
//!   ]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::gtfs_static;
use crate::model::{RecordKind, is_valid_namespace};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub loading: LoadingConfig,
    #[serde(default)]
    pub models: ModelPaths,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    /// Maximum entities per broker request.
    pub batch_size: usize,
    /// Maximum batches in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPaths {
    #[serde(default)]
    pub official: Vec<PathBuf>,
    #[serde(default)]
    pub custom: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Provider namespace embedded in every entity id of this source.
    pub namespace: String,
    #[serde(flatten)]
    pub format: SourceFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum SourceFormat {
    GtfsStatic {
        /// Zip file, zip URL or extracted directory.
        location: String,
        /// Restricts loading to these tables (`stops` or `stops.txt`).
        #[serde(default)]
        tables: Option<Vec<String>>,
    },
    GtfsRealtime {
        feeds: Vec<String>,
        /// Realtime trip id -> static trip id.
        #[serde(default)]
        trip_aliases: HashMap<String, String>,
    },
    Poi {
        files: Vec<String>,
    },
}

impl SourceConfig {
    /// Every record kind this source may produce.
    pub fn declared_kinds(&self) -> Vec<RecordKind> {
        match &self.format {
            SourceFormat::GtfsStatic { tables, .. } => gtfs_static::selected_tables(tables.as_deref())
                .into_iter()
                .map(|t| t.kind)
                .collect(),
            SourceFormat::GtfsRealtime { .. } => RecordKind::REALTIME.to_vec(),
            SourceFormat::Poi { .. } => vec![RecordKind::Poi],
        }
    }
}

impl PipelineConfig {
    /// Reads and validates a config file. Relative paths inside it resolve
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        debug!(path = %path.display(), "Loading pipeline configuration");
        Self::from_json(&text, base)
    }

    pub fn from_json(text: &str, base: &Path) -> Result<Self, ConfigError> {
        let mut config: PipelineConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in self.models.official.iter_mut().chain(self.models.custom.iter_mut()) {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        for source in &mut self.sources {
            match &mut source.format {
                SourceFormat::GtfsStatic { location, .. } => *location = resolve_location(base, location),
                SourceFormat::GtfsRealtime { feeds, .. } => {
                    for feed in feeds {
                        *feed = resolve_location(base, feed);
                    }
                }
                SourceFormat::Poi { files } => {
                    for file in files {
                        *file = resolve_location(base, file);
                    }
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.broker.url.trim().is_empty() {
            return invalid("broker.url is empty".to_string());
        }
        if self.loading.batch_size == 0 {
            return invalid("loading.batch_size must be greater than 0".to_string());
        }
        if self.loading.concurrency == 0 {
            return invalid("loading.concurrency must be greater than 0".to_string());
        }
        if self.loading.retry.max_attempts == 0 {
            return invalid("loading.retry.max_attempts must be at least 1".to_string());
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return invalid("source with empty name".to_string());
            }
            if !names.insert(source.name.as_str()) {
                return invalid(format!("duplicate source name '{}'", source.name));
            }
            if !is_valid_namespace(&source.namespace) {
                return invalid(format!(
                    "source '{}' has invalid namespace '{}' (allowed: A-Z a-z 0-9 . _ -)",
                    source.name, source.namespace
                ));
            }
            match &source.format {
                SourceFormat::GtfsStatic { tables: Some(tables), .. } => {
                    if let Some(unknown) = tables.iter().find(|t| gtfs_static::table_spec(t).is_none()) {
                        return invalid(format!("source '{}' names unknown table '{unknown}'", source.name));
                    }
                }
                SourceFormat::GtfsRealtime { feeds, .. } if feeds.is_empty() => {
                    return invalid(format!("source '{}' has no feeds", source.name));
                }
                SourceFormat::Poi { files } if files.is_empty() => {
                    return invalid(format!("source '{}' has no files", source.name));
                }
                _ => {}
            }
        }

        // ids embed only namespace and kind, so two sources sharing both would
        // race on the same entities and purge each other on rebuild
        let mut claimed: HashMap<(&str, RecordKind), &str> = HashMap::new();
        for source in &self.sources {
            for kind in source.declared_kinds() {
                if let Some(other) = claimed.insert((source.namespace.as_str(), kind), source.name.as_str()) {
                    return invalid(format!(
                        "sources '{other}' and '{}' both produce {kind} entities in namespace '{}'",
                        source.name, source.namespace
                    ));
                }
            }
        }
        Ok(())
    }
}

fn resolve_location(base: &Path, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    let path = Path::new(location);
    if path.is_relative() {
        base.join(path).display().to_string()
    } else {
        location.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "broker": { "url": "http://localhost:1026" },
        "loading": { "batch_size": 50 },
        "models": { "official": ["models/official"] },
        "sources": [
            { "name": "static", "namespace": "sofia", "format": "gtfs_static", "location": "gtfs.zip", "tables": ["stops", "routes.txt"] },
            { "name": "rt", "namespace": "sofia", "format": "gtfs_realtime", "feeds": ["https://example.org/rt.pb"], "trip_aliases": { "x": "R1" } },
            { "name": "poi", "namespace": "sofia", "format": "poi", "files": ["/abs/parks.json"] }
        ]
    }"#;

    #[test]
    fn test_parses_with_defaults() {
        let config = PipelineConfig::from_json(SAMPLE, Path::new("/etc/pipeline")).unwrap();
        assert_eq!(config.broker.timeout_secs, 30);
        assert_eq!(config.loading.batch_size, 50);
        assert_eq!(config.loading.concurrency, 4);
        assert_eq!(config.loading.retry, RetryPolicy::default());
        assert_eq!(config.sources.len(), 3);
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let config = PipelineConfig::from_json(SAMPLE, Path::new("/etc/pipeline")).unwrap();
        assert_eq!(config.models.official, vec![PathBuf::from("/etc/pipeline/models/official")]);
        match &config.source("static").unwrap().format {
            SourceFormat::GtfsStatic { location, .. } => assert_eq!(location, "/etc/pipeline/gtfs.zip"),
            other => panic!("unexpected format {other:?}"),
        }
        match &config.source("rt").unwrap().format {
            SourceFormat::GtfsRealtime { feeds, trip_aliases } => {
                assert_eq!(feeds, &vec!["https://example.org/rt.pb".to_string()]);
                assert_eq!(trip_aliases.get("x").map(String::as_str), Some("R1"));
            }
            other => panic!("unexpected format {other:?}"),
        }
    }

    #[test]
    fn test_declared_kinds_follow_table_filter() {
        let config = PipelineConfig::from_json(SAMPLE, Path::new(".")).unwrap();
        assert_eq!(
            config.source("static").unwrap().declared_kinds(),
            vec![RecordKind::Stop, RecordKind::Route]
        );
        assert_eq!(config.source("poi").unwrap().declared_kinds(), vec![RecordKind::Poi]);
    }

    #[test]
    fn test_rejects_bad_namespace() {
        let text = SAMPLE.replacen("\"namespace\": \"sofia\"", "\"namespace\": \"so:fia\"", 1);
        assert!(matches!(
            PipelineConfig::from_json(&text, Path::new(".")),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_names_and_zero_batch() {
        let dup = SAMPLE.replace("\"name\": \"rt\"", "\"name\": \"static\"");
        assert!(PipelineConfig::from_json(&dup, Path::new(".")).is_err());
        let zero = SAMPLE.replace("\"batch_size\": 50", "\"batch_size\": 0");
        assert!(PipelineConfig::from_json(&zero, Path::new(".")).is_err());
    }

    #[test]
    fn test_rejects_sources_sharing_namespace_and_kind() {
        let text = SAMPLE.replace(
            r#"{ "name": "poi","#,
            r#"{ "name": "rt-alerts", "namespace": "sofia", "format": "gtfs_realtime", "feeds": ["alerts.pb"] },
            { "name": "poi","#,
        );
        match PipelineConfig::from_json(&text, Path::new(".")) {
            Err(ConfigError::Invalid(reason)) => {
                assert!(reason.contains("'rt' and 'rt-alerts'"), "{reason}");
            }
            other => panic!("expected overlap to be rejected, got {other:?}"),
        }

        let elsewhere = text.replace(
            r#""name": "rt-alerts", "namespace": "sofia""#,
            r#""name": "rt-alerts", "namespace": "plovdiv""#,
        );
        assert!(PipelineConfig::from_json(&elsewhere, Path::new(".")).is_ok());
    }

    #[test]
    fn test_static_sources_with_disjoint_tables_may_share_namespace() {
        let text = SAMPLE.replace(
            r#"{ "name": "rt","#,
            r#"{ "name": "shapes", "namespace": "sofia", "format": "gtfs_static", "location": "shapes.zip", "tables": ["shapes"] },
            { "name": "rt","#,
        );
        assert!(PipelineConfig::from_json(&text, Path::new(".")).is_ok());
    }

    #[test]
    fn test_rejects_unknown_table() {
        let text = SAMPLE.replace("\"routes.txt\"", "\"frequencies\"");
        assert!(PipelineConfig::from_json(&text, Path::new(".")).is_err());
    }
}
