//! Ingestion coordinator.
//!
//! Runs every selected source concurrently through
//! `Extracting -> Mapping -> Loading -> {Completed | PartiallyFailed | Failed}`
//! and collects one [`SourceReport`] per source. Loading shares a single
//! semaphore, so the number of batches in flight against the broker is bounded
//! across all sources of a run. Configuration guarantees that no two sources
//! share a namespace and record kind, so concurrent sources never write the
//! same entity.

use std::collections::{BTreeMap, HashMap};
use std::collections::btree_map::Entry;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{LoadingConfig, PipelineConfig, SourceConfig, SourceFormat};
use crate::entity::Entity;
use crate::error::{ConfigError, DecodeError, SourceError};
use crate::fetch::{BasicClient, fetch_source};
use crate::gtfs_static::{Extracted, StaticBundle};
use crate::loader::{BatchOutcome, BrokerClient, LoadBatch};
use crate::mapper;
use crate::model::{EntityId, SourceRecord};
use crate::parser::{self, DecodedFeed};
use crate::poi;
use crate::registry::ContextRegistry;
use crate::report::{Operation, Report, RunStatus, SourceReport};
use crate::retry::retry_transient;
use crate::services::broker_api::BrokerApi;

/// Which configured sources an invocation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    All,
    Named(Vec<String>),
}

impl SourceSelector {
    /// No names means every source.
    pub fn from_names(names: Vec<String>) -> Self {
        if names.is_empty() {
            SourceSelector::All
        } else {
            SourceSelector::Named(names)
        }
    }
}

struct Shared {
    registry: Arc<ContextRegistry>,
    broker: Arc<dyn BrokerApi>,
    client: BrokerClient,
    http: BasicClient,
    loading: LoadingConfig,
    permits: Arc<Semaphore>,
}

pub struct Coordinator {
    sources: Vec<SourceConfig>,
    shared: Arc<Shared>,
}

/// Entities ready for loading plus everything that fell out on the way.
#[derive(Default)]
struct Mapped {
    records: usize,
    entities: Vec<Entity>,
    malformed: Vec<(String, String)>,
    dropped: Vec<(String, String)>,
    mapping_errors: Vec<(String, String)>,
    /// Feeds or documents that could not be read; the rest of the source still loads.
    failed_inputs: Vec<(String, String)>,
}

impl Mapped {
    fn map_all(
        &mut self,
        records: impl IntoIterator<Item = SourceRecord>,
        registry: &ContextRegistry,
        namespace: &str,
    ) -> Result<(), ConfigError> {
        for record in records {
            self.records += 1;
            let model = registry.resolve(record.kind)?;
            match mapper::map(&record, model, namespace) {
                Ok(entity) => self.entities.push(entity),
                Err(e) => {
                    debug!(kind = %record.kind, key = %record.key, error = %e, "Record not mapped");
                    self.mapping_errors
                        .push((format!("{}:{}", record.kind, record.key), e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn apply(self, report: &mut SourceReport) -> Vec<Entity> {
        report.records = self.records;
        for (subject, reason) in self.malformed {
            report.record_malformed(subject, reason);
        }
        for (subject, reason) in self.dropped {
            report.record_dropped(subject, reason);
        }
        for (subject, reason) in self.mapping_errors {
            report.record_mapping_error(subject, reason);
        }
        for (location, reason) in self.failed_inputs {
            report.record_failed_input(location, reason);
        }
        self.entities
    }
}

enum BatchRun {
    Done(BatchOutcome),
    Cancelled,
}

impl Coordinator {
    pub fn new(
        config: &PipelineConfig,
        registry: Arc<ContextRegistry>,
        broker: Arc<dyn BrokerApi>,
        http: BasicClient,
    ) -> Self {
        let client = BrokerClient::new(broker.clone(), config.loading.retry);
        Self {
            sources: config.sources.clone(),
            shared: Arc::new(Shared {
                registry,
                broker,
                client,
                http,
                loading: config.loading.clone(),
                permits: Arc::new(Semaphore::new(config.loading.concurrency)),
            }),
        }
    }

    /// Verifies that every kind any configured source may produce has a model.
    pub fn check_models(&self) -> Result<(), ConfigError> {
        for source in &self.sources {
            self.shared.registry.ensure_kinds(source.declared_kinds())?;
            debug!(source = %source.name, "Context models resolved");
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub async fn load(&self, selector: &SourceSelector, cancel: CancellationToken) -> Report {
        self.run(Operation::Load, selector, cancel).await
    }

    /// Deletes the selected sources' entities from the broker, then loads them again.
    #[tracing::instrument(skip_all)]
    pub async fn rebuild(&self, selector: &SourceSelector, cancel: CancellationToken) -> Report {
        self.run(Operation::Rebuild, selector, cancel).await
    }

    async fn run(&self, operation: Operation, selector: &SourceSelector, cancel: CancellationToken) -> Report {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, operation = operation.as_str(), ?selector, "Starting run");

        let selected: Vec<(String, Option<&SourceConfig>)> = match selector {
            SourceSelector::All => self.sources.iter().map(|s| (s.name.clone(), Some(s))).collect(),
            SourceSelector::Named(names) => names
                .iter()
                .map(|n| (n.clone(), self.sources.iter().find(|s| &s.name == n)))
                .collect(),
        };

        let mut tasks = Vec::with_capacity(selected.len());
        for (name, source) in selected {
            let Some(source) = source else {
                let reason = ConfigError::UnknownSource(name.clone()).to_string();
                error!(source = %name, "Unknown data source");
                tasks.push((name.clone(), None, Some(SourceReport::new(name).fail(reason))));
                continue;
            };
            let span = info_span!("source_run", source = %name, %run_id);
            let handle = tokio::spawn(
                run_source(self.shared.clone(), source.clone(), operation, cancel.clone()).instrument(span),
            );
            tasks.push((name, Some(handle), None));
        }

        let mut sources = Vec::with_capacity(tasks.len());
        for (name, handle, ready) in tasks {
            let report = match (handle, ready) {
                (Some(handle), _) => match handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(source = %name, error = %e, "Source task failed");
                        SourceReport::new(name).fail(format!("source task failed: {e}"))
                    }
                },
                (None, Some(report)) => report,
                (None, None) => continue,
            };
            sources.push(report);
        }

        let report = Report {
            run_id,
            operation,
            started_at,
            finished_at: Utc::now(),
            sources,
        };
        info!(%run_id, status = ?report.status(), sources = report.sources.len(), "Run finished");
        report
    }
}

fn advance(report: &mut SourceReport, status: RunStatus) {
    debug!(from = ?report.status, to = ?status, "Source run state change");
    report.status = status;
}

async fn run_source(
    shared: Arc<Shared>,
    source: SourceConfig,
    operation: Operation,
    cancel: CancellationToken,
) -> SourceReport {
    let mut report = SourceReport::new(&source.name);
    advance(&mut report, RunStatus::Extracting);

    let mapped = match extract_and_map(&shared, &source, &mut report).await {
        Ok(mapped) => mapped,
        Err(e) => {
            error!(error = %e, "Source run aborted before loading");
            return report.fail(e.to_string());
        }
    };
    let entities = mapped.apply(&mut report);

    advance(&mut report, RunStatus::Loading);
    let policy = *shared.client.policy();
    let (ready, _) = retry_transient(&policy, "readiness", || shared.broker.ready()).await;
    if let Err(e) = ready {
        error!(error = %e, "Broker not ready");
        return report.fail(format!("broker not ready: {e}"));
    }

    if operation == Operation::Rebuild {
        if let Err(e) = purge(&shared, &source, &mut report).await {
            error!(error = %e, "Rebuild purge failed");
            return report.fail(format!("rebuild purge failed: {e}"));
        }
    }

    let batches = plan_batches(entities, shared.loading.batch_size, &mut report);
    load_batches(&shared, batches, &mut report, &cancel).await;

    let report = report.finish();
    info!(
        status = ?report.status,
        records = report.records,
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        failed = report.failed,
        retries = report.retries,
        "Source run finished"
    );
    report
}

async fn extract_and_map(
    shared: &Arc<Shared>,
    source: &SourceConfig,
    report: &mut SourceReport,
) -> Result<Mapped, SourceError> {
    let registry = shared.registry.clone();
    let namespace = source.namespace.clone();
    // every kind the source may produce must resolve before any input is read
    registry.ensure_kinds(source.declared_kinds())?;

    match &source.format {
        SourceFormat::GtfsStatic { location, tables } => {
            let bundle = open_bundle(&shared.http, location, tables.clone()).await?;
            info!(version = %bundle.version_date(), kinds = ?bundle.kinds(), "Bundle opened");
            advance(report, RunStatus::Mapping);

            tokio::task::spawn_blocking(move || -> Result<Mapped, SourceError> {
                let mut mapped = Mapped::default();
                for item in bundle.records() {
                    match item? {
                        Extracted::Record(record) => {
                            mapped.map_all([record], &registry, &namespace)?;
                        }
                        Extracted::Malformed { table, row, reason } => {
                            mapped.malformed.push((format!("{table}:{row}"), reason));
                        }
                    }
                }
                Ok(mapped)
            })
            .await
            .map_err(|e| SourceError::Task(e.to_string()))?
        }
        SourceFormat::GtfsRealtime { feeds, trip_aliases } => {
            let mut mapped = Mapped::default();
            let mut records = Vec::new();
            let mut last_error = None;
            for feed in feeds {
                match read_feed(&shared.http, feed, trip_aliases).await {
                    Ok(decoded) => {
                        info!(feed = %feed, records = decoded.records.len(), dropped = decoded.dropped.len(), deleted = decoded.deleted, "Feed decoded");
                        records.extend(decoded.records);
                        mapped
                            .dropped
                            .extend(decoded.dropped.into_iter().map(|d| (d.entity_id, d.reason)));
                    }
                    Err(e) => {
                        warn!(feed = %feed, error = %e, "Skipping unreadable feed");
                        mapped.failed_inputs.push((feed.clone(), e.to_string()));
                        last_error = Some(e);
                    }
                }
            }
            if let Some(e) = last_error.filter(|_| mapped.failed_inputs.len() == feeds.len()) {
                return Err(e);
            }
            advance(report, RunStatus::Mapping);
            map_blocking(registry, namespace, records, mapped).await
        }
        SourceFormat::Poi { files } => {
            let mut mapped = Mapped::default();
            let mut records = Vec::new();
            let mut last_error = None;
            for file in files {
                match fetch(&shared.http, file).await.and_then(|bytes| poi::read_document(&bytes, Utc::now())) {
                    Ok(doc) => {
                        info!(file = %file, records = doc.records.len(), dropped = doc.dropped.len(), "Point-of-interest document read");
                        records.extend(doc.records);
                        mapped
                            .dropped
                            .extend(doc.dropped.into_iter().map(|d| (d.entity_id, d.reason)));
                    }
                    Err(e) => {
                        warn!(file = %file, error = %e, "Skipping unreadable document");
                        mapped.failed_inputs.push((file.clone(), e.to_string()));
                        last_error = Some(SourceError::from(e));
                    }
                }
            }
            if let Some(e) = last_error.filter(|_| mapped.failed_inputs.len() == files.len()) {
                return Err(e);
            }
            advance(report, RunStatus::Mapping);
            map_blocking(registry, namespace, records, mapped).await
        }
    }
}

/// Fetches and decodes one realtime feed. Errors are scoped to that feed.
async fn read_feed(
    http: &BasicClient,
    feed: &str,
    trip_aliases: &HashMap<String, String>,
) -> Result<DecodedFeed, SourceError> {
    let bytes = fetch(http, feed).await?;
    let aliases = trip_aliases.clone();
    let decoded = tokio::task::spawn_blocking(move || parser::decode(&bytes, &aliases))
        .await
        .map_err(|e| SourceError::Task(e.to_string()))??;
    Ok(decoded)
}

async fn map_blocking(
    registry: Arc<ContextRegistry>,
    namespace: String,
    records: Vec<SourceRecord>,
    mut mapped: Mapped,
) -> Result<Mapped, SourceError> {
    tokio::task::spawn_blocking(move || -> Result<Mapped, SourceError> {
        mapped.map_all(records, &registry, &namespace)?;
        Ok(mapped)
    })
    .await
    .map_err(|e| SourceError::Task(e.to_string()))?
}

async fn fetch(http: &BasicClient, location: &str) -> Result<Vec<u8>, DecodeError> {
    fetch_source(http, location)
        .await
        .map_err(|e| DecodeError::Fetch {
            location: location.to_string(),
            reason: format!("{e:#}"),
        })
}

async fn open_bundle(
    http: &BasicClient,
    location: &str,
    tables: Option<Vec<String>>,
) -> Result<StaticBundle, SourceError> {
    let dir = Path::new(location);
    if dir.is_dir() {
        let dir = dir.to_path_buf();
        return tokio::task::spawn_blocking(move || StaticBundle::from_directory(dir, tables.as_deref()))
            .await
            .map_err(|e| SourceError::Task(e.to_string()))?
            .map_err(SourceError::from);
    }

    let bytes = Bytes::from(fetch(http, location).await?);
    tokio::task::spawn_blocking(move || StaticBundle::from_archive(bytes, tables.as_deref()))
        .await
        .map_err(|e| SourceError::Task(e.to_string()))?
        .map_err(SourceError::from)
}

/// Removes this source's entities of every kind it may produce.
async fn purge(
    shared: &Arc<Shared>,
    source: &SourceConfig,
    report: &mut SourceReport,
) -> Result<(), SourceError> {
    let policy = *shared.client.policy();
    for kind in source.declared_kinds() {
        let Ok(model) = shared.registry.resolve(kind) else {
            continue;
        };
        let prefix = EntityId::prefix(&source.namespace, kind);
        let (ids, _) = retry_transient(&policy, "list_ids", || {
            shared.broker.list_ids(&model.entity_type, &model.context, &prefix)
        })
        .await;
        let ids = ids?;
        if ids.is_empty() {
            continue;
        }
        let (deleted, _) = retry_transient(&policy, "delete", || shared.broker.delete(&ids)).await;
        deleted?;
        info!(%kind, deleted = ids.len(), "Purged entities before rebuild");
        report.deleted += ids.len();
    }
    Ok(())
}

/// Keeps the newest entity per id and chunks the result into batches.
///
/// After this no two batches of a run share an entity id, so batches can be
/// submitted concurrently without reordering updates to the same entity.
fn plan_batches(entities: Vec<Entity>, batch_size: usize, report: &mut SourceReport) -> Vec<LoadBatch> {
    let mut newest: BTreeMap<EntityId, Entity> = BTreeMap::new();
    for entity in entities {
        match newest.entry(entity.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(entity);
            }
            Entry::Occupied(mut slot) => {
                let superseded = if entity.observed_at >= slot.get().observed_at {
                    slot.insert(entity)
                } else {
                    entity
                };
                warn!(id = %superseded.id, observed_at = %superseded.observed_at, "Dropping superseded update");
                report.record_stale(
                    superseded.id.as_str(),
                    format!("stale update: superseded by a newer observation than {}", superseded.observed_at),
                );
            }
        }
    }

    let entities: Vec<Entity> = newest.into_values().collect();
    entities
        .chunks(batch_size.max(1))
        .map(|chunk| LoadBatch::new(chunk.to_vec()))
        .collect()
}

async fn load_batches(
    shared: &Arc<Shared>,
    batches: Vec<LoadBatch>,
    report: &mut SourceReport,
    cancel: &CancellationToken,
) {
    info!(batches = batches.len(), "Loading batches");
    let mut tasks = Vec::with_capacity(batches.len());

    for batch in batches {
        let size = batch.entities.len();
        let shared = shared.clone();
        let cancel = cancel.clone();
        let span = info_span!("load_batch", batch = %batch.correlation_id, size);

        let task = tokio::spawn(
            async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = shared.permits.clone().acquire_owned() => permit.ok(),
                };
                // a batch that got its permit after cancellation is not sent
                let Some(_permit) = permit.filter(|_| !cancel.is_cancelled()) else {
                    debug!("Batch cancelled before submission");
                    return BatchRun::Cancelled;
                };
                BatchRun::Done(shared.client.submit(&batch).await)
            }
            .instrument(span),
        );
        tasks.push((size, task));
    }

    for (size, task) in tasks {
        match task.await {
            Ok(BatchRun::Done(outcome)) => report.absorb(&outcome),
            Ok(BatchRun::Cancelled) => report.record_cancelled(size),
            Err(e) => {
                error!(error = %e, "Batch task failed");
                report.failed += size;
                report.issue("batch", format!("batch task failed: {e}"));
            }
        }
    }
    if report.cancelled_batches > 0 {
        warn!(cancelled = report.cancelled_batches, "Run cancelled, remaining batches not submitted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Attribute, AttributeValue};
    use crate::model::RecordKind;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn entity(key: &str, secs: i64) -> Entity {
        let ts = Utc.timestamp_opt(1_714_564_800 + secs, 0).unwrap();
        Entity {
            id: EntityId::new("sofia", RecordKind::TripUpdate, key),
            entity_type: "GtfsRealtimeTripUpdate".to_string(),
            attributes: BTreeMap::from([(
                "delay".to_string(),
                Attribute {
                    value: AttributeValue::Property(json!(secs)),
                    observed_at: Some(ts),
                },
            )]),
            context: vec!["https://example.org/ctx.jsonld".to_string()],
            observed_at: ts,
        }
    }

    #[test]
    fn test_plan_batches_keeps_newest_per_id() {
        let mut report = SourceReport::new("rt");
        let batches = plan_batches(
            vec![entity("R1", 0), entity("R1", -5), entity("R2", 0), entity("R1", 10)],
            10,
            &mut report,
        );

        assert_eq!(batches.len(), 1);
        let kept: Vec<_> = batches[0].entities.iter().map(|e| (e.id.native_key().unwrap(), e.observed_at.timestamp())).collect();
        assert_eq!(kept, vec![("R1".to_string(), 1_714_564_810), ("R2".to_string(), 1_714_564_800)]);
        assert_eq!(report.stale, 2);
    }

    #[test]
    fn test_plan_batches_respects_batch_size() {
        let mut report = SourceReport::new("rt");
        let entities = (0..5).map(|i| entity(&format!("R{i}"), 0)).collect();
        let batches = plan_batches(entities, 2, &mut report);
        let sizes: Vec<_> = batches.iter().map(|b| b.entities.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(report.stale, 0);
    }

    #[test]
    fn test_selector_from_names() {
        assert_eq!(SourceSelector::from_names(vec![]), SourceSelector::All);
        assert_eq!(
            SourceSelector::from_names(vec!["a".into()]),
            SourceSelector::Named(vec!["a".into()])
        );
    }
}
