use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gtfs_ngsi_loader::config::PipelineConfig;
use gtfs_ngsi_loader::coordinator::{Coordinator, SourceSelector};
use gtfs_ngsi_loader::entity::{AttributeValue, Entity};
use gtfs_ngsi_loader::error::BrokerError;
use gtfs_ngsi_loader::fetch::BasicClient;
use gtfs_ngsi_loader::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate};
use gtfs_ngsi_loader::infra::memory::MemoryBroker;
use gtfs_ngsi_loader::model::{EntityId, RecordKind};
use gtfs_ngsi_loader::registry::ContextRegistry;
use gtfs_ngsi_loader::report::RunStatus;
use gtfs_ngsi_loader::services::broker_api::{BrokerApi, UpsertResponse};
use prost::Message;
use serde_json::json;
use std::collections::HashMap;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zip::write::FileOptions;

fn official_models() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("models/official")
}

fn registry() -> Arc<ContextRegistry> {
    Arc::new(ContextRegistry::load(&[official_models()], &[]).unwrap())
}

fn config(dir: &TempDir, sources: serde_json::Value, batch_size: usize, concurrency: usize) -> PipelineConfig {
    let text = json!({
        "broker": { "url": "http://localhost:1026" },
        "loading": {
            "batch_size": batch_size,
            "concurrency": concurrency,
            "retry": { "max_attempts": 3, "initial_delay_ms": 1, "max_delay_ms": 2, "multiplier": 2 }
        },
        "sources": sources,
    })
    .to_string();
    PipelineConfig::from_json(&text, dir.path()).unwrap()
}

fn coordinator(config: &PipelineConfig, registry: Arc<ContextRegistry>, broker: Arc<dyn BrokerApi>) -> Coordinator {
    Coordinator::new(config, registry, broker, BasicClient::new())
}

fn write_zip(dir: &TempDir, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (file, content) in files {
        writer.start_file(*file, FileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    let path = dir.path().join(name);
    std::fs::write(&path, writer.finish().unwrap().into_inner()).unwrap();
    path
}

fn schedule(stops: &str) -> Vec<(&'static str, String)> {
    vec![
        ("stops.txt", format!("stop_id,stop_name,stop_lat,stop_lon\n{stops}")),
        ("routes.txt", "route_id,route_short_name,route_type\nR1,94,3\n".to_string()),
        ("trips.txt", "route_id,service_id,trip_id\nR1,WK,T1\n".to_string()),
        ("feed_info.txt", "feed_publisher_name,feed_start_date\nSofia,20240301\n".to_string()),
    ]
}

fn write_schedule(dir: &TempDir, stops: &str) -> PathBuf {
    let files = schedule(stops);
    let borrowed: Vec<(&str, &str)> = files.iter().map(|(f, c)| (*f, c.as_str())).collect();
    write_zip(dir, "gtfs.zip", &borrowed)
}

fn static_source(location: &Path) -> serde_json::Value {
    json!([{ "name": "sofia-static", "namespace": "sofia", "format": "gtfs_static", "location": location }])
}

fn write_feed(dir: &TempDir, timestamp: u64, updates: &[(&str, i32)]) -> PathBuf {
    write_named_feed(dir, "trip-updates.pb", timestamp, updates)
}

fn write_named_feed(dir: &TempDir, name: &str, timestamp: u64, updates: &[(&str, i32)]) -> PathBuf {
    let feed = FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(timestamp),
            ..Default::default()
        },
        entity: updates
            .iter()
            .enumerate()
            .map(|(i, (trip_id, delay))| FeedEntity {
                id: format!("e{i}"),
                trip_update: Some(TripUpdate {
                    trip: TripDescriptor {
                        trip_id: Some(trip_id.to_string()),
                        route_id: Some("R1".to_string()),
                        ..Default::default()
                    },
                    delay: Some(*delay),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
    };
    let path = dir.path().join(name);
    std::fs::write(&path, feed.encode_to_vec()).unwrap();
    path
}

fn write_pois(dir: &TempDir, count: usize) -> PathBuf {
    let entities: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "id": format!("urn:ngsi-ld:PointOfInterest:park-{i}"),
                "type": "PointOfInterest",
                "name": { "type": "Property", "value": format!("Park {i}") },
                "location": {
                    "type": "GeoProperty",
                    "value": { "type": "MultiPoint", "coordinates": [[23.33, 42.68], [23.34, 42.69]] }
                },
                "dateModified": { "type": "Property", "value": "2024-05-01T12:00:00Z" }
            })
        })
        .collect();
    let path = dir.path().join("pois.json");
    std::fs::write(&path, json!({ "entities": entities }).to_string()).unwrap();
    path
}

fn poi_source(path: &Path) -> serde_json::Value {
    json!([{ "name": "pois", "namespace": "sofia", "format": "poi", "files": [path] }])
}

#[tokio::test]
async fn test_blank_mandatory_name_skips_only_that_stop() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_schedule(&dir, "S1,Central,42.69,23.32\nS2,,42.70,23.33\n");
    let config = config(&dir, static_source(&bundle), 1000, 4);
    let broker = Arc::new(MemoryBroker::new());

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    let source = report.source("sofia-static").unwrap();
    assert_eq!(source.status, RunStatus::PartiallyFailed);
    assert_eq!(source.created, 3);
    assert_eq!(source.skipped, 1);
    assert_eq!(source.issues[0].reason, "missing mandatory attribute: name");

    let s1 = broker.entity(&EntityId::new("sofia", RecordKind::Stop, "S1")).unwrap();
    assert_eq!(s1.attributes["name"].value, AttributeValue::Property(json!("Central")));
    assert!(broker.entity(&EntityId::new("sofia", RecordKind::Stop, "S2")).is_none());

    let trip = broker.entity(&EntityId::new("sofia", RecordKind::Trip, "T1")).unwrap();
    assert_eq!(
        trip.attributes["hasRoute"].value,
        AttributeValue::Relationship(EntityId::new("sofia", RecordKind::Route, "R1"))
    );
}

#[tokio::test]
async fn test_reloading_same_bundle_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_schedule(&dir, "S1,Central,42.69,23.32\nS2,Lozenets,42.70,23.33\n");
    let config = config(&dir, static_source(&bundle), 2, 2);
    let broker = Arc::new(MemoryBroker::new());
    let coordinator = coordinator(&config, registry(), broker.clone());

    let first = coordinator.load(&SourceSelector::All, CancellationToken::new()).await;
    let state_after_first = broker.entities();
    let second = coordinator.load(&SourceSelector::All, CancellationToken::new()).await;

    assert_eq!(first.status(), RunStatus::Completed);
    assert_eq!(second.status(), RunStatus::Completed);
    assert_eq!(first.sources[0].created, 4);
    assert_eq!(second.sources[0].created, 0);
    assert_eq!(second.sources[0].updated, 4);
    assert_eq!(broker.created_count(), 4);
    assert_eq!(broker.entities(), state_after_first);
}

#[tokio::test]
async fn test_out_of_order_realtime_update_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let feed = write_feed(&dir, 1_714_564_800, &[("T1", 60)]);
    let sources = json!([{ "name": "sofia-rt", "namespace": "sofia", "format": "gtfs_realtime", "feeds": [feed] }]);
    let config = config(&dir, sources, 1000, 4);
    let broker = Arc::new(MemoryBroker::new());
    let coordinator = coordinator(&config, registry(), broker.clone());

    let first = coordinator.load(&SourceSelector::All, CancellationToken::new()).await;
    assert_eq!(first.status(), RunStatus::Completed);

    // a delayed message observed 5 seconds earlier arrives afterwards
    write_feed(&dir, 1_714_564_795, &[("T1", 5)]);
    let late = coordinator.load(&SourceSelector::All, CancellationToken::new()).await;

    let source = late.source("sofia-rt").unwrap();
    assert_eq!(source.stale, 1);
    assert_eq!(source.updated, 0);
    let stored = broker.entity(&EntityId::new("sofia", RecordKind::TripUpdate, "T1")).unwrap();
    assert_eq!(stored.attributes["delay"].value, AttributeValue::Property(json!(60)));
}

#[tokio::test]
async fn test_unreadable_feed_does_not_block_other_feeds() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_feed(&dir, 1_714_564_800, &[("T1", 60)]);
    let missing = dir.path().join("alerts.pb");
    let sources = json!([{ "name": "sofia-rt", "namespace": "sofia", "format": "gtfs_realtime", "feeds": [good, missing] }]);
    let config = config(&dir, sources, 1000, 4);
    let broker = Arc::new(MemoryBroker::new());

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    let source = report.source("sofia-rt").unwrap();
    assert_eq!(source.status, RunStatus::PartiallyFailed);
    assert_eq!(source.failed_inputs, 1);
    assert_eq!(source.created, 1);
    assert!(source.issues[0].subject.ends_with("alerts.pb"));
    assert!(source.fatal.is_none());
    assert!(broker.entity(&EntityId::new("sofia", RecordKind::TripUpdate, "T1")).is_some());
}

#[tokio::test]
async fn test_source_fails_when_every_feed_is_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let corrupt = dir.path().join("corrupt.pb");
    std::fs::write(&corrupt, b"\xFF\xFE\x00\x01").unwrap();
    let missing = dir.path().join("alerts.pb");
    let sources = json!([{ "name": "sofia-rt", "namespace": "sofia", "format": "gtfs_realtime", "feeds": [corrupt, missing] }]);
    let config = config(&dir, sources, 1000, 4);
    let broker = Arc::new(MemoryBroker::new());

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    let source = report.source("sofia-rt").unwrap();
    assert_eq!(source.status, RunStatus::Failed);
    assert!(source.fatal.as_deref().unwrap().contains("alerts.pb"));
    assert!(broker.is_empty());
}

#[test]
fn test_sources_sharing_namespace_and_kind_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let text = json!({
        "broker": { "url": "http://localhost:1026" },
        "sources": [
            { "name": "rt-a", "namespace": "sofia", "format": "gtfs_realtime", "feeds": ["a.pb"] },
            { "name": "rt-b", "namespace": "sofia", "format": "gtfs_realtime", "feeds": ["b.pb"] }
        ]
    })
    .to_string();

    let err = PipelineConfig::from_json(&text, dir.path()).unwrap_err();
    assert!(err.to_string().contains("'rt-a' and 'rt-b'"), "{err}");
}

#[tokio::test]
async fn test_concurrent_sources_in_separate_namespaces_keep_their_own_updates() {
    let dir = tempfile::tempdir().unwrap();
    let newer = write_named_feed(&dir, "sofia.pb", 1_714_564_800, &[("T1", 60)]);
    let older = write_named_feed(&dir, "plovdiv.pb", 1_714_564_795, &[("T1", 5)]);
    let sources = json!([
        { "name": "sofia-rt", "namespace": "sofia", "format": "gtfs_realtime", "feeds": [newer] },
        { "name": "plovdiv-rt", "namespace": "plovdiv", "format": "gtfs_realtime", "feeds": [older] }
    ]);
    let config = config(&dir, sources, 1000, 4);
    let broker = Arc::new(MemoryBroker::new());

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    assert_eq!(report.status(), RunStatus::Completed);
    let sofia = broker.entity(&EntityId::new("sofia", RecordKind::TripUpdate, "T1")).unwrap();
    let plovdiv = broker.entity(&EntityId::new("plovdiv", RecordKind::TripUpdate, "T1")).unwrap();
    assert_eq!(sofia.attributes["delay"].value, AttributeValue::Property(json!(60)));
    assert_eq!(plovdiv.attributes["delay"].value, AttributeValue::Property(json!(5)));
}

#[tokio::test]
async fn test_trip_aliases_link_realtime_to_static_trip() {
    let dir = tempfile::tempdir().unwrap();
    let feed = write_feed(&dir, 1_714_564_800, &[("RT-7", 30)]);
    let sources = json!([{
        "name": "sofia-rt",
        "namespace": "sofia",
        "format": "gtfs_realtime",
        "feeds": [feed],
        "trip_aliases": { "RT-7": "T1" }
    }]);
    let config = config(&dir, sources, 1000, 4);
    let broker = Arc::new(MemoryBroker::new());

    coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    let update = broker.entity(&EntityId::new("sofia", RecordKind::TripUpdate, "T1")).unwrap();
    assert_eq!(
        update.attributes["trip"].value,
        AttributeValue::Relationship(EntityId::new("sofia", RecordKind::Trip, "T1"))
    );
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let pois = write_pois(&dir, 1);
    let config = config(&dir, poi_source(&pois), 1000, 4);
    let broker = Arc::new(MemoryBroker::new());
    broker.fail_next_requests(2);

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    let source = report.source("pois").unwrap();
    assert_eq!(source.status, RunStatus::Completed);
    assert_eq!(source.retries, 2);
    assert_eq!(source.created, 1);
    assert_eq!(broker.created_count(), 1);
}

#[tokio::test]
async fn test_poi_multipoint_collapses_to_point() {
    let dir = tempfile::tempdir().unwrap();
    let pois = write_pois(&dir, 2);
    let config = config(&dir, poi_source(&pois), 1000, 4);
    let broker = Arc::new(MemoryBroker::new());

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    assert_eq!(report.status(), RunStatus::Completed);
    let park = broker.entity(&EntityId::new("sofia", RecordKind::Poi, "park-0")).unwrap();
    assert_eq!(
        park.attributes["location"].value,
        AttributeValue::GeoProperty(json!({ "type": "Point", "coordinates": [23.33, 42.68] }))
    );
    let expected: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
    assert_eq!(park.observed_at, expected);
}

#[tokio::test]
async fn test_unresolved_kind_fails_before_reading_input() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("never-written.zip");
    let config = config(&dir, static_source(&missing), 1000, 4);
    let without_stops = ContextRegistry::from_models(
        registry().models().filter(|m| m.kind != RecordKind::Stop).cloned().collect::<Vec<_>>(),
    )
    .unwrap();
    let broker = Arc::new(MemoryBroker::new());

    let report = coordinator(&config, Arc::new(without_stops), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    let source = report.source("sofia-static").unwrap();
    assert_eq!(source.status, RunStatus::Failed);
    assert_eq!(source.created, 0);
    assert_eq!(
        source.fatal.as_deref(),
        Some("no context model configured for record kind 'stop'")
    );
    assert!(broker.is_empty());
}

#[tokio::test]
async fn test_unknown_source_fails_without_affecting_others() {
    let dir = tempfile::tempdir().unwrap();
    let pois = write_pois(&dir, 1);
    let config = config(&dir, poi_source(&pois), 1000, 4);
    let broker = Arc::new(MemoryBroker::new());

    let report = coordinator(&config, registry(), broker.clone())
        .load(
            &SourceSelector::Named(vec!["pois".to_string(), "missing".to_string()]),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(report.source("pois").unwrap().status, RunStatus::Completed);
    assert_eq!(
        report.source("missing").unwrap().fatal.as_deref(),
        Some("unknown data source 'missing'")
    );
    assert_eq!(broker.len(), 1);
}

#[tokio::test]
async fn test_unready_broker_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let pois = write_pois(&dir, 1);
    let config = config(&dir, poi_source(&pois), 1000, 4);
    let broker = Arc::new(MemoryBroker::new());
    broker.set_unavailable(true);

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, CancellationToken::new())
        .await;

    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(broker.upsert_calls(), 0);
}

#[tokio::test]
async fn test_rebuild_removes_entities_missing_from_new_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_schedule(&dir, "S1,Central,42.69,23.32\nS2,Lozenets,42.70,23.33\n");
    let config = config(&dir, static_source(&bundle), 1000, 4);
    let broker = Arc::new(MemoryBroker::new());
    let coordinator = coordinator(&config, registry(), broker.clone());

    coordinator.load(&SourceSelector::All, CancellationToken::new()).await;
    assert_eq!(broker.len(), 4);

    write_schedule(&dir, "S1,Central,42.69,23.32\n");
    let report = coordinator.rebuild(&SourceSelector::All, CancellationToken::new()).await;

    let source = report.source("sofia-static").unwrap();
    assert_eq!(source.status, RunStatus::Completed);
    assert_eq!(source.deleted, 4);
    assert_eq!(source.created, 3);
    assert!(broker.entity(&EntityId::new("sofia", RecordKind::Stop, "S2")).is_none());
    assert_eq!(broker.len(), 3);
}

#[tokio::test]
async fn test_cancelled_token_submits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let pois = write_pois(&dir, 3);
    let config = config(&dir, poi_source(&pois), 1, 1);
    let broker = Arc::new(MemoryBroker::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, cancel)
        .await;

    let source = report.source("pois").unwrap();
    assert_eq!(source.status, RunStatus::PartiallyFailed);
    assert_eq!(source.cancelled_batches, 3);
    assert_eq!(source.cancelled_entities, 3);
    assert!(broker.is_empty());
}

/// Cancels the run while the first batch is being upserted.
struct CancelDuringUpsert {
    inner: MemoryBroker,
    cancel: CancellationToken,
}

#[async_trait]
impl BrokerApi for CancelDuringUpsert {
    async fn ready(&self) -> Result<(), BrokerError> {
        self.inner.ready().await
    }

    async fn lookup(&self, ids: &[EntityId]) -> Result<HashMap<EntityId, Option<DateTime<Utc>>>, BrokerError> {
        self.inner.lookup(ids).await
    }

    async fn upsert(&self, entities: &[Entity]) -> Result<UpsertResponse, BrokerError> {
        self.cancel.cancel();
        self.inner.upsert(entities).await
    }

    async fn list_ids(
        &self,
        entity_type: &str,
        context: &[String],
        id_prefix: &str,
    ) -> Result<Vec<EntityId>, BrokerError> {
        self.inner.list_ids(entity_type, context, id_prefix).await
    }

    async fn delete(&self, ids: &[EntityId]) -> Result<(), BrokerError> {
        self.inner.delete(ids).await
    }
}

#[tokio::test]
async fn test_cancellation_lets_in_flight_batch_finish() {
    let dir = tempfile::tempdir().unwrap();
    let pois = write_pois(&dir, 3);
    let config = config(&dir, poi_source(&pois), 1, 1);
    let cancel = CancellationToken::new();
    let broker = Arc::new(CancelDuringUpsert {
        inner: MemoryBroker::new(),
        cancel: cancel.clone(),
    });

    let report = coordinator(&config, registry(), broker.clone())
        .load(&SourceSelector::All, cancel)
        .await;

    let source = report.source("pois").unwrap();
    assert_eq!(source.created, 1);
    assert_eq!(source.cancelled_batches, 2);
    assert_eq!(source.status, RunStatus::PartiallyFailed);
    assert_eq!(broker.inner.len(), 1);
}

#[tokio::test]
async fn test_check_models_covers_every_source() {
    let dir = tempfile::tempdir().unwrap();
    let sources = json!([
        { "name": "static", "namespace": "sofia", "format": "gtfs_static", "location": "gtfs.zip" },
        { "name": "rt", "namespace": "sofia", "format": "gtfs_realtime", "feeds": ["rt.pb"] },
        { "name": "pois", "namespace": "sofia", "format": "poi", "files": ["pois.json"] }
    ]);
    let config = config(&dir, sources, 1000, 4);
    let broker: Arc<dyn BrokerApi> = Arc::new(MemoryBroker::new());

    assert!(coordinator(&config, registry(), broker.clone()).check_models().is_ok());

    let without_alerts = ContextRegistry::from_models(
        registry().models().filter(|m| m.kind != RecordKind::Alert).cloned().collect::<Vec<_>>(),
    )
    .unwrap();
    assert!(coordinator(&config, Arc::new(without_alerts), broker).check_models().is_err());
}

#[test]
fn test_shipped_configuration_loads() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let config = PipelineConfig::load(&root.join("config/pipeline.json")).unwrap();
    let registry = ContextRegistry::load(&config.models.official, &config.models.custom).unwrap();

    for kind in RecordKind::ALL {
        assert!(registry.resolve(kind).is_ok(), "no model for {kind}");
    }
    // the custom overlay replaces the official stop model
    assert_eq!(registry.resolve(RecordKind::Stop).unwrap().context.len(), 2);
}
