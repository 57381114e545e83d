//! GTFS Realtime decoder.
//!
//! Turns a protobuf [`FeedMessage`] into [`SourceRecord`]s. The header must be
//! usable or the whole message is rejected; a broken entity only loses itself.

use std::collections::HashMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use prost::Message;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::gtfs_rt::{
    Alert, EntitySelector, FeedEntity, FeedMessage, TimeRange, TranslatedString, TripDescriptor,
    TripUpdate, VehicleDescriptor, VehiclePosition, alert, feed_header, trip_descriptor,
    trip_update, vehicle_position,
};
use crate::model::{FieldValue, RecordKind, SourceRecord};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Upper bound on an inflated realtime payload.
const MAX_INFLATED_BYTES: u64 = 64 * 1024 * 1024;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes,
/// inflating gzip payloads first.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, DecodeError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let inflated = inflate(bytes, MAX_INFLATED_BYTES)?;
        return Ok(FeedMessage::decode(inflated.as_slice())?);
    }
    Ok(FeedMessage::decode(bytes)?)
}

fn inflate(bytes: &[u8], limit: u64) -> Result<Vec<u8>, DecodeError> {
    let mut inflated = Vec::new();
    GzDecoder::new(bytes)
        .take(limit + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| DecodeError::Archive(format!("gzip: {e}")))?;
    if inflated.len() as u64 > limit {
        return Err(DecodeError::Archive(format!("gzip: payload inflates beyond {limit} bytes")));
    }
    Ok(inflated)
}

/// Entity left out of the decoded output, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedEntity {
    pub entity_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DecodedFeed {
    pub records: Vec<SourceRecord>,
    pub dropped: Vec<DroppedEntity>,
    /// Entities flagged `is_deleted`; skipped without counting as malformed.
    pub deleted: usize,
}

/// Parses and decodes in one step.
pub fn decode(bytes: &[u8], trip_aliases: &HashMap<String, String>) -> Result<DecodedFeed, DecodeError> {
    decode_feed(&parse_feed(bytes)?, trip_aliases)
}

/// Converts a parsed message into records stamped with the header timestamp.
///
/// `trip_aliases` rewrites realtime trip ids into the keys used by the static
/// bundle of the same provider, so both resolve to the same trip entity.
pub fn decode_feed(
    feed: &FeedMessage,
    trip_aliases: &HashMap<String, String>,
) -> Result<DecodedFeed, DecodeError> {
    let header = &feed.header;
    if !matches!(header.gtfs_realtime_version.split('.').next(), Some("1" | "2")) {
        return Err(DecodeError::UnsupportedVersion(header.gtfs_realtime_version.clone()));
    }
    let timestamp = header
        .timestamp
        .filter(|ts| *ts > 0)
        .and_then(|ts| i64::try_from(ts).ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .ok_or(DecodeError::MissingTimestamp)?;

    let incrementality = header
        .incrementality
        .and_then(|v| feed_header::Incrementality::try_from(v).ok())
        .unwrap_or(feed_header::Incrementality::FullDataset);
    debug!(
        version = %header.gtfs_realtime_version,
        incrementality = incrementality.as_str_name(),
        %timestamp,
        entities = feed.entity.len(),
        "Decoding feed message"
    );

    let decoder = EntityDecoder {
        timestamp,
        trip_aliases,
    };
    let mut decoded = DecodedFeed::default();
    for entity in &feed.entity {
        if entity.is_deleted.unwrap_or(false) {
            debug!(entity_id = %entity.id, "Skipping deleted entity");
            decoded.deleted += 1;
            continue;
        }
        match decoder.decode(entity) {
            Ok(record) => decoded.records.push(record),
            Err(reason) => {
                warn!(entity_id = %entity.id, %reason, "Dropping malformed feed entity");
                decoded.dropped.push(DroppedEntity {
                    entity_id: entity.id.clone(),
                    reason,
                });
            }
        }
    }
    Ok(decoded)
}

struct EntityDecoder<'a> {
    timestamp: DateTime<Utc>,
    trip_aliases: &'a HashMap<String, String>,
}

impl EntityDecoder<'_> {
    fn decode(&self, entity: &FeedEntity) -> Result<SourceRecord, String> {
        if entity.id.trim().is_empty() {
            return Err("entity has no id".to_string());
        }
        match (&entity.trip_update, &entity.vehicle, &entity.alert) {
            (Some(tu), None, None) => self.trip_update(&entity.id, tu),
            (None, Some(vp), None) => self.vehicle_position(&entity.id, vp),
            (None, None, Some(alert)) => self.alert(&entity.id, alert),
            (None, None, None) => Err("entity carries no update".to_string()),
            _ => Err("entity carries more than one update".to_string()),
        }
    }

    fn trip_id(&self, trip: &TripDescriptor) -> Option<String> {
        let id = trip.trip_id.as_deref().filter(|id| !id.is_empty())?;
        Some(self.trip_aliases.get(id).cloned().unwrap_or_else(|| id.to_string()))
    }

    fn trip_update(&self, entity_id: &str, tu: &TripUpdate) -> Result<SourceRecord, String> {
        let trip_id = self.trip_id(&tu.trip);
        let canceled = tu.trip.schedule_relationship
            == Some(trip_descriptor::ScheduleRelationship::Canceled as i32);
        if tu.stop_time_update.is_empty() && tu.delay.is_none() && !canceled {
            return Err("trip update has neither stop_time_update nor delay".to_string());
        }

        let mut stop_time_updates = Vec::with_capacity(tu.stop_time_update.len());
        for stu in &tu.stop_time_update {
            if stu.stop_sequence.is_none() && stu.stop_id.is_none() {
                return Err("stop_time_update without stop_sequence or stop_id".to_string());
            }
            stop_time_updates.push(stop_time_update_json(stu));
        }

        let key = trip_id.clone().unwrap_or_else(|| entity_id.to_string());
        let mut record = SourceRecord::new(RecordKind::TripUpdate, key, self.timestamp);
        self.trip_fields(&mut record, &tu.trip, trip_id);
        if let Some(vehicle) = &tu.vehicle {
            vehicle_fields(&mut record, vehicle);
        }
        record.set("delay", tu.delay.map(|d| FieldValue::Integer(d.into())));
        record.set("timestamp", tu.timestamp.and_then(epoch_text));
        record.set(
            "stop_time_updates",
            Some(FieldValue::Structured(Value::Array(stop_time_updates))),
        );
        if let Some(props) = &tu.trip_properties {
            record.set(
                "trip_properties",
                Some(FieldValue::Structured(json!({
                    "trip_id": props.trip_id,
                    "start_date": props.start_date,
                    "start_time": props.start_time,
                    "shape_id": props.shape_id,
                    "trip_headsign": props.trip_headsign,
                    "trip_short_name": props.trip_short_name,
                }))),
            );
        }
        Ok(record)
    }

    fn vehicle_position(&self, entity_id: &str, vp: &VehiclePosition) -> Result<SourceRecord, String> {
        if let Some(pos) = &vp.position {
            let (lat, lon) = (pos.latitude, pos.longitude);
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(format!("position out of range: {lat},{lon}"));
            }
        }

        let vehicle_id = vp
            .vehicle
            .as_ref()
            .and_then(|v| v.id.as_deref())
            .filter(|id| !id.is_empty());
        let key = vehicle_id.unwrap_or(entity_id).to_string();
        let mut record = SourceRecord::new(RecordKind::VehiclePosition, key, self.timestamp);

        if let Some(trip) = &vp.trip {
            self.trip_fields(&mut record, trip, self.trip_id(trip));
        }
        if let Some(vehicle) = &vp.vehicle {
            vehicle_fields(&mut record, vehicle);
        }
        if let Some(pos) = &vp.position {
            record.set("latitude", Some(FieldValue::Float(pos.latitude.into())));
            record.set("longitude", Some(FieldValue::Float(pos.longitude.into())));
            record.set("bearing", pos.bearing.map(|v| FieldValue::Float(v.into())));
            record.set("odometer", pos.odometer.map(FieldValue::Float));
            record.set("speed", pos.speed.map(|v| FieldValue::Float(v.into())));
        }
        record.set(
            "current_stop_sequence",
            vp.current_stop_sequence.map(|v| FieldValue::Integer(v.into())),
        );
        record.set("stop_id", vp.stop_id.as_deref().map(FieldValue::text));
        record.set(
            "current_status",
            enum_text(vp.current_status.and_then(|v| {
                vehicle_position::VehicleStopStatus::try_from(v)
                    .ok()
                    .map(|e| e.as_str_name())
            })),
        );
        record.set("timestamp", vp.timestamp.and_then(epoch_text));
        record.set(
            "congestion_level",
            enum_text(vp.congestion_level.and_then(|v| {
                vehicle_position::CongestionLevel::try_from(v)
                    .ok()
                    .map(|e| e.as_str_name())
            })),
        );
        record.set("occupancy_status", enum_text(occupancy_name(vp.occupancy_status)));
        record.set(
            "occupancy_percentage",
            vp.occupancy_percentage.map(|v| FieldValue::Integer(v.into())),
        );
        if !vp.multi_carriage_details.is_empty() {
            let carriages = vp
                .multi_carriage_details
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "label": c.label,
                        "occupancy_status": occupancy_name(c.occupancy_status),
                        "occupancy_percentage": c.occupancy_percentage.filter(|p| *p >= 0),
                        "carriage_sequence": c.carriage_sequence,
                    })
                })
                .collect();
            record.set("multi_carriage_details", Some(FieldValue::Structured(Value::Array(carriages))));
        }
        Ok(record)
    }

    fn alert(&self, entity_id: &str, alert: &Alert) -> Result<SourceRecord, String> {
        if alert.informed_entity.is_empty() {
            return Err("alert has no informed_entity".to_string());
        }

        let mut record = SourceRecord::new(RecordKind::Alert, entity_id, self.timestamp);
        record.set(
            "active_periods",
            Some(FieldValue::Structured(Value::Array(
                alert.active_period.iter().map(time_range_json).collect(),
            ))),
        );
        record.set(
            "informed_entities",
            Some(FieldValue::Structured(Value::Array(
                alert
                    .informed_entity
                    .iter()
                    .map(|sel| self.selector_json(sel))
                    .collect(),
            ))),
        );
        record.set(
            "cause",
            enum_text(alert.cause.and_then(|v| alert::Cause::try_from(v).ok().map(|e| e.as_str_name()))),
        );
        record.set(
            "effect",
            enum_text(alert.effect.and_then(|v| alert::Effect::try_from(v).ok().map(|e| e.as_str_name()))),
        );
        record.set(
            "severity_level",
            enum_text(alert.severity_level.and_then(|v| {
                alert::SeverityLevel::try_from(v).ok().map(|e| e.as_str_name())
            })),
        );
        for (name, text) in [
            ("url", &alert.url),
            ("header_text", &alert.header_text),
            ("description_text", &alert.description_text),
            ("tts_header_text", &alert.tts_header_text),
            ("tts_description_text", &alert.tts_description_text),
            ("cause_detail", &alert.cause_detail),
            ("effect_detail", &alert.effect_detail),
        ] {
            record.set(name, text.as_ref().map(translations_json));
        }
        Ok(record)
    }

    fn trip_fields(&self, record: &mut SourceRecord, trip: &TripDescriptor, trip_id: Option<String>) {
        record.set("trip_id", trip_id.map(FieldValue::Text));
        record.set("route_id", trip.route_id.as_deref().map(FieldValue::text));
        record.set("direction_id", trip.direction_id.map(|v| FieldValue::Integer(v.into())));
        record.set("start_time", trip.start_time.as_deref().map(FieldValue::text));
        record.set("start_date", trip.start_date.as_deref().map(FieldValue::text));
        record.set(
            "schedule_relationship",
            enum_text(trip.schedule_relationship.and_then(|v| {
                trip_descriptor::ScheduleRelationship::try_from(v)
                    .ok()
                    .map(|e| e.as_str_name())
            })),
        );
    }

    fn selector_json(&self, sel: &EntitySelector) -> Value {
        json!({
            "agency_id": sel.agency_id,
            "route_id": sel.route_id,
            "route_type": sel.route_type,
            "trip_id": sel.trip.as_ref().and_then(|t| self.trip_id(t)),
            "stop_id": sel.stop_id,
            "direction_id": sel.direction_id,
        })
    }
}

fn vehicle_fields(record: &mut SourceRecord, vehicle: &VehicleDescriptor) {
    record.set("vehicle_id", vehicle.id.as_deref().map(FieldValue::text));
    record.set("vehicle_label", vehicle.label.as_deref().map(FieldValue::text));
    record.set("license_plate", vehicle.license_plate.as_deref().map(FieldValue::text));
}

fn stop_time_update_json(stu: &trip_update::StopTimeUpdate) -> Value {
    let event = |e: &Option<trip_update::StopTimeEvent>| {
        e.as_ref().map(|e| {
            json!({
                "delay": e.delay,
                "time": e.time,
                "uncertainty": e.uncertainty,
                "scheduled_time": e.scheduled_time,
            })
        })
    };
    json!({
        "stop_sequence": stu.stop_sequence,
        "stop_id": stu.stop_id,
        "arrival": event(&stu.arrival),
        "departure": event(&stu.departure),
        "schedule_relationship": stu.schedule_relationship.and_then(|v| {
            trip_update::stop_time_update::ScheduleRelationship::try_from(v)
                .ok()
                .map(|e| e.as_str_name())
        }),
        "departure_occupancy_status": occupancy_name(stu.departure_occupancy_status),
        "assigned_stop_id": stu.stop_time_properties.as_ref().and_then(|p| p.assigned_stop_id.clone()),
        "stop_headsign": stu.stop_time_properties.as_ref().and_then(|p| p.stop_headsign.clone()),
    })
}

fn time_range_json(range: &TimeRange) -> Value {
    let iso = |ts: Option<u64>| ts.and_then(epoch_text).map(|v| v.to_json());
    json!({ "start": iso(range.start), "end": iso(range.end) })
}

fn translations_json(text: &TranslatedString) -> FieldValue {
    FieldValue::Structured(Value::Array(
        text.translation
            .iter()
            .map(|t| json!({ "text": t.text, "language": t.language }))
            .collect(),
    ))
}

fn occupancy_name(raw: Option<i32>) -> Option<&'static str> {
    raw.and_then(|v| vehicle_position::OccupancyStatus::try_from(v).ok())
        .map(|e| e.as_str_name())
}

fn enum_text(name: Option<&'static str>) -> Option<FieldValue> {
    name.map(|n| FieldValue::Text(n.to_string()))
}

fn epoch_text(ts: u64) -> Option<FieldValue> {
    let ts = i64::try_from(ts).ok()?;
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| FieldValue::Text(crate::entity::format_timestamp(dt)))
}
