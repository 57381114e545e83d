//! Intermediate record model shared by the extractors and the mapper.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of source record kinds the pipeline understands.
///
/// Registry coverage is checked against this enum at startup, so adding a
/// variant means adding a model definition for it as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Agency,
    Level,
    Stop,
    Route,
    Trip,
    StopTime,
    CalendarDate,
    Shape,
    TripUpdate,
    VehiclePosition,
    Alert,
    Poi,
}

impl RecordKind {
    pub const ALL: [RecordKind; 12] = [
        RecordKind::Agency,
        RecordKind::Level,
        RecordKind::Stop,
        RecordKind::Route,
        RecordKind::Trip,
        RecordKind::StopTime,
        RecordKind::CalendarDate,
        RecordKind::Shape,
        RecordKind::TripUpdate,
        RecordKind::VehiclePosition,
        RecordKind::Alert,
        RecordKind::Poi,
    ];

    /// Kinds produced by the realtime decoder.
    pub const REALTIME: [RecordKind; 3] = [
        RecordKind::TripUpdate,
        RecordKind::VehiclePosition,
        RecordKind::Alert,
    ];

    /// Type segment used inside entity ids.
    ///
    /// Fixed per kind and independent of the configured entity type, so a
    /// custom model that renames a type does not change identities.
    pub fn urn_segment(self) -> &'static str {
        match self {
            RecordKind::Agency => "GtfsAgency",
            RecordKind::Level => "GtfsLevel",
            RecordKind::Stop => "GtfsStop",
            RecordKind::Route => "GtfsRoute",
            RecordKind::Trip => "GtfsTrip",
            RecordKind::StopTime => "GtfsStopTime",
            RecordKind::CalendarDate => "GtfsCalendarDateRule",
            RecordKind::Shape => "GtfsShape",
            RecordKind::TripUpdate => "GtfsRealtimeTripUpdate",
            RecordKind::VehiclePosition => "GtfsRealtimeVehiclePosition",
            RecordKind::Alert => "GtfsRealtimeAlert",
            RecordKind::Poi => "PointOfInterest",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Agency => "agency",
            RecordKind::Level => "level",
            RecordKind::Stop => "stop",
            RecordKind::Route => "route",
            RecordKind::Trip => "trip",
            RecordKind::StopTime => "stop_time",
            RecordKind::CalendarDate => "calendar_date",
            RecordKind::Shape => "shape",
            RecordKind::TripUpdate => "trip_update",
            RecordKind::VehiclePosition => "vehicle_position",
            RecordKind::Alert => "alert",
            RecordKind::Poi => "poi",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single source field value.
///
/// A field that the source did not provide is simply absent from
/// [`SourceRecord::fields`]; `Empty` means the source provided it with no
/// content, which the mapper treats differently for mandatory attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Structured(serde_json::Value),
    Empty,
}

impl FieldValue {
    /// Builds a text value, mapping blank strings to [`FieldValue::Empty`].
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            FieldValue::Empty
        } else {
            FieldValue::Text(value)
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Empty)
    }

    /// Canonical textual form, used to compare values that went through a
    /// typed conversion (`"7"` and `7` are the same field value).
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Structured(v) => v.to_string(),
            FieldValue::Empty => String::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Integer(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Value::from(*f),
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
            FieldValue::Structured(v) => v.clone(),
            FieldValue::Empty => serde_json::Value::String(String::new()),
        }
    }
}

/// A normalized unit produced by one of the extractors.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub kind: RecordKind,
    /// Source-native key (`stop_id`, `trip_id`, composite keys joined by `:`).
    pub key: String,
    /// Bundle effective date for static data, feed header time for realtime.
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl SourceRecord {
    pub fn new(kind: RecordKind, key: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            key: key.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Inserts a field. `None` leaves it absent.
    pub fn set(&mut self, name: &str, value: Option<FieldValue>) {
        if let Some(value) = value {
            self.fields.insert(name.to_string(), value);
        }
    }

    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

const URN_PREFIX: &str = "urn:ngsi-ld:";

/// Stable NGSI-LD entity identifier: `urn:ngsi-ld:<Type>:<namespace>:<key>`.
///
/// The key is percent-encoded so it never contains `:` and the id can be
/// split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(namespace: &str, kind: RecordKind, key: &str) -> Self {
        EntityId(format!(
            "{URN_PREFIX}{}:{namespace}:{}",
            kind.urn_segment(),
            encode_key(key)
        ))
    }

    /// Wraps an id received from the broker. Returns `None` for non-NGSI-LD urns.
    pub fn from_urn(urn: &str) -> Option<Self> {
        urn.starts_with(URN_PREFIX).then(|| EntityId(urn.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix shared by every id of `kind` within `namespace`.
    pub fn prefix(namespace: &str, kind: RecordKind) -> String {
        format!("{URN_PREFIX}{}:{namespace}:", kind.urn_segment())
    }

    /// Recovers the source-native key.
    pub fn native_key(&self) -> Option<String> {
        let rest = self.0.strip_prefix(URN_PREFIX)?;
        let mut parts = rest.splitn(3, ':');
        let _type = parts.next()?;
        let _namespace = parts.next()?;
        decode_key(parts.next()?)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Namespaces end up inside entity ids and must not need escaping.
pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_is_deterministic() {
        let a = EntityId::new("sofia", RecordKind::Trip, "R1");
        let b = EntityId::new("sofia", RecordKind::Trip, "R1");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "urn:ngsi-ld:GtfsTrip:sofia:R1");
    }

    #[test]
    fn test_entity_id_escapes_and_recovers_key() {
        let id = EntityId::new("sofia", RecordKind::StopTime, "T 1:5");
        assert_eq!(id.as_str(), "urn:ngsi-ld:GtfsStopTime:sofia:T%201%3A5");
        assert_eq!(id.native_key().as_deref(), Some("T 1:5"));
    }

    #[test]
    fn test_entity_id_cyrillic_key_roundtrip() {
        let id = EntityId::new("sofia", RecordKind::Stop, "Опълченска");
        assert!(id.as_str().is_ascii());
        assert_eq!(id.native_key().as_deref(), Some("Опълченска"));
    }

    #[test]
    fn test_from_urn_rejects_foreign_ids() {
        assert!(EntityId::from_urn("urn:ngsi-ld:GtfsStop:sofia:A1").is_some());
        assert!(EntityId::from_urn("http://example.com/A1").is_none());
    }

    #[test]
    fn test_namespace_validation() {
        assert!(is_valid_namespace("sofia-2024.v1"));
        assert!(!is_valid_namespace("Bulgaria:Sofia"));
        assert!(!is_valid_namespace(""));
    }

    #[test]
    fn test_blank_text_is_empty() {
        assert_eq!(FieldValue::text("  "), FieldValue::Empty);
        assert_eq!(FieldValue::text("A"), FieldValue::Text("A".to_string()));
    }

    #[test]
    fn test_canonical_equates_typed_and_text() {
        assert_eq!(
            FieldValue::Integer(7).canonical(),
            FieldValue::Text("7".to_string()).canonical()
        );
    }
}
