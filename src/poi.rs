//! Point-of-interest reader.
//!
//! Reads NGSI-LD documents of the form `{"entities": [...]}` and flattens each
//! entity back into a [`SourceRecord`] so it can go through a context model like
//! every other source.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::error::DecodeError;
use crate::model::{FieldValue, RecordKind, SourceRecord};
use crate::parser::DroppedEntity;

#[derive(Debug, Default)]
pub struct PoiDocument {
    pub records: Vec<SourceRecord>,
    pub dropped: Vec<DroppedEntity>,
}

/// Parses one document. `fallback` stamps entities without `dateModified`.
pub fn read_document(bytes: &[u8], fallback: DateTime<Utc>) -> Result<PoiDocument, DecodeError> {
    let doc: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Document(e.to_string()))?;
    let entities = doc
        .get("entities")
        .and_then(Value::as_array)
        .ok_or_else(|| DecodeError::Document("expected an object with an 'entities' list".to_string()))?;

    let mut out = PoiDocument::default();
    for (index, entity) in entities.iter().enumerate() {
        match read_entity(entity, fallback) {
            Ok(record) => out.records.push(record),
            Err(reason) => {
                let entity_id = entity
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{index}"));
                warn!(%entity_id, %reason, "Dropping malformed point of interest");
                out.dropped.push(DroppedEntity { entity_id, reason });
            }
        }
    }
    Ok(out)
}

fn read_entity(entity: &Value, fallback: DateTime<Utc>) -> Result<SourceRecord, String> {
    let obj = entity.as_object().ok_or("entity is not an object")?;
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or("entity has no id")?;
    // urn:ngsi-ld:PointOfInterest:<key>, or a bare key
    let key = id.rsplit(':').next().unwrap_or(id);
    if key.is_empty() {
        return Err(format!("cannot derive key from id '{id}'"));
    }

    let timestamp = obj
        .get("dateModified")
        .map(attribute_value)
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(fallback);

    let mut record = SourceRecord::new(RecordKind::Poi, key, timestamp);
    if let Some(category) = obj.get("type").and_then(Value::as_str) {
        record.set("type", Some(FieldValue::text(category)));
    }
    for (name, attr) in obj {
        if matches!(name.as_str(), "id" | "type" | "@context") {
            continue;
        }
        let value = attribute_value(attr);
        let value = if is_geo(attr) {
            collapse_multipoint(value)
        } else {
            value
        };
        record.set(name, Some(field_value(value)));
    }
    Ok(record)
}

/// Unwraps normalized NGSI-LD attributes; key-value attributes pass through.
fn attribute_value(attr: &Value) -> Value {
    match attr.get("type").and_then(Value::as_str) {
        Some("Property" | "GeoProperty") => attr.get("value").cloned().unwrap_or(Value::Null),
        Some("Relationship") => attr.get("object").cloned().unwrap_or(Value::Null),
        _ => attr.clone(),
    }
}

fn is_geo(attr: &Value) -> bool {
    attr.get("type").and_then(Value::as_str) == Some("GeoProperty")
}

fn collapse_multipoint(geometry: Value) -> Value {
    if geometry.get("type").and_then(Value::as_str) != Some("MultiPoint") {
        return geometry;
    }
    match geometry.get("coordinates").and_then(|c| c.get(0)) {
        Some(first) => serde_json::json!({ "type": "Point", "coordinates": first }),
        None => geometry,
    }
}

fn field_value(value: Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Empty,
        Value::String(s) => FieldValue::text(s),
        Value::Bool(b) => FieldValue::Boolean(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => n.as_f64().map_or(FieldValue::Empty, FieldValue::Float),
        },
        other => FieldValue::Structured(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_reads_normalized_entities() {
        let doc = json!({
            "entities": [{
                "id": "urn:ngsi-ld:PointOfInterest:park-17",
                "type": "PointOfInterest",
                "name": { "type": "Property", "value": "Borisova Gradina" },
                "category": { "type": "Property", "value": ["park"] },
                "location": {
                    "type": "GeoProperty",
                    "value": { "type": "MultiPoint", "coordinates": [[23.34, 42.68], [23.35, 42.69]] }
                },
                "dateModified": { "type": "Property", "value": "2024-04-10T08:00:00Z" }
            }]
        });
        let parsed = read_document(doc.to_string().as_bytes(), fallback()).unwrap();
        let record = &parsed.records[0];

        assert_eq!(record.kind, RecordKind::Poi);
        assert_eq!(record.key, "park-17");
        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2024, 4, 10, 8, 0, 0).unwrap());
        assert_eq!(record.field("name"), Some(&FieldValue::Text("Borisova Gradina".to_string())));
        assert_eq!(
            record.field("location"),
            Some(&FieldValue::Structured(json!({ "type": "Point", "coordinates": [23.34, 42.68] })))
        );
    }

    #[test]
    fn test_missing_date_uses_fallback() {
        let doc = json!({ "entities": [{ "id": "school-1", "type": "PointOfInterest" }] });
        let parsed = read_document(doc.to_string().as_bytes(), fallback()).unwrap();
        assert_eq!(parsed.records[0].timestamp, fallback());
        assert_eq!(parsed.records[0].key, "school-1");
    }

    #[test]
    fn test_entity_without_id_dropped() {
        let doc = json!({ "entities": [{ "type": "PointOfInterest" }, { "id": "a" }] });
        let parsed = read_document(doc.to_string().as_bytes(), fallback()).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.dropped[0].entity_id, "#0");
    }

    #[test]
    fn test_wrong_document_shape_is_decode_error() {
        let err = read_document(b"[1, 2]", fallback()).unwrap_err();
        assert!(matches!(err, DecodeError::Document(_)));
    }
}
