//! Pure mapping from [`SourceRecord`]s to NGSI-LD [`Entity`]s.
//!
//! No I/O happens here: the mapper only consults the [`ContextModel`] it is
//! handed. Unmapped source fields are dropped, relationships become entity
//! id references computed the same way the referenced record's own id is.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::{Value, json};

use crate::entity::{Attribute, AttributeValue, Entity};
use crate::error::MappingError;
use crate::model::{EntityId, FieldValue, SourceRecord};
use crate::registry::{AttributeRule, AttributeSource, ContextModel, ValueType};

/// Maps one record into an entity of the model's type.
pub fn map(
    record: &SourceRecord,
    model: &ContextModel,
    namespace: &str,
) -> Result<Entity, MappingError> {
    if record.kind != model.kind {
        return Err(MappingError::KindMismatch {
            expected: model.kind,
            found: record.kind,
        });
    }
    if record.key.trim().is_empty() {
        return Err(MappingError::MissingKey);
    }

    let mut attributes = BTreeMap::new();
    for rule in &model.attributes {
        if let Some(value) = map_attribute(record, rule, namespace)? {
            attributes.insert(
                rule.target.clone(),
                Attribute {
                    value,
                    observed_at: Some(record.timestamp),
                },
            );
        }
    }

    Ok(Entity {
        id: EntityId::new(namespace, record.kind, &record.key),
        entity_type: model.entity_type.clone(),
        attributes,
        context: model.context.clone(),
        observed_at: record.timestamp,
    })
}

/// Recovers the mapped source fields from an entity through the model's
/// attribute list. Fields the model never mapped cannot come back.
pub fn unmap(entity: &Entity, model: &ContextModel) -> BTreeMap<String, FieldValue> {
    let mut fields = BTreeMap::new();

    for rule in &model.attributes {
        let Some(attribute) = entity.attributes.get(&rule.target) else {
            continue;
        };
        match (&rule.source, &attribute.value) {
            (AttributeSource::Property { source, value }, AttributeValue::Property(json)) => {
                fields.insert(source.clone(), unconvert(json, *value));
            }
            (AttributeSource::GeoPoint { lat, lon }, AttributeValue::GeoProperty(geometry)) => {
                if let Some([x, y]) = point_coordinates(geometry) {
                    fields.insert(lat.clone(), FieldValue::Float(y));
                    fields.insert(lon.clone(), FieldValue::Float(x));
                }
            }
            (AttributeSource::GeoJson { source }, AttributeValue::GeoProperty(geometry)) => {
                fields.insert(source.clone(), FieldValue::Structured(geometry.clone()));
            }
            (AttributeSource::Relationship { source, .. }, AttributeValue::Relationship(object)) => {
                if let Some(key) = object.native_key() {
                    fields.insert(source.clone(), FieldValue::Text(key));
                }
            }
            _ => {}
        }
    }

    fields
}

/// Looks up a field, applying the mandatory rule. `Ok(None)` means "omit".
fn required<'a>(
    record: &'a SourceRecord,
    field: &str,
    rule: &AttributeRule,
) -> Result<Option<&'a FieldValue>, MappingError> {
    match record.field(field) {
        None if rule.mandatory => Err(MappingError::MissingAttribute(rule.target.clone())),
        Some(FieldValue::Empty) if rule.mandatory => {
            Err(MappingError::EmptyAttribute(rule.target.clone()))
        }
        other => Ok(other),
    }
}

fn map_attribute(
    record: &SourceRecord,
    rule: &AttributeRule,
    namespace: &str,
) -> Result<Option<AttributeValue>, MappingError> {
    match &rule.source {
        AttributeSource::Property { source, value } => {
            let Some(field) = required(record, source, rule)? else {
                return Ok(None);
            };
            if field.is_empty() && *value != ValueType::Text {
                return Ok(None);
            }
            convert(field, *value)
                .map(|json| Some(AttributeValue::Property(json)))
                .map_err(|reason| invalid(rule, reason))
        }
        AttributeSource::GeoPoint { lat, lon } => {
            let (Some(lat), Some(lon)) = (required(record, lat, rule)?, required(record, lon, rule)?)
            else {
                return Ok(None);
            };
            if lat.is_empty() || lon.is_empty() {
                return Ok(None);
            }
            let lat = as_f64(lat).map_err(|reason| invalid(rule, reason))?;
            let lon = as_f64(lon).map_err(|reason| invalid(rule, reason))?;
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(invalid(rule, format!("coordinates out of range ({lat}, {lon})")));
            }
            Ok(Some(AttributeValue::GeoProperty(
                json!({ "type": "Point", "coordinates": [lon, lat] }),
            )))
        }
        AttributeSource::GeoJson { source } => {
            let Some(field) = required(record, source, rule)? else {
                return Ok(None);
            };
            match field {
                FieldValue::Structured(geometry) if geometry.get("type").is_some() => {
                    Ok(Some(AttributeValue::GeoProperty(geometry.clone())))
                }
                FieldValue::Empty => Ok(None),
                other => Err(invalid(rule, format!("not a GeoJSON geometry: {}", other.canonical()))),
            }
        }
        AttributeSource::Relationship { source, object } => {
            let Some(field) = required(record, source, rule)? else {
                return Ok(None);
            };
            let key = match field {
                FieldValue::Text(key) => key.clone(),
                FieldValue::Integer(key) => key.to_string(),
                FieldValue::Empty => return Ok(None),
                other => {
                    return Err(invalid(rule, format!("not an entity key: {}", other.canonical())));
                }
            };
            Ok(Some(AttributeValue::Relationship(EntityId::new(
                namespace, *object, &key,
            ))))
        }
    }
}

fn invalid(rule: &AttributeRule, reason: String) -> MappingError {
    MappingError::InvalidValue {
        attribute: rule.target.clone(),
        reason,
    }
}

fn convert(field: &FieldValue, value_type: ValueType) -> Result<Value, String> {
    match value_type {
        ValueType::Text | ValueType::Json => Ok(field.to_json()),
        ValueType::Integer => match field {
            FieldValue::Integer(i) => Ok(Value::from(*i)),
            FieldValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{s}' is not an integer")),
            FieldValue::Float(f) if f.fract() == 0.0 => Ok(Value::from(*f as i64)),
            other => Err(format!("'{}' is not an integer", other.canonical())),
        },
        ValueType::Float => as_f64(field).map(Value::from),
        ValueType::Date => match field {
            FieldValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y%m%d")
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .map_err(|_| format!("'{s}' is not a YYYYMMDD date")),
            other => Err(format!("'{}' is not a YYYYMMDD date", other.canonical())),
        },
    }
}

fn unconvert(json: &Value, value_type: ValueType) -> FieldValue {
    match (value_type, json) {
        (_, Value::String(s)) if s.is_empty() => FieldValue::Empty,
        (ValueType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| FieldValue::Text(d.format("%Y%m%d").to_string()))
            .unwrap_or_else(|_| FieldValue::Text(s.clone())),
        (_, Value::String(s)) => FieldValue::Text(s.clone()),
        (ValueType::Float, Value::Number(n)) => n
            .as_f64()
            .map(FieldValue::Float)
            .unwrap_or_else(|| FieldValue::Structured(json.clone())),
        (_, Value::Number(n)) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => n
                .as_f64()
                .map(FieldValue::Float)
                .unwrap_or_else(|| FieldValue::Structured(json.clone())),
        },
        (_, Value::Bool(b)) => FieldValue::Boolean(*b),
        (_, other) => FieldValue::Structured(other.clone()),
    }
}

fn as_f64(field: &FieldValue) -> Result<f64, String> {
    match field {
        FieldValue::Float(f) => Ok(*f),
        FieldValue::Integer(i) => Ok(*i as f64),
        FieldValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a number")),
        other => Err(format!("'{}' is not a number", other.canonical())),
    }
}

fn point_coordinates(geometry: &Value) -> Option<[f64; 2]> {
    if geometry.get("type")?.as_str()? != "Point" {
        return None;
    }
    let coordinates = geometry.get("coordinates")?.as_array()?;
    Some([coordinates.first()?.as_f64()?, coordinates.get(1)?.as_f64()?])
}
