//! NGSI-LD entity representation and its JSON-LD encoding.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::model::EntityId;

/// Value part of an NGSI-LD attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Property(Value),
    /// GeoJSON geometry.
    GeoProperty(Value),
    /// Reference to another entity by id, never an embedded copy.
    Relationship(EntityId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub value: AttributeValue,
    pub observed_at: Option<DateTime<Utc>>,
}

/// A mapped NGSI-LD entity ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub attributes: BTreeMap<String, Attribute>,
    pub context: Vec<String>,
    /// Observation time of the source record the entity was derived from.
    pub observed_at: DateTime<Utc>,
}

impl Entity {
    /// Normalized NGSI-LD body with `@context` inline, suitable for an
    /// `application/ld+json` batch request.
    pub fn to_ngsi_ld(&self) -> Value {
        let mut body = Map::new();
        body.insert("id".into(), Value::String(self.id.to_string()));
        body.insert("type".into(), Value::String(self.entity_type.clone()));

        for (name, attribute) in &self.attributes {
            let mut attr = match &attribute.value {
                AttributeValue::Property(value) => json!({ "type": "Property", "value": value }),
                AttributeValue::GeoProperty(value) => {
                    json!({ "type": "GeoProperty", "value": value })
                }
                AttributeValue::Relationship(object) => {
                    json!({ "type": "Relationship", "object": object.as_str() })
                }
            };
            if let (Some(observed_at), Some(obj)) = (attribute.observed_at, attr.as_object_mut()) {
                obj.insert("observedAt".into(), Value::String(format_timestamp(observed_at)));
            }
            body.insert(name.clone(), attr);
        }

        let context = match self.context.as_slice() {
            [single] => Value::String(single.clone()),
            many => Value::Array(many.iter().cloned().map(Value::String).collect()),
        };
        body.insert("@context".into(), context);

        Value::Object(body)
    }
}

/// ISO 8601 with a `Z` suffix, the form NGSI-LD expects for `observedAt`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Newest `observedAt` among the attributes of an entity as returned by the
/// broker. Used to detect stale realtime deltas.
pub fn latest_observed_at(entity: &Value) -> Option<DateTime<Utc>> {
    entity
        .as_object()?
        .values()
        .filter_map(|attr| attr.get("observedAt")?.as_str())
        .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .max()
}
