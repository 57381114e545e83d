//! Trait and types for talking to an NGSI-LD context broker.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entity::Entity;
use crate::error::BrokerError;
use crate::model::EntityId;

/// Per-entity result of a batch upsert. Entities not listed in `errors`
/// were accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertResponse {
    pub errors: HashMap<EntityId, String>,
}

/// Abstraction over a context broker (e.g., Orion-LD).
///
/// `Err` from any method means the request as a whole failed; use
/// [`BrokerError::is_transient`] to decide whether another attempt makes sense.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Succeeds once the broker accepts requests.
    async fn ready(&self) -> Result<(), BrokerError>;

    /// Existing entities among `ids`, with the newest `observedAt` the broker
    /// holds for each. Ids that do not exist are absent from the map.
    async fn lookup(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Option<DateTime<Utc>>>, BrokerError>;

    /// Creates missing entities and merges attributes into existing ones.
    async fn upsert(&self, entities: &[Entity]) -> Result<UpsertResponse, BrokerError>;

    /// Ids of entities of `entity_type` whose id starts with `id_prefix`.
    async fn list_ids(
        &self,
        entity_type: &str,
        context: &[String],
        id_prefix: &str,
    ) -> Result<Vec<EntityId>, BrokerError>;

    /// Deletes the given entities; ids that do not exist are ignored.
    async fn delete(&self, ids: &[EntityId]) -> Result<(), BrokerError>;
}
