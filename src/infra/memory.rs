//! In-process broker used for dry runs and tests.
//!
//! Applies the same merge-on-upsert semantics as Orion-LD with
//! `options=update`, and can be told to fail requests to exercise retries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entity::Entity;
use crate::error::BrokerError;
use crate::model::EntityId;
use crate::services::broker_api::{BrokerApi, UpsertResponse};

#[derive(Debug, Default)]
struct State {
    entities: BTreeMap<EntityId, Entity>,
    created: usize,
    upsert_calls: usize,
    fail_next: u32,
    fail_next_responses: u32,
    unavailable: bool,
    rejected: HashMap<EntityId, String>,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `n` lookup/upsert requests fail as unavailable.
    pub fn fail_next_requests(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Makes the next `n` upserts apply their changes and then fail as if the
    /// response was lost.
    pub fn fail_next_responses(&self, n: u32) {
        self.state().fail_next_responses = n;
    }

    /// Makes the readiness check fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Rejects every future upsert of `id` with `reason`.
    pub fn reject(&self, id: EntityId, reason: impl Into<String>) {
        self.state().rejected.insert(id, reason.into());
    }

    pub fn entity(&self, id: &EntityId) -> Option<Entity> {
        self.state().entities.get(id).cloned()
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.state().entities.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entities created over the broker's lifetime, deletions notwithstanding.
    pub fn created_count(&self) -> usize {
        self.state().created
    }

    pub fn upsert_calls(&self) -> usize {
        self.state().upsert_calls
    }

    fn take_failure(state: &mut State) -> Result<(), BrokerError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BrokerError::Transient("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerApi for MemoryBroker {
    async fn ready(&self) -> Result<(), BrokerError> {
        if self.state().unavailable {
            return Err(BrokerError::Transient("broker not ready".to_string()));
        }
        Ok(())
    }

    async fn lookup(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Option<DateTime<Utc>>>, BrokerError> {
        let mut state = self.state();
        Self::take_failure(&mut state)?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let stored = state.entities.get(id)?;
                let newest = stored
                    .attributes
                    .values()
                    .filter_map(|a| a.observed_at)
                    .max();
                Some((id.clone(), newest))
            })
            .collect())
    }

    async fn upsert(&self, entities: &[Entity]) -> Result<UpsertResponse, BrokerError> {
        let mut guard = self.state();
        let state = &mut *guard;
        Self::take_failure(state)?;
        state.upsert_calls += 1;

        let mut response = UpsertResponse::default();
        for entity in entities {
            if let Some(reason) = state.rejected.get(&entity.id) {
                response.errors.insert(entity.id.clone(), reason.clone());
                continue;
            }
            match state.entities.get_mut(&entity.id) {
                Some(stored) => {
                    stored.entity_type = entity.entity_type.clone();
                    stored.context = entity.context.clone();
                    stored.observed_at = entity.observed_at;
                    for (name, attribute) in &entity.attributes {
                        stored.attributes.insert(name.clone(), attribute.clone());
                    }
                }
                None => {
                    state.entities.insert(entity.id.clone(), entity.clone());
                    state.created += 1;
                }
            }
        }
        if state.fail_next_responses > 0 {
            state.fail_next_responses -= 1;
            return Err(BrokerError::Transient("response timed out".to_string()));
        }
        Ok(response)
    }

    async fn list_ids(
        &self,
        entity_type: &str,
        _context: &[String],
        id_prefix: &str,
    ) -> Result<Vec<EntityId>, BrokerError> {
        Ok(self
            .state()
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type && e.id.as_str().starts_with(id_prefix))
            .map(|e| e.id.clone())
            .collect())
    }

    async fn delete(&self, ids: &[EntityId]) -> Result<(), BrokerError> {
        let mut state = self.state();
        let ids: HashSet<&EntityId> = ids.iter().collect();
        state.entities.retain(|id, _| !ids.contains(id));
        Ok(())
    }
}
