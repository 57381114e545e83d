//! Broker client: submits load batches with upsert semantics.
//!
//! Each attempt looks up the stored observation time of every entity in the
//! batch, drops entities older than what the broker already holds and upserts
//! the rest. A transient failure anywhere in the attempt retries the whole
//! batch; a rejection of the request fails the batch without retrying.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entity::Entity;
use crate::error::BrokerError;
use crate::model::EntityId;
use crate::retry::{RetryPolicy, RetryState};
use crate::services::broker_api::BrokerApi;

/// A bounded group of entities submitted in one broker request.
#[derive(Debug, Clone)]
pub struct LoadBatch {
    pub correlation_id: Uuid,
    pub entities: Vec<Entity>,
}

impl LoadBatch {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            entities,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityOutcome {
    Created,
    Updated,
    /// Broker already holds a newer observation; nothing was sent.
    Stale { stored: DateTime<Utc> },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub correlation_id: Uuid,
    pub outcomes: Vec<(EntityId, EntityOutcome)>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

impl BatchOutcome {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn count(&self, pred: impl Fn(&EntityOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    fn all_failed(batch: &LoadBatch, reason: &str, attempts: u32) -> Self {
        Self {
            correlation_id: batch.correlation_id,
            outcomes: batch
                .entities
                .iter()
                .map(|e| {
                    (
                        e.id.clone(),
                        EntityOutcome::Failed {
                            reason: reason.to_string(),
                        },
                    )
                })
                .collect(),
            attempts,
        }
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum Step {
    Done(BatchOutcome),
    /// Transient failure; run [`BrokerClient::attempt`] again with `state`
    /// after waiting `wait`.
    Retry {
        state: RetryState,
        wait: std::time::Duration,
        error: BrokerError,
    },
}

#[derive(Clone)]
pub struct BrokerClient {
    broker: Arc<dyn BrokerApi>,
    policy: RetryPolicy,
}

impl BrokerClient {
    pub fn new(broker: Arc<dyn BrokerApi>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submits a batch, retrying transient failures with backoff.
    #[tracing::instrument(skip(self, batch), fields(batch = %batch.correlation_id, size = batch.entities.len()))]
    pub async fn submit(&self, batch: &LoadBatch) -> BatchOutcome {
        let mut state = self.policy.start();
        let mut existed = None;
        loop {
            match self.attempt(batch, state, &mut existed).await {
                Step::Done(outcome) => return outcome,
                Step::Retry {
                    state: next,
                    wait,
                    error,
                } => {
                    warn!(attempt = state.attempt, backoff_ms = wait.as_millis() as u64, error = %error, "Batch attempt failed, retrying");
                    tokio::time::sleep(wait).await;
                    state = next;
                }
            }
        }
    }

    /// Runs one attempt of `batch` at retry position `state`.
    ///
    /// `existed` holds the ids the broker already had at the first successful
    /// lookup of this batch. Pass the same value to every attempt so an upsert
    /// that committed before a transient error still reports `Created`.
    pub async fn attempt(
        &self,
        batch: &LoadBatch,
        state: RetryState,
        existed: &mut Option<HashSet<EntityId>>,
    ) -> Step {
        match self.try_once(batch, existed).await {
            Ok(outcomes) => {
                let outcome = BatchOutcome {
                    correlation_id: batch.correlation_id,
                    outcomes,
                    attempts: state.attempt,
                };
                info!(
                    batch = %batch.correlation_id,
                    created = outcome.count(|o| matches!(o, EntityOutcome::Created)),
                    updated = outcome.count(|o| matches!(o, EntityOutcome::Updated)),
                    stale = outcome.count(|o| matches!(o, EntityOutcome::Stale { .. })),
                    failed = outcome.count(|o| matches!(o, EntityOutcome::Failed { .. })),
                    attempts = state.attempt,
                    "Batch submitted"
                );
                Step::Done(outcome)
            }
            Err(error) if error.is_transient() => match self.policy.advance(state) {
                Some(next) => Step::Retry {
                    state: next,
                    wait: state.next_delay,
                    error,
                },
                None => {
                    warn!(batch = %batch.correlation_id, attempts = state.attempt, error = %error, "Retries exhausted, failing batch");
                    Step::Done(BatchOutcome::all_failed(
                        batch,
                        &format!("{error} (after {} attempts)", state.attempt),
                        state.attempt,
                    ))
                }
            },
            Err(error) => {
                warn!(batch = %batch.correlation_id, error = %error, "Batch rejected");
                Step::Done(BatchOutcome::all_failed(batch, &error.to_string(), state.attempt))
            }
        }
    }

    async fn try_once(
        &self,
        batch: &LoadBatch,
        existed: &mut Option<HashSet<EntityId>>,
    ) -> Result<Vec<(EntityId, EntityOutcome)>, BrokerError> {
        let ids: Vec<EntityId> = batch.entities.iter().map(|e| e.id.clone()).collect();
        let stored = self.broker.lookup(&ids).await?;
        let existed = existed.get_or_insert_with(|| stored.keys().cloned().collect());

        let mut fresh = Vec::with_capacity(batch.entities.len());
        let mut stale = Vec::new();
        for entity in &batch.entities {
            match stored.get(&entity.id) {
                Some(Some(ts)) if entity.observed_at < *ts => {
                    debug!(id = %entity.id, incoming = %entity.observed_at, stored = %ts, "Skipping stale update");
                    stale.push((entity.id.clone(), *ts));
                }
                _ => fresh.push(entity.clone()),
            }
        }

        let response = if fresh.is_empty() {
            Default::default()
        } else {
            self.broker.upsert(&fresh).await?
        };

        let outcomes = batch
            .entities
            .iter()
            .map(|entity| {
                let outcome = if let Some((_, ts)) = stale.iter().find(|(id, _)| *id == entity.id) {
                    EntityOutcome::Stale { stored: *ts }
                } else if let Some(reason) = response.errors.get(&entity.id) {
                    warn!(id = %entity.id, %reason, "Entity rejected by broker");
                    EntityOutcome::Failed {
                        reason: reason.clone(),
                    }
                } else if existed.contains(&entity.id) {
                    EntityOutcome::Updated
                } else {
                    EntityOutcome::Created
                };
                (entity.id.clone(), outcome)
            })
            .collect();
        Ok(outcomes)
    }
}
