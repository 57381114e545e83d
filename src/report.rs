//! Run reports returned by the coordinator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::loader::{BatchOutcome, EntityOutcome};

/// Issue lists are capped; the counters always hold the full totals.
const MAX_ISSUES: usize = 500;

/// Lifecycle of one source run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Extracting,
    Mapping,
    Loading,
    Completed,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::PartiallyFailed | RunStatus::Failed
        )
    }

    fn severity(self) -> u8 {
        match self {
            RunStatus::Failed => 2,
            RunStatus::PartiallyFailed => 1,
            _ => 0,
        }
    }
}

/// A single record or entity that did not make it into the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    /// Entity id, native key or row reference.
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Records produced by extraction.
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    /// Records never submitted: malformed input, mapping errors and stale updates.
    pub skipped: usize,
    /// Entities the broker rejected or that ran out of retries.
    pub failed: usize,
    pub malformed: usize,
    pub dropped: usize,
    pub mapping_errors: usize,
    pub stale: usize,
    pub deleted: usize,
    pub batches: usize,
    pub retries: u32,
    pub cancelled_batches: usize,
    pub cancelled_entities: usize,
    /// Feeds or documents skipped because they could not be fetched or decoded.
    pub failed_inputs: usize,
    pub issues: Vec<Issue>,
    /// Set when the run aborted before anything was attempted.
    pub fatal: Option<String>,
}

impl SourceReport {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: RunStatus::Idle,
            started_at: Utc::now(),
            finished_at: None,
            records: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            malformed: 0,
            dropped: 0,
            mapping_errors: 0,
            stale: 0,
            deleted: 0,
            batches: 0,
            retries: 0,
            cancelled_batches: 0,
            cancelled_entities: 0,
            failed_inputs: 0,
            issues: Vec::new(),
            fatal: None,
        }
    }

    pub fn issue(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        if self.issues.len() < MAX_ISSUES {
            self.issues.push(Issue {
                subject: subject.into(),
                reason: reason.into(),
            });
        }
    }

    pub fn record_malformed(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.malformed += 1;
        self.skipped += 1;
        self.issue(subject, reason);
    }

    pub fn record_dropped(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.dropped += 1;
        self.skipped += 1;
        self.issue(subject, reason);
    }

    pub fn record_mapping_error(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.mapping_errors += 1;
        self.skipped += 1;
        self.issue(subject, reason);
    }

    pub fn record_stale(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.stale += 1;
        self.skipped += 1;
        self.issue(subject, reason);
    }

    pub fn record_failed_input(&mut self, location: impl Into<String>, reason: impl Into<String>) {
        self.failed_inputs += 1;
        self.issue(location, reason);
    }

    pub fn record_cancelled(&mut self, entities: usize) {
        self.cancelled_batches += 1;
        self.cancelled_entities += entities;
    }

    pub fn absorb(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.retries += outcome.retries();
        for (id, result) in &outcome.outcomes {
            match result {
                EntityOutcome::Created => self.created += 1,
                EntityOutcome::Updated => self.updated += 1,
                EntityOutcome::Stale { stored } => {
                    self.record_stale(id.as_str(), format!("stale update: broker holds observation from {stored}"))
                }
                EntityOutcome::Failed { reason } => {
                    self.failed += 1;
                    self.issue(id.as_str(), reason.clone());
                }
            }
        }
    }

    /// Ends the run as `Failed`. Counters keep what already happened, such as
    /// entities deleted by a rebuild purge that failed part way.
    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.status = RunStatus::Failed;
        self.fatal = Some(reason.into());
        self.finished_at = Some(Utc::now());
        self
    }

    /// Ends the run with `Completed` or `PartiallyFailed`.
    pub fn finish(mut self) -> Self {
        let lossless = self.skipped == 0
            && self.failed == 0
            && self.cancelled_entities == 0
            && self.failed_inputs == 0;
        self.status = if lossless {
            RunStatus::Completed
        } else {
            RunStatus::PartiallyFailed
        };
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Flat summary of a [`SourceReport`], one CSV row per source run.
#[derive(Debug, Serialize)]
pub struct SummaryRow<'a> {
    pub run_id: Uuid,
    pub operation: &'a str,
    pub source: &'a str,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stale: usize,
    pub deleted: usize,
    pub retries: u32,
    pub cancelled_batches: usize,
    pub failed_inputs: usize,
    pub fatal: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Load,
    Rebuild,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Load => "load",
            Operation::Rebuild => "rebuild",
        }
    }
}

/// Outcome of one `load` or `rebuild` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: Uuid,
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl Report {
    /// Worst status across sources.
    pub fn status(&self) -> RunStatus {
        self.sources
            .iter()
            .map(|s| s.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(RunStatus::Completed)
    }

    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source == name)
    }

    pub fn summary_rows(&self) -> Vec<SummaryRow<'_>> {
        self.sources
            .iter()
            .map(|s| SummaryRow {
                run_id: self.run_id,
                operation: self.operation.as_str(),
                source: &s.source,
                status: s.status,
                started_at: s.started_at,
                finished_at: s.finished_at,
                records: s.records,
                created: s.created,
                updated: s.updated,
                skipped: s.skipped,
                failed: s.failed,
                stale: s.stale,
                deleted: s.deleted,
                retries: s.retries,
                cancelled_batches: s.cancelled_batches,
                failed_inputs: s.failed_inputs,
                fatal: s.fatal.as_deref(),
            })
            .collect()
    }
}
