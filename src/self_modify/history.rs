//! # Modification history
//!
//! Bounded in-memory log of every proposal the pipeline evaluated and what
//! became of it. The oldest record is evicted once the cap is reached.

use crate::thought::Origin;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// What happened to a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModificationOutcome {
    /// Passed validation, not yet committed.
    Validated,
    /// Failed at least one check.
    ValidationFailed,
    /// Committed as this version.
    Committed {
        /// Assigned version.
        version: u32,
    },
    /// Incompatible with the chain head at commit time.
    Conflict,
    /// Rejected by a human at the approval gate.
    Rejected,
    /// Commit failed for another reason (e.g. persistence).
    Failed,
}

/// One evaluated proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
    /// Proposal id.
    pub proposal_id: Uuid,
    /// Thought name.
    pub thought: String,
    /// Authoring origin.
    pub origin: Origin,
    /// Head version at proposal time.
    pub base_version: Option<u32>,
    /// Current outcome.
    pub outcome: ModificationOutcome,
    /// Validation summary or failure reason.
    pub summary: String,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// Bounded, shared modification log. Clone is cheap (Arc-backed).
#[derive(Debug, Clone)]
pub struct ModificationLog {
    inner: Arc<Mutex<VecDeque<ModificationRecord>>>,
    capacity: usize,
}

impl ModificationLog {
    /// A log holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, evicting the oldest when full.
    pub fn record(&self, record: ModificationRecord) {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(record);
    }

    /// Update the outcome (and optionally summary) of a record.
    ///
    /// Returns `false` if the record is unknown or has been evicted.
    pub fn update(&self, proposal_id: Uuid, outcome: ModificationOutcome, summary: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        let Some(rec) = inner.iter_mut().find(|r| r.proposal_id == proposal_id) else {
            return false;
        };
        rec.outcome = outcome;
        if let Some(summary) = summary {
            rec.summary = summary;
        }
        true
    }

    /// Every record, newest first.
    pub fn records(&self) -> Vec<ModificationRecord> {
        self.inner.lock().iter().rev().cloned().collect()
    }

    /// Records for one thought, newest first.
    pub fn for_thought(&self, thought: &str) -> Vec<ModificationRecord> {
        self.inner
            .lock()
            .iter()
            .rev()
            .filter(|r| r.thought == thought)
            .cloned()
            .collect()
    }

    /// A record by proposal id.
    pub fn get(&self, proposal_id: Uuid) -> Option<ModificationRecord> {
        self.inner
            .lock()
            .iter()
            .find(|r| r.proposal_id == proposal_id)
            .cloned()
    }
}

impl Default for ModificationLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(thought: &str) -> ModificationRecord {
        ModificationRecord {
            proposal_id: Uuid::new_v4(),
            thought: thought.to_string(),
            origin: Origin::SelfModified,
            base_version: None,
            outcome: ModificationOutcome::Validated,
            summary: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_records_newest_first_and_bounded() {
        let log = ModificationLog::new(2);
        let a = record("a");
        log.record(a.clone());
        log.record(record("b"));
        log.record(record("c"));
        let names: Vec<String> = log.records().into_iter().map(|r| r.thought).collect();
        assert_eq!(names, vec!["c", "b"]);
        assert!(log.get(a.proposal_id).is_none());
    }

    #[test]
    fn test_update_outcome() {
        let log = ModificationLog::default();
        let r = record("a");
        log.record(r.clone());
        assert!(log.update(r.proposal_id, ModificationOutcome::Committed { version: 2 }, None));
        assert_eq!(
            log.get(r.proposal_id).map(|r| r.outcome),
            Some(ModificationOutcome::Committed { version: 2 })
        );
        assert!(!log.update(Uuid::new_v4(), ModificationOutcome::Failed, None));
        assert_eq!(log.for_thought("a").len(), 1);
        assert!(log.for_thought("z").is_empty());
    }
}
