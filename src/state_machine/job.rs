use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;
use crate::catalog::CatalogReference;
use crate::error::ErrorDetail;
use crate::process::{Parameters, TierKind};

pub type JobId = String;

/// A value bound to one input parameter at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputValue {
    Literal(serde_json::Value),
    Catalog(CatalogReference),
}

/// How a single tier attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TierOutcome {
    Succeeded,
    /// Runtime or capability missing on this tier.
    Unavailable(String),
    /// No capacity left for the (tier, class) pair.
    Saturated,
    /// The tier rejected the work with a business-logic error.
    Failed(String),
    Cancelled,
}

impl fmt::Display for TierOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierOutcome::Succeeded => write!(f, "succeeded"),
            TierOutcome::Unavailable(detail) => write!(f, "unavailable: {detail}"),
            TierOutcome::Saturated => write!(f, "at capacity"),
            TierOutcome::Failed(detail) => write!(f, "failed: {detail}"),
            TierOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAttempt {
    pub tier: TierKind,
    pub outcome: TierOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TierAttempt {
    pub fn new(tier: TierKind, outcome: TierOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            tier,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

impl fmt::Display for TierAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tier, self.outcome)
    }
}

/// One execution attempt of a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub process_id: String,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub attempted_tiers: Vec<TierAttempt>,
    pub inputs: BTreeMap<String, InputValue>,
    pub outputs: Option<Parameters>,
    /// Output name to catalog collection id, for outputs registered in the catalog.
    #[serde(default)]
    pub catalog_outputs: BTreeMap<String, String>,
    pub error: Option<ErrorDetail>,
    /// Coarse completion estimate, 0 to 100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

impl Job {
    pub fn new(process_id: &str, inputs: BTreeMap<String, InputValue>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            process_id: process_id.to_string(),
            state: JobState::Queued,
            state_history: Vec::new(),
            submitted_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            attempted_tiers: Vec::new(),
            inputs,
            outputs: None,
            catalog_outputs: BTreeMap::new(),
            error: None,
            progress: 0,
            workflow_id: None,
        }
    }

    /// Attempts are append-only.
    pub fn record_attempt(&mut self, attempt: TierAttempt) {
        self.attempted_tiers.push(attempt);
        self.updated_at = Utc::now();
    }

    /// The tier that produced the job's result, if any.
    pub fn executing_tier(&self) -> Option<TierKind> {
        self.attempted_tiers
            .iter()
            .rev()
            .find(|a| a.outcome == TierOutcome::Succeeded)
            .map(|a| a.tier)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.submitted_at).num_milliseconds())
    }
}
