use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::WorkflowDefinition;
use crate::error::ErrorDetail;
use crate::state_machine::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Cancelled
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub id: String,
    pub process: String,
    pub state: StepState,
    pub optional: bool,
    /// The job that ran this step, once one was started.
    pub job_id: Option<JobId>,
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Succeeded,
    /// Finished with only optional steps failing.
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowState::Running => "RUNNING",
            WorkflowState::Succeeded => "SUCCEEDED",
            WorkflowState::PartiallySucceeded => "PARTIALLY_SUCCEEDED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Aggregate view over the jobs of one workflow submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub title: Option<String>,
    pub state: WorkflowState,
    pub steps: Vec<StepStatus>,
    pub cancelled: bool,
    pub submitted_at: DateTime<Utc>,
    /// Set once every step is terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(id: &str, def: &WorkflowDefinition) -> Self {
        let steps = def
            .steps
            .iter()
            .map(|s| StepStatus {
                id: s.id.clone(),
                process: s.process.clone(),
                state: StepState::Pending,
                optional: s.optional,
                job_id: None,
                error: None,
            })
            .collect();
        Self {
            id: id.to_string(),
            title: def.title.clone(),
            state: WorkflowState::Running,
            steps,
            cancelled: false,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Every step has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(|s| s.state.is_terminal())
    }

    /// Derives the overall state from the steps. A required step that failed
    /// fails the run immediately, even while siblings are still running.
    pub fn recompute(&mut self) {
        let finished = self.is_finished();
        self.state = if self.cancelled {
            if finished {
                WorkflowState::Cancelled
            } else {
                WorkflowState::Running
            }
        } else if self.steps.iter().any(|s| {
            !s.optional && matches!(s.state, StepState::Failed | StepState::Cancelled)
        }) {
            WorkflowState::Failed
        } else if !finished {
            WorkflowState::Running
        } else if self.steps.iter().all(|s| s.state == StepState::Succeeded) {
            WorkflowState::Succeeded
        } else {
            WorkflowState::PartiallySucceeded
        };
        if finished && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}
