use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::Job;
use crate::error::{EngineError, ErrorDetail, Result};
use crate::process::Parameters;

/// Lifecycle states of a job.
///
/// `Queued → Running → {Succeeded, Failed, Cancelling → Cancelled}`. A queued
/// job may also fail before it ever reaches a tier, or be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// The transition table. Anything not listed is rejected.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelling)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Cancelling => write!(f, "CANCELLING"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A requested change to a job's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A reservation was obtained and handed to a tier.
    Start,
    /// The tier returned without error.
    Succeed(Parameters),
    /// Terminal failure with a human-readable detail.
    Fail(ErrorDetail),
    /// Caller asked for cancellation.
    RequestCancel,
    /// The tier confirmed teardown, or the grace period elapsed.
    ConfirmCancel,
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Running,
            Transition::Succeed(_) => JobState::Succeeded,
            Transition::Fail(_) => JobState::Failed,
            Transition::RequestCancel => JobState::Cancelling,
            Transition::ConfirmCancel => JobState::Cancelled,
        }
    }
}

/// Drives a [`Job`] through the lifecycle table.
pub struct StateMachine;

impl StateMachine {
    /// Apply a transition to the job, or reject it leaving the job untouched.
    ///
    /// Outputs are written only together with the move to `Succeeded`;
    /// timestamps are stamped on entering `Running` and any terminal state.
    pub fn apply(job: &mut Job, transition: Transition) -> Result<JobState> {
        let next = transition.target();
        if !job.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: job.state,
                to: next,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Start => job.started_at = Some(now),
            Transition::Succeed(outputs) => {
                job.outputs = Some(outputs);
                job.progress = 100;
            }
            Transition::Fail(detail) => job.error = Some(detail),
            Transition::RequestCancel | Transition::ConfirmCancel => {}
        }

        job.state_history.push(job.state);
        job.state = next;
        job.updated_at = now;
        if next.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(next)
    }
}
