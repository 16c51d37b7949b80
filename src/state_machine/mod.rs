mod job;
mod state;

pub use job::{InputValue, Job, JobId, TierAttempt, TierOutcome};
pub use state::{JobState, StateMachine, Transition};
