mod definition;
mod executor;
mod graph;
mod run;

pub use definition::{StepInput, StepOutputRef, WorkflowDefinition, WorkflowStep};
pub use executor::{StepRunner, WorkflowExecutor};
pub use graph::{StepGraph, validate};
pub use run::{StepState, StepStatus, WorkflowRun, WorkflowState};
