//! Geoprocessing job orchestration.
//!
//! A request names a registered [`Process`](process::Process). The
//! [`Engine`](engine::Engine) resolves its catalog inputs, runs it on the
//! first execution tier in the process's preference list that has capacity
//! and can run it, tracks the job through its lifecycle and records an audit
//! entry once it ends. Multi-step requests are DAGs of such jobs driven by
//! the [`workflow`] executor.

pub mod builtin;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod governor;
pub mod ledger;
pub mod process;
pub mod provenance;
pub mod state_machine;
pub mod tier;
pub mod workflow;

pub use engine::{Engine, EngineBuilder, JobHandle, SubmitOptions};
pub use error::{EngineError, Result};
