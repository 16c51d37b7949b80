//! Execution substrates.
//!
//! Every substrate implements [`ExecutionTier`]. The coordinator looks tiers
//! up by [`TierKind`] in a [`TierSet`] while walking a process's preference
//! list, so adding a substrate means adding a variant and an implementation.

mod database;
mod in_process;
mod subprocess;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::catalog::Identity;
use crate::error::TierError;
use crate::process::{Parameters, Process, TierKind};
use crate::state_machine::JobId;

pub use database::{DatabaseTier, SqlExecutor};
pub use in_process::{InProcessTier, Operation};
pub use subprocess::SubprocessTier;

/// Per-call context handed to a tier.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub identity: Identity,
    /// Signalled when the job is cancelled. Tiers must stop promptly.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(job_id: &str, identity: Identity) -> Self {
        Self {
            job_id: job_id.to_string(),
            identity,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
pub trait ExecutionTier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Runs `process` with fully resolved parameters.
    ///
    /// Must answer [`TierError::Unavailable`] when the substrate cannot run
    /// this process at all (missing runtime, extension or command), so the
    /// coordinator can fall back to the next preference.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        process: &Process,
        params: &Parameters,
    ) -> Result<Parameters, TierError>;
}

/// The tier instances available to a coordinator, keyed by kind.
#[derive(Clone, Default)]
pub struct TierSet {
    tiers: HashMap<TierKind, Arc<dyn ExecutionTier>>,
}

impl TierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tier: Arc<dyn ExecutionTier>) -> Self {
        self.insert(tier);
        self
    }

    /// Replaces any tier of the same kind.
    pub fn insert(&mut self, tier: Arc<dyn ExecutionTier>) {
        self.tiers.insert(tier.kind(), tier);
    }

    pub fn get(&self, kind: TierKind) -> Option<&Arc<dyn ExecutionTier>> {
        self.tiers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<TierKind> {
        let mut kinds: Vec<_> = self.tiers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for TierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierSet").field("kinds", &self.kinds()).finish()
    }
}
