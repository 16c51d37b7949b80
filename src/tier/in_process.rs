use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{ExecutionContext, ExecutionTier};
use crate::error::TierError;
use crate::process::{Parameters, Process, TierKind};

/// A process body that runs inside the engine's own address space.
pub type Operation = Arc<dyn Fn(&Parameters) -> Result<Parameters, TierError> + Send + Sync>;

/// Runs registered closures on the blocking thread pool.
#[derive(Default)]
pub struct InProcessTier {
    operations: RwLock<HashMap<String, Operation>>,
}

impl InProcessTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, process_id: &str, op: F)
    where
        F: Fn(&Parameters) -> Result<Parameters, TierError> + Send + Sync + 'static,
    {
        self.operations
            .write()
            .insert(process_id.to_string(), Arc::new(op));
    }

    pub fn with_operation<F>(self, process_id: &str, op: F) -> Self
    where
        F: Fn(&Parameters) -> Result<Parameters, TierError> + Send + Sync + 'static,
    {
        self.register(process_id, op);
        self
    }

    pub fn supports(&self, process_id: &str) -> bool {
        self.operations.read().contains_key(process_id)
    }
}

#[async_trait]
impl ExecutionTier for InProcessTier {
    fn kind(&self) -> TierKind {
        TierKind::InProcess
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        process: &Process,
        params: &Parameters,
    ) -> Result<Parameters, TierError> {
        let op = self.operations.read().get(&process.id).cloned().ok_or_else(|| {
            TierError::Unavailable(format!("no in-process implementation of {}", process.id))
        })?;

        debug!(job = %ctx.job_id, process = %process.id, "running in-process");
        let params = params.clone();
        let task = tokio::task::spawn_blocking(move || op(&params));

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(TierError::Cancelled),
            joined = task => joined.map_err(|e| TierError::Execution(format!("operation panicked: {e}")))?,
        }
    }
}
