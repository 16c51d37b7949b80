//! Database-resident execution.
//!
//! The tier does not speak a wire protocol itself; it drives a
//! [`SqlExecutor`] supplied by the embedding application. A process runs as a
//! stored function named after the process id (`geoproc_<id>` with dashes
//! mapped to underscores).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExecutionContext, ExecutionTier};
use crate::error::TierError;
use crate::process::{Parameters, Process, TierKind};

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Names of the extensions installed in the target database. A
    /// connection failure must be reported as [`TierError::Unavailable`].
    async fn installed_extensions(&self) -> Result<Vec<String>, TierError>;

    async fn call(
        &self,
        function: &str,
        params: &Parameters,
        cancel: &CancellationToken,
    ) -> Result<Parameters, TierError>;
}

#[derive(Default)]
pub struct DatabaseTier {
    executor: Option<Arc<dyn SqlExecutor>>,
}

impl DatabaseTier {
    /// A tier with no database behind it; every call is unavailable.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            executor: Some(executor),
        }
    }

    pub fn function_name(process_id: &str) -> String {
        format!("geoproc_{}", process_id.replace('-', "_"))
    }
}

#[async_trait]
impl ExecutionTier for DatabaseTier {
    fn kind(&self) -> TierKind {
        TierKind::Database
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        process: &Process,
        params: &Parameters,
    ) -> Result<Parameters, TierError> {
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| TierError::Unavailable("no database configured".into()))?;

        if !process.required_extensions.is_empty() {
            let installed: HashSet<String> = executor
                .installed_extensions()
                .await?
                .into_iter()
                .map(|e| e.to_ascii_lowercase())
                .collect();
            let missing: Vec<&str> = process
                .required_extensions
                .iter()
                .filter(|e| !installed.contains(&e.to_ascii_lowercase()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                warn!(process = %process.id, ?missing, "database lacks required extensions");
                return Err(TierError::Unavailable(format!(
                    "missing extension(s): {}",
                    missing.join(", ")
                )));
            }
        }

        let function = Self::function_name(&process.id);
        debug!(job = %ctx.job_id, %function, "calling database function");
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(TierError::Cancelled),
            result = executor.call(&function, params, &ctx.cancel) => result,
        }
    }
}
