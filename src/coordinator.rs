//! Tier selection with fallback.
//!
//! [`TierCoordinator::execute`] walks a process's tier preferences in order.
//! A full (tier, class) pair or an unavailable tier moves on to the next
//! preference; a business error from a tier ends the walk immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result, TierError};
use crate::governor::QueueGovernor;
use crate::process::{Parameters, Process, TierKind};
use crate::state_machine::{TierAttempt, TierOutcome};
use crate::tier::{ExecutionContext, ExecutionTier, TierSet};

/// Receives per-tier progress while the coordinator walks the preferences.
pub trait AttemptObserver: Send {
    /// A reservation was granted and the tier is about to be invoked.
    fn on_reserved(&mut self, _tier: TierKind) {}

    fn on_attempt(&mut self, attempt: TierAttempt);
}

impl AttemptObserver for Vec<TierAttempt> {
    fn on_attempt(&mut self, attempt: TierAttempt) {
        self.push(attempt);
    }
}

/// Successful result of a coordinated run.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outputs: Parameters,
    pub tier: TierKind,
}

enum Stop {
    Tier(TierError),
    /// The tier ignored cancellation past the grace period.
    Forced,
}

pub struct TierCoordinator {
    governor: Arc<QueueGovernor>,
    tiers: TierSet,
    cancel_grace: Duration,
}

impl TierCoordinator {
    pub fn new(governor: Arc<QueueGovernor>, tiers: TierSet) -> Self {
        Self {
            governor,
            tiers,
            cancel_grace: Duration::from_secs(5),
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    pub fn governor(&self) -> &Arc<QueueGovernor> {
        &self.governor
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    pub async fn execute(
        &self,
        process: &Process,
        params: &Parameters,
        ctx: &ExecutionContext,
        observer: &mut dyn AttemptObserver,
    ) -> Result<Execution> {
        // Why each passed-over preference was skipped.
        let mut skipped: Vec<EngineError> = Vec::new();

        for &kind in &process.tier_preferences {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled { forced: false });
            }
            let started = Utc::now();

            let Some(tier) = self.tiers.get(kind) else {
                warn!(job = %ctx.job_id, tier = %kind, "no tier instance registered");
                observer.on_attempt(TierAttempt::new(
                    kind,
                    TierOutcome::Unavailable("tier not configured".into()),
                    started,
                ));
                skipped.push(EngineError::TierUnavailable {
                    tier: kind,
                    detail: "tier not configured".into(),
                });
                continue;
            };

            let Some(reservation) = self.governor.reserve(kind, process.resource_class) else {
                debug!(job = %ctx.job_id, tier = %kind, class = %process.resource_class, "tier at capacity, rerouting");
                observer.on_attempt(TierAttempt::new(kind, TierOutcome::Saturated, started));
                skipped.push(EngineError::CapacityExceeded {
                    tier: kind,
                    class: process.resource_class,
                });
                continue;
            };

            observer.on_reserved(kind);
            info!(job = %ctx.job_id, process = %process.id, tier = %kind, "executing");
            let result = self.run(tier.as_ref(), ctx, process, params).await;
            if let Err(e) = reservation.release() {
                warn!(job = %ctx.job_id, error = %e, "reservation release rejected");
            }

            match result {
                Ok(outputs) => {
                    observer.on_attempt(TierAttempt::new(kind, TierOutcome::Succeeded, started));
                    return Ok(Execution {
                        outputs,
                        tier: kind,
                    });
                }
                Err(Stop::Tier(TierError::Unavailable(detail))) => {
                    warn!(job = %ctx.job_id, tier = %kind, %detail, "tier unavailable, falling back");
                    observer.on_attempt(TierAttempt::new(
                        kind,
                        TierOutcome::Unavailable(detail.clone()),
                        started,
                    ));
                    skipped.push(EngineError::TierUnavailable { tier: kind, detail });
                }
                Err(Stop::Tier(TierError::Execution(message))) => {
                    observer.on_attempt(TierAttempt::new(
                        kind,
                        TierOutcome::Failed(message.clone()),
                        started,
                    ));
                    return Err(EngineError::Execution {
                        tier: kind,
                        message,
                    });
                }
                Err(Stop::Tier(TierError::Cancelled)) => {
                    observer.on_attempt(TierAttempt::new(kind, TierOutcome::Cancelled, started));
                    return Err(EngineError::Cancelled { forced: false });
                }
                Err(Stop::Forced) => {
                    warn!(job = %ctx.job_id, tier = %kind, grace = ?self.cancel_grace, "tier ignored cancellation, forcing");
                    observer.on_attempt(TierAttempt::new(kind, TierOutcome::Cancelled, started));
                    return Err(EngineError::Cancelled { forced: true });
                }
            }
        }

        Err(EngineError::NoTierAvailable {
            process: process.id.clone(),
            detail: exhaustion_detail(&skipped),
        })
    }

    /// Runs one tier call. Once the job is cancelled the call gets
    /// `cancel_grace` to return; after that it is dropped.
    async fn run(
        &self,
        tier: &dyn ExecutionTier,
        ctx: &ExecutionContext,
        process: &Process,
        params: &Parameters,
    ) -> std::result::Result<Parameters, Stop> {
        let call = tier.execute(ctx, process, params);
        tokio::pin!(call);

        tokio::select! {
            biased;
            result = &mut call => return result.map_err(Stop::Tier),
            _ = ctx.cancel.cancelled() => {}
        }

        debug!(job = %ctx.job_id, grace = ?self.cancel_grace, "cancellation requested, waiting for tier");
        match tokio::time::timeout(self.cancel_grace, call).await {
            // Whatever the tier produced after cancellation is discarded.
            Ok(_) => Err(Stop::Tier(TierError::Cancelled)),
            Err(_) => Err(Stop::Forced),
        }
    }
}

/// Summary line followed by each skip reason.
fn exhaustion_detail(skipped: &[EngineError]) -> String {
    let saturated = skipped
        .iter()
        .filter(|e| matches!(e, EngineError::CapacityExceeded { .. }))
        .count();
    let summary = match (skipped.len() - saturated, saturated) {
        (0, 0) => return "no tier preferences".to_string(),
        (u, 0) => format!("all {u} preferred tier(s) unavailable"),
        (0, s) => format!("all {s} preferred tier(s) at capacity"),
        (u, s) => format!("{u} tier(s) unavailable, {s} at capacity"),
    };
    let reasons: Vec<String> = skipped.iter().map(ToString::to_string).collect();
    format!("{summary}: {}", reasons.join("; "))
}
