//! Submission surface.
//!
//! [`Engine`] ties the ledger, coordinator, catalog binding, provenance
//! recorder and workflow executor together. Each submitted job runs as its
//! own tokio task:
//!
//! 1. catalog inputs are resolved into feature collections,
//! 2. the coordinator picks a tier and runs the process,
//! 3. a requested output is registered in the catalog,
//! 4. the terminal transition is applied and provenance recorded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{
    AddressGuard, AllowTenant, Authorizer, CatalogBinding, CatalogStore, CleanupScheduler,
    FeaturesApiStore, Identity, MemoryCatalogStore, OutputSpec, TokioScheduler, content_hash,
    feature_collection, records_from_value,
};
use crate::config::{EngineConfig, RetryConfig};
use crate::coordinator::{AttemptObserver, TierCoordinator};
use crate::error::{EngineError, ErrorDetail, ErrorKind, Result};
use crate::governor::QueueGovernor;
use crate::ledger::{FileJobStore, JobLedger, JobRecord, JobStore, MemoryJobStore};
use crate::process::{
    InMemoryRegistry, ParameterType, Parameters, Process, ProcessRegistry, TierKind,
};
use crate::provenance::{
    Divergence, JsonlProvenanceStore, MemoryProvenanceStore, ProvenanceRecord, ProvenanceRecorder,
    ProvenanceStore,
};
use crate::state_machine::{InputValue, Job, JobId, JobState, TierAttempt, Transition};
use crate::tier::{DatabaseTier, ExecutionContext, ExecutionTier, SubprocessTier, TierSet};
use crate::workflow::{StepRunner, WorkflowDefinition, WorkflowExecutor, WorkflowRun, WorkflowState, WorkflowStep};

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Publish one output to the catalog once the job succeeds.
    pub output: Option<OutputSpec>,
    pub identity: Identity,
    pub workflow_id: Option<String>,
}

impl SubmitOptions {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }
}

/// Returned by [`Engine::submit`]; the job keeps running whether or not the
/// handle is awaited.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    engine: Engine,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Result<Job> {
        self.engine.get_status(&self.id)
    }

    pub fn cancel(&self) -> Result<JobState> {
        self.engine.cancel(&self.id)
    }

    pub async fn wait(&self) -> Result<Job> {
        self.engine.wait(&self.id).await
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

pub struct EngineBuilder {
    registry: Arc<dyn ProcessRegistry>,
    tiers: TierSet,
    governor: Arc<QueueGovernor>,
    cancel_grace: Duration,
    job_store: Arc<dyn JobStore>,
    provenance_store: Arc<dyn ProvenanceStore>,
    catalog_store: Arc<dyn CatalogStore>,
    authorizer: Arc<dyn Authorizer>,
    scheduler: Arc<dyn CleanupScheduler>,
    guard: AddressGuard,
    cleanup_retry: RetryConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            registry: Arc::new(InMemoryRegistry::new()),
            tiers: TierSet::new(),
            governor: Arc::new(QueueGovernor::new(4)),
            cancel_grace: Duration::from_secs(5),
            job_store: Arc::new(MemoryJobStore::new()),
            provenance_store: Arc::new(MemoryProvenanceStore::new()),
            catalog_store: Arc::new(MemoryCatalogStore::new()),
            authorizer: Arc::new(AllowTenant),
            scheduler: Arc::new(TokioScheduler),
            guard: AddressGuard::new(),
            cleanup_retry: RetryConfig::default(),
        }
    }
}

impl EngineBuilder {
    /// Stores, capacities, the database and subprocess tiers and the catalog
    /// adapter as configured. In-process operations and the registry are
    /// added by the caller.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut builder = Self {
            governor: Arc::new(QueueGovernor::from_config(config)),
            cancel_grace: config.cancel_grace(),
            guard: AddressGuard::new().with_blocked_hosts(config.catalog.blocked_hosts.iter().cloned()),
            cleanup_retry: config.cleanup_retry.clone(),
            ..Self::default()
        }
        .tier(Arc::new(DatabaseTier::detached()))
        .tier(Arc::new(SubprocessTier::from_config(&config.subprocess)));

        if let Some(dir) = &config.data_dir {
            builder.job_store = Arc::new(FileJobStore::new(dir)?);
            builder.provenance_store = Arc::new(JsonlProvenanceStore::new(dir)?);
        }
        if let Some(url) = &config.catalog.features_api_url {
            let store = FeaturesApiStore::new(url)
                .map_err(|e| EngineError::Config(format!("catalog.features_api_url: {e}")))?;
            builder.catalog_store = Arc::new(store);
        }
        Ok(builder)
    }

    pub fn registry(mut self, registry: Arc<dyn ProcessRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces any tier of the same kind.
    pub fn tier(mut self, tier: Arc<dyn ExecutionTier>) -> Self {
        self.tiers.insert(tier);
        self
    }

    pub fn governor(mut self, governor: Arc<QueueGovernor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = store;
        self
    }

    pub fn provenance_store(mut self, store: Arc<dyn ProvenanceStore>) -> Self {
        self.provenance_store = store;
        self
    }

    pub fn catalog_store(mut self, store: Arc<dyn CatalogStore>) -> Self {
        self.catalog_store = store;
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn CleanupScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Restores persisted jobs and provenance before returning.
    pub fn build(self) -> Result<Engine> {
        let provenance = ProvenanceRecorder::new(self.provenance_store)?;
        let ledger = JobLedger::new(self.job_store);
        ledger.restore(|job| {
            if let Err(e) = provenance.record(job, raw_inputs_hash(&job.inputs), None) {
                warn!(job = %job.id, error = %e, "provenance not recorded");
            }
        })?;
        let catalog = CatalogBinding::new(self.catalog_store, self.authorizer, self.scheduler)?
            .with_guard(self.guard)?
            .with_cleanup_retry(self.cleanup_retry);
        let coordinator =
            TierCoordinator::new(self.governor, self.tiers).with_cancel_grace(self.cancel_grace);

        info!(tiers = ?coordinator.tiers().kinds(), processes = self.registry.list().len(), "engine ready");
        Ok(Engine {
            inner: Arc::new(EngineInner {
                workflows: WorkflowExecutor::new(Arc::clone(&self.registry)),
                registry: self.registry,
                ledger,
                coordinator,
                catalog,
                provenance,
            }),
        })
    }
}

struct EngineInner {
    registry: Arc<dyn ProcessRegistry>,
    ledger: JobLedger,
    coordinator: TierCoordinator,
    catalog: CatalogBinding,
    provenance: ProvenanceRecorder,
    workflows: WorkflowExecutor,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Validates the inputs against the process schema, admits the job and
    /// starts it in the background. Nothing is admitted when validation fails.
    pub fn submit(
        &self,
        process_id: &str,
        inputs: BTreeMap<String, InputValue>,
        options: SubmitOptions,
    ) -> Result<JobHandle> {
        let process = self.describe_process(process_id)?;
        validate_inputs(&process, &inputs)?;
        if let Some(output) = &options.output
            && !process.has_output(&output.output)
        {
            return Err(EngineError::Validation(format!(
                "process {} has no output {}",
                process.id, output.output
            )));
        }

        let mut job = Job::new(&process.id, inputs);
        job.workflow_id = options.workflow_id.clone();
        let record = self.inner.ledger.create(job);
        let id = record.id();
        info!(job = %id, process = %process.id, tenant = %options.identity.tenant, "job submitted");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run_job(record, process, options));
        Ok(JobHandle {
            id,
            engine: self.clone(),
        })
    }

    /// Submits and waits for the terminal state.
    pub async fn execute(
        &self,
        process_id: &str,
        inputs: BTreeMap<String, InputValue>,
        options: SubmitOptions,
    ) -> Result<Job> {
        self.submit(process_id, inputs, options)?.wait().await
    }

    pub fn get_status(&self, job_id: &str) -> Result<Job> {
        self.inner.ledger.snapshot(job_id)
    }

    pub fn cancel(&self, job_id: &str) -> Result<JobState> {
        self.inner.ledger.request_cancel(job_id)
    }

    pub async fn wait(&self, job_id: &str) -> Result<Job> {
        self.inner.ledger.wait(job_id).await
    }

    /// Newest first.
    pub fn list_jobs(&self, limit: usize, offset: usize) -> Vec<Job> {
        self.inner.ledger.list(limit, offset)
    }

    /// Outputs of a succeeded job. A job that ended any other way answers
    /// with its own error.
    pub fn results(&self, job_id: &str) -> Result<Parameters> {
        let job = self.get_status(job_id)?;
        match job.state {
            JobState::Succeeded => Ok(job.outputs.unwrap_or_default()),
            JobState::Failed => Err(EngineError::JobFailed {
                detail: job.error.unwrap_or_else(|| {
                    ErrorDetail::new(ErrorKind::Internal, "job failed without detail")
                }),
                job_id: job.id,
            }),
            JobState::Cancelled => Err(EngineError::Cancelled { forced: false }),
            state => Err(EngineError::ResultsNotReady {
                job_id: job.id,
                state,
            }),
        }
    }

    pub fn processes(&self) -> Vec<Arc<Process>> {
        self.inner.registry.list()
    }

    pub fn describe_process(&self, process_id: &str) -> Result<Arc<Process>> {
        self.inner
            .registry
            .get(process_id)
            .ok_or_else(|| EngineError::ProcessNotFound(process_id.to_string()))
    }

    pub fn provenance(&self, job_id: &str) -> Option<ProvenanceRecord> {
        self.inner.provenance.get(job_id)
    }

    pub fn provenance_log(&self) -> Vec<ProvenanceRecord> {
        self.inner.provenance.all()
    }

    pub fn check_reproducibility(&self, process_id: &str) -> Result<Vec<Divergence>> {
        let process = self.describe_process(process_id)?;
        Ok(self.inner.provenance.check_reproducibility(&process))
    }

    pub fn catalog(&self) -> &CatalogBinding {
        &self.inner.catalog
    }

    pub fn governor(&self) -> &Arc<QueueGovernor> {
        self.inner.coordinator.governor()
    }

    pub fn submit_workflow(&self, def: WorkflowDefinition, identity: Identity) -> Result<String> {
        let runner: Arc<dyn StepRunner> = Arc::new(self.clone());
        self.inner.workflows.submit(runner, def, identity)
    }

    pub fn workflow_status(&self, id: &str) -> Result<WorkflowRun> {
        self.inner.workflows.status(id)
    }

    pub fn cancel_workflow(&self, id: &str) -> Result<WorkflowState> {
        self.inner.workflows.cancel(id)
    }

    pub async fn wait_workflow(&self, id: &str) -> Result<WorkflowRun> {
        self.inner.workflows.wait(id).await
    }
}

#[async_trait]
impl StepRunner for Engine {
    async fn start_step(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        inputs: BTreeMap<String, InputValue>,
        identity: &Identity,
    ) -> Result<JobId> {
        let options = SubmitOptions {
            output: step.output.clone(),
            identity: identity.clone(),
            workflow_id: Some(workflow_id.to_string()),
        };
        let handle = self.submit(&step.process, inputs, options)?;
        Ok(handle.id)
    }

    async fn wait_job(&self, job_id: &str) -> Result<Job> {
        self.wait(job_id).await
    }

    fn cancel_job(&self, job_id: &str) -> Result<JobState> {
        self.cancel(job_id)
    }
}

/// Every supplied input must be declared, literals must match their type
/// and catalog references may only feed feature collections.
fn validate_inputs(process: &Process, inputs: &BTreeMap<String, InputValue>) -> Result<()> {
    for (name, value) in inputs {
        let spec = process.input(name).ok_or_else(|| {
            EngineError::Validation(format!("process {} has no input {name}", process.id))
        })?;
        let accepted = match value {
            InputValue::Literal(v) => spec.ty.accepts(v),
            InputValue::Catalog(_) => {
                matches!(spec.ty, ParameterType::FeatureCollection | ParameterType::Any)
            }
        };
        if !accepted {
            return Err(EngineError::Validation(format!(
                "input {name} of {} expects {}",
                process.id, spec.ty
            )));
        }
    }
    if let Some(missing) = process
        .inputs()
        .find(|p| p.required && !inputs.contains_key(&p.name))
    {
        return Err(EngineError::Validation(format!(
            "missing required input {} for {}",
            missing.name, process.id
        )));
    }
    Ok(())
}

/// Hash of the inputs as submitted, for jobs that never got them resolved.
fn raw_inputs_hash(inputs: &BTreeMap<String, InputValue>) -> String {
    content_hash(&serde_json::to_value(inputs).unwrap_or(Value::Null))
}

fn parameters_value(params: &Parameters) -> Value {
    Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Feeds coordinator progress into the job record.
struct JobObserver<'a> {
    record: &'a JobRecord,
}

impl AttemptObserver for JobObserver<'_> {
    fn on_reserved(&mut self, tier: TierKind) {
        if self.record.state() == JobState::Queued
            && let Err(e) = self.record.apply(Transition::Start)
        {
            debug!(job = %self.record.id(), %tier, error = %e, "job not started");
        }
        self.record.set_progress(20);
    }

    fn on_attempt(&mut self, attempt: TierAttempt) {
        self.record.record_attempt(attempt);
    }
}

impl EngineInner {
    async fn run_job(self: Arc<Self>, record: JobRecord, process: Arc<Process>, options: SubmitOptions) {
        let job_id = record.id();
        let inputs = record.snapshot().inputs;
        let ctx = ExecutionContext::new(&job_id, options.identity.clone())
            .with_cancel(record.cancel_token());

        let resolved = self
            .with_grace(&ctx, self.resolve_inputs(&inputs, &options.identity))
            .await;
        let (input_hash, outcome) = match resolved {
            Ok(params) => {
                let input_hash = content_hash(&parameters_value(&params));
                record.set_progress(10);
                let outcome = self.run_resolved(&record, &process, &params, &ctx, &options).await;
                (input_hash, outcome)
            }
            Err(e) => {
                warn!(job = %job_id, error = %e, "input resolution failed");
                (raw_inputs_hash(&inputs), Err(e))
            }
        };

        self.finish(&record, outcome, input_hash);
    }

    async fn resolve_inputs(
        &self,
        inputs: &BTreeMap<String, InputValue>,
        identity: &Identity,
    ) -> Result<Parameters> {
        let mut params = Parameters::new();
        for (name, input) in inputs {
            let value = match input {
                InputValue::Literal(v) => v.clone(),
                InputValue::Catalog(reference) => {
                    let records = self.catalog.collect_input(reference, identity).await?;
                    debug!(input = %name, records = records.len(), "catalog input resolved");
                    feature_collection(records)
                }
            };
            params.insert(name.clone(), value);
        }
        Ok(params)
    }

    async fn run_resolved(
        &self,
        record: &JobRecord,
        process: &Process,
        params: &Parameters,
        ctx: &ExecutionContext,
        options: &SubmitOptions,
    ) -> Result<Parameters> {
        let mut observer = JobObserver { record };
        let execution = self
            .coordinator
            .execute(process, params, ctx, &mut observer)
            .await?;

        if let Some(spec) = &options.output {
            let value = execution.outputs.get(&spec.output).ok_or_else(|| {
                EngineError::Validation(format!(
                    "{} produced no output {}",
                    process.id, spec.output
                ))
            })?;
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled { forced: false });
            }
            let registering = async {
                self.catalog
                    .register_output(records_from_value(value), spec, &options.identity)
                    .await
                    .map_err(EngineError::from)
            };
            let registration = match self.with_grace(ctx, registering).await {
                Err(EngineError::Cancelled { forced: true }) => {
                    // The write may have landed before it was dropped.
                    self.withdraw(ctx, &spec.id, &options.identity).await;
                    return Err(EngineError::Cancelled { forced: true });
                }
                other => other?,
            };
            if ctx.cancel.is_cancelled() {
                if let Some(cleanup) = &registration.cleanup {
                    cleanup.cancel();
                }
                self.withdraw(ctx, &registration.collection_id, &options.identity)
                    .await;
                return Err(EngineError::Cancelled { forced: false });
            }
            record.set_catalog_output(&spec.output, &registration.collection_id);
        }
        record.set_progress(100);
        Ok(execution.outputs)
    }

    /// Runs a catalog phase of the job. Once the job is cancelled the phase
    /// gets the coordinator's grace period to return; after that it is
    /// dropped and the job counts as force-cancelled.
    async fn with_grace<T>(
        &self,
        ctx: &ExecutionContext,
        phase: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::pin!(phase);
        tokio::select! {
            biased;
            out = &mut phase => return out,
            _ = ctx.cancel.cancelled() => {}
        }
        let grace = self.coordinator.cancel_grace();
        match tokio::time::timeout(grace, phase).await {
            Ok(out) => out,
            Err(_) => {
                warn!(job = %ctx.job_id, ?grace, "catalog call ignored cancellation, forcing");
                Err(EngineError::Cancelled { forced: true })
            }
        }
    }

    /// Removes an output published by a job that was cancelled meanwhile.
    async fn withdraw(&self, ctx: &ExecutionContext, collection: &str, identity: &Identity) {
        let grace = self.coordinator.cancel_grace();
        match tokio::time::timeout(grace, self.catalog.withdraw_output(collection, identity)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job = %ctx.job_id, %collection, error = %e, "output not withdrawn"),
            Err(_) => warn!(job = %ctx.job_id, %collection, "output withdrawal timed out"),
        }
    }

    /// Applies the terminal transition. Provenance is written before anyone
    /// waiting on the job sees it finish. A cancel request that arrived while
    /// the tier was running wins over its result.
    fn finish(&self, record: &JobRecord, outcome: Result<Parameters>, input_hash: String) {
        let transition = if record.state() == JobState::Cancelling {
            Transition::ConfirmCancel
        } else {
            match outcome {
                Ok(outputs) => Transition::Succeed(outputs),
                Err(e) => Transition::Fail(ErrorDetail::from(&e)),
            }
        };

        let audit = |job: &Job| {
            let output_hash = job.outputs.as_ref().map(|o| content_hash(&parameters_value(o)));
            if let Err(e) = self.provenance.record(job, input_hash.clone(), output_hash) {
                warn!(job = %job.id, error = %e, "provenance not recorded");
            }
        };
        let applied = match record.apply_observed(transition, audit) {
            Err(EngineError::InvalidTransition { .. }) if record.state() == JobState::Cancelling => {
                record.apply_observed(Transition::ConfirmCancel, audit)
            }
            other => other,
        };
        if let Err(e) = applied {
            warn!(job = %record.id(), error = %e, "terminal transition rejected");
        }
    }
}
