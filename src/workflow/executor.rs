//! Drives a validated workflow to completion.
//!
//! Steps whose dependencies have all succeeded are started together, each as
//! an ordinary job, and joined through a `JoinSet`. A step that does not
//! succeed takes everything downstream of it with it, unattempted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::definition::{StepInput, WorkflowDefinition, WorkflowStep};
use super::graph::{StepGraph, validate};
use super::run::{StepState, WorkflowRun, WorkflowState};
use crate::catalog::Identity;
use crate::error::{EngineError, ErrorDetail, ErrorKind, Result};
use crate::process::{Parameters, ProcessRegistry};
use crate::state_machine::{InputValue, Job, JobId, JobState};

/// The single-job path a workflow step runs through.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Starts a job for `step` and returns without waiting for it.
    async fn start_step(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        inputs: BTreeMap<String, InputValue>,
        identity: &Identity,
    ) -> Result<JobId>;

    async fn wait_job(&self, job_id: &str) -> Result<Job>;

    fn cancel_job(&self, job_id: &str) -> Result<JobState>;
}

struct RunEntry {
    tx: Arc<watch::Sender<WorkflowRun>>,
    cancel: CancellationToken,
}

pub struct WorkflowExecutor {
    registry: Arc<dyn ProcessRegistry>,
    runs: RwLock<HashMap<String, RunEntry>>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<dyn ProcessRegistry>) -> Self {
        Self {
            registry,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Validates `def` and starts running it in the background. Nothing is
    /// started and no run is recorded when validation fails.
    pub fn submit(
        &self,
        runner: Arc<dyn StepRunner>,
        def: WorkflowDefinition,
        identity: Identity,
    ) -> Result<String> {
        let graph = validate(&def, self.registry.as_ref())?;
        let id = def
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (tx, cancel) = {
            let mut runs = self.runs.write();
            if runs.contains_key(&id) {
                return Err(EngineError::Validation(format!(
                    "workflow id {id} is already in use"
                )));
            }
            let (tx, _) = watch::channel(WorkflowRun::new(&id, &def));
            let entry = RunEntry {
                tx: Arc::new(tx),
                cancel: CancellationToken::new(),
            };
            let handles = (Arc::clone(&entry.tx), entry.cancel.clone());
            runs.insert(id.clone(), entry);
            handles
        };
        info!(workflow = %id, steps = def.steps.len(), "workflow admitted");

        let waiting_on = (0..graph.len())
            .map(|i| graph.dependencies(i).len())
            .collect();
        let driver = Driver {
            id: id.clone(),
            runner,
            def,
            graph,
            tx,
            cancel,
            identity,
            outputs: HashMap::new(),
            waiting_on,
            job_ids: HashMap::new(),
        };
        tokio::spawn(driver.run());
        Ok(id)
    }

    pub fn status(&self, id: &str) -> Result<WorkflowRun> {
        self.runs
            .read()
            .get(id)
            .map(|entry| entry.tx.borrow().clone())
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))
    }

    /// Idempotent. Pending steps are never started; running steps get their
    /// own jobs cancelled.
    pub fn cancel(&self, id: &str) -> Result<WorkflowState> {
        let (tx, cancel) = self
            .runs
            .read()
            .get(id)
            .map(|entry| (Arc::clone(&entry.tx), entry.cancel.clone()))
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))?;

        let changed = tx.send_if_modified(|run| {
            if run.cancelled || run.is_finished() {
                return false;
            }
            run.cancelled = true;
            run.recompute();
            true
        });
        if changed {
            info!(workflow = %id, "workflow cancellation requested");
            cancel.cancel();
        }
        let state = tx.borrow().state;
        Ok(state)
    }

    /// Waits until every step is terminal.
    pub async fn wait(&self, id: &str) -> Result<WorkflowRun> {
        let mut rx = self
            .runs
            .read()
            .get(id)
            .map(|entry| entry.tx.subscribe())
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))?;
        let run = rx
            .wait_for(WorkflowRun::is_finished)
            .await
            .map_err(|_| EngineError::WorkflowNotFound(id.to_string()))?
            .clone();
        Ok(run)
    }
}

struct Driver {
    id: String,
    runner: Arc<dyn StepRunner>,
    def: WorkflowDefinition,
    graph: StepGraph,
    tx: Arc<watch::Sender<WorkflowRun>>,
    cancel: CancellationToken,
    identity: Identity,
    outputs: HashMap<usize, Parameters>,
    /// Dependencies of each step that have not succeeded yet.
    waiting_on: Vec<usize>,
    job_ids: HashMap<usize, JobId>,
}

impl Driver {
    async fn run(mut self) {
        let mut ready: VecDeque<usize> = self
            .graph
            .topological_order()
            .into_iter()
            .filter(|&i| self.waiting_on[i] == 0)
            .collect();
        let mut running: JoinSet<(usize, Result<Job>)> = JoinSet::new();
        let cancel = self.cancel.clone();
        let mut cancel_seen = false;

        loop {
            if !cancel_seen && cancel.is_cancelled() {
                cancel_seen = true;
                ready.clear();
                self.cancel_outstanding();
            }
            while let Some(i) = ready.pop_front() {
                self.launch(i, &mut running).await;
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok((i, result))) => ready.extend(self.finish(i, result)),
                    Some(Err(e)) => {
                        warn!(workflow = %self.id, error = %e, "step watcher task failed");
                        self.abandon_running(&e.to_string());
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if !cancel_seen => {}
            }
        }

        // Anything still pending can no longer run.
        self.update(|run| {
            for step in run.steps.iter_mut().filter(|s| s.state == StepState::Pending) {
                step.state = StepState::Cancelled;
            }
        });
        let state = self.tx.borrow().state;
        info!(workflow = %self.id, %state, "workflow finished");
    }

    async fn launch(&mut self, i: usize, running: &mut JoinSet<(usize, Result<Job>)>) {
        if self.cancel.is_cancelled() {
            self.set_step(i, StepState::Cancelled, None);
            return;
        }
        let inputs = match self.bind_inputs(i) {
            Ok(inputs) => inputs,
            Err(detail) => {
                self.set_step(i, StepState::Failed, Some(detail));
                self.skip_dependents(i);
                return;
            }
        };

        let started = self
            .runner
            .start_step(&self.id, &self.def.steps[i], inputs, &self.identity)
            .await;
        match started {
            Ok(job_id) => {
                debug!(workflow = %self.id, step = %self.graph.id(i), job = %job_id, "step started");
                let recorded = job_id.clone();
                self.update(|run| {
                    run.steps[i].state = StepState::Running;
                    run.steps[i].job_id = Some(recorded);
                });
                self.job_ids.insert(i, job_id.clone());
                let runner = Arc::clone(&self.runner);
                running.spawn(async move {
                    let result = runner.wait_job(&job_id).await;
                    (i, result)
                });
            }
            Err(e) => {
                warn!(workflow = %self.id, step = %self.graph.id(i), error = %e, "step could not start");
                self.set_step(i, StepState::Failed, Some(ErrorDetail::from(&e)));
                self.skip_dependents(i);
            }
        }
    }

    /// Literal and catalog inputs pass through; pointers are replaced by the
    /// referenced step's output value.
    fn bind_inputs(&self, i: usize) -> std::result::Result<BTreeMap<String, InputValue>, ErrorDetail> {
        self.def.steps[i]
            .inputs
            .iter()
            .map(|(name, input)| -> std::result::Result<(String, InputValue), ErrorDetail> {
                let value = match input {
                    StepInput::Literal(v) => InputValue::Literal(v.clone()),
                    StepInput::Catalog(r) => InputValue::Catalog(r.clone()),
                    StepInput::From(source) => {
                        let value = self
                            .graph
                            .index_of(&source.step)
                            .and_then(|j| self.outputs.get(&j))
                            .and_then(|outputs| outputs.get(&source.output))
                            .cloned()
                            .ok_or_else(|| {
                                ErrorDetail::new(
                                    ErrorKind::Validation,
                                    format!(
                                        "step {} produced no output {}",
                                        source.step, source.output
                                    ),
                                )
                            })?;
                        InputValue::Literal(value)
                    }
                };
                Ok((name.clone(), value))
            })
            .collect()
    }

    /// Records a finished step job and returns the steps it unblocked.
    fn finish(&mut self, i: usize, result: Result<Job>) -> Vec<usize> {
        self.job_ids.remove(&i);
        let job = match result {
            Ok(job) => job,
            Err(e) => {
                self.set_step(i, StepState::Failed, Some(ErrorDetail::from(&e)));
                self.skip_dependents(i);
                return Vec::new();
            }
        };

        match job.state {
            JobState::Succeeded => {
                self.outputs.insert(i, job.outputs.unwrap_or_default());
                self.set_step(i, StepState::Succeeded, None);
                if self.cancel.is_cancelled() {
                    return Vec::new();
                }
                let mut unblocked = Vec::new();
                for &d in self.graph.dependents(i) {
                    self.waiting_on[d] -= 1;
                    if self.waiting_on[d] == 0 && self.tx.borrow().steps[d].state == StepState::Pending {
                        unblocked.push(d);
                    }
                }
                unblocked
            }
            JobState::Cancelled => {
                self.set_step(i, StepState::Cancelled, job.error);
                self.skip_dependents(i);
                Vec::new()
            }
            _ => {
                let detail = job
                    .error
                    .unwrap_or_else(|| ErrorDetail::new(ErrorKind::Internal, "job failed without detail"));
                info!(workflow = %self.id, step = %self.graph.id(i), error = %detail, "step failed");
                self.set_step(i, StepState::Failed, Some(detail));
                self.skip_dependents(i);
                Vec::new()
            }
        }
    }

    /// Marks every pending step downstream of `i` without attempting it.
    fn skip_dependents(&self, i: usize) {
        let upstream = self.graph.id(i).to_string();
        let cancelled = self.cancel.is_cancelled();
        let targets = self.graph.transitive_dependents(i);
        self.update(|run| {
            for d in targets {
                let step = &mut run.steps[d];
                if step.state != StepState::Pending {
                    continue;
                }
                if cancelled {
                    step.state = StepState::Cancelled;
                } else {
                    step.state = StepState::Failed;
                    step.error = Some(ErrorDetail::new(
                        ErrorKind::UpstreamFailed,
                        format!("not run: upstream step {upstream} did not succeed"),
                    ));
                }
            }
        });
    }

    fn cancel_outstanding(&self) {
        self.update(|run| {
            for step in run.steps.iter_mut().filter(|s| s.state == StepState::Pending) {
                step.state = StepState::Cancelled;
            }
        });
        for (&i, job_id) in &self.job_ids {
            match self.runner.cancel_job(job_id) {
                Ok(state) => debug!(workflow = %self.id, step = %self.graph.id(i), %state, "step cancel requested"),
                Err(e) => warn!(workflow = %self.id, step = %self.graph.id(i), error = %e, "step cancel failed"),
            }
        }
    }

    /// A watcher task died, so the step it watched can no longer be tracked.
    fn abandon_running(&mut self, reason: &str) {
        let orphaned: Vec<usize> = {
            let run = self.tx.borrow();
            self.job_ids
                .keys()
                .copied()
                .filter(|&i| run.steps[i].state == StepState::Running)
                .collect()
        };
        for i in orphaned {
            self.job_ids.remove(&i);
            self.set_step(
                i,
                StepState::Failed,
                Some(ErrorDetail::new(ErrorKind::Internal, reason)),
            );
            self.skip_dependents(i);
        }
    }

    fn set_step(&self, i: usize, state: StepState, error: Option<ErrorDetail>) {
        self.update(|run| {
            run.steps[i].state = state;
            if error.is_some() {
                run.steps[i].error = error;
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut WorkflowRun)) {
        self.tx.send_modify(|run| {
            f(run);
            run.recompute();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TierError;
    use crate::ledger::JobLedger;
    use crate::process::{InMemoryRegistry, ParameterSpec, ParameterType, Process, TierKind};
    use crate::state_machine::Transition;
    use crate::workflow::WorkflowStep;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::time::Duration;

    type Script = Arc<dyn Fn(&BTreeMap<String, InputValue>) -> std::result::Result<Parameters, TierError> + Send + Sync>;

    /// Runs each step as a ledger job whose outcome is scripted per process.
    struct ScriptedRunner {
        ledger: JobLedger,
        scripts: HashMap<String, Script>,
        started: Mutex<Vec<String>>,
        barrier: Option<Arc<tokio::sync::Barrier>>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                ledger: JobLedger::in_memory(),
                scripts: HashMap::new(),
                started: Mutex::new(Vec::new()),
                barrier: None,
            }
        }

        fn script<F>(mut self, process: &str, f: F) -> Self
        where
            F: Fn(&BTreeMap<String, InputValue>) -> std::result::Result<Parameters, TierError>
                + Send
                + Sync
                + 'static,
        {
            self.scripts.insert(process.to_string(), Arc::new(f));
            self
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().clone()
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn start_step(
            &self,
            workflow_id: &str,
            step: &WorkflowStep,
            inputs: BTreeMap<String, InputValue>,
            _identity: &Identity,
        ) -> Result<JobId> {
            self.started.lock().push(step.id.clone());
            let mut job = Job::new(&step.process, inputs.clone());
            job.workflow_id = Some(workflow_id.to_string());
            let record = self.ledger.create(job);
            let script = self.scripts.get(&step.process).cloned();
            let barrier = self.barrier.clone();
            let id = record.id();

            tokio::spawn(async move {
                record.apply(Transition::Start).ok();
                if let Some(barrier) = barrier {
                    barrier.wait().await;
                }
                let outcome = match script {
                    Some(script) => script(&inputs),
                    None => {
                        // No script: hang until cancelled.
                        record.cancel_token().cancelled().await;
                        Err(TierError::Cancelled)
                    }
                };
                let transition = match outcome {
                    Ok(outputs) => Transition::Succeed(outputs),
                    Err(TierError::Cancelled) => Transition::ConfirmCancel,
                    Err(e) => Transition::Fail(ErrorDetail::new(ErrorKind::Execution, e.to_string())),
                };
                record.apply(transition).ok();
            });
            Ok(id)
        }

        async fn wait_job(&self, job_id: &str) -> Result<Job> {
            self.ledger.wait(job_id).await
        }

        fn cancel_job(&self, job_id: &str) -> Result<JobState> {
            self.ledger.request_cancel(job_id)
        }
    }

    fn registry() -> Arc<InMemoryRegistry> {
        let registry = InMemoryRegistry::new();
        for id in ["emit", "double", "fail", "hang"] {
            registry
                .register(
                    Process::new(id, vec![TierKind::InProcess])
                        .with_parameter(ParameterSpec::optional_input("x", ParameterType::Number))
                        .with_parameter(ParameterSpec::output("x", ParameterType::Number)),
                )
                .unwrap();
        }
        Arc::new(registry)
    }

    fn literal(inputs: &BTreeMap<String, InputValue>, name: &str) -> f64 {
        match inputs.get(name) {
            Some(InputValue::Literal(Value::Number(n))) => n.as_f64().unwrap_or_default(),
            _ => 0.0,
        }
    }

    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .script("emit", |_| Ok(Parameters::from([("x".to_string(), json!(7.0))])))
            .script("double", |inputs| {
                Ok(Parameters::from([(
                    "x".to_string(),
                    json!(literal(inputs, "x") * 2.0),
                )]))
            })
            .script("fail", |_| Err(TierError::Execution("topology exception".into())))
    }

    async fn wait(executor: &WorkflowExecutor, id: &str) -> WorkflowRun {
        tokio::time::timeout(Duration::from_secs(5), executor.wait(id))
            .await
            .expect("workflow did not finish")
            .unwrap()
    }

    #[tokio::test]
    async fn pointers_are_substituted_in_dependency_order() {
        let executor = WorkflowExecutor::new(registry());
        let runner = Arc::new(runner());
        let def = WorkflowDefinition::new(vec![
            WorkflowStep::new("quad", "double").from_step("x", "twice", "x"),
            WorkflowStep::new("twice", "double").from_step("x", "seed", "x"),
            WorkflowStep::new("seed", "emit"),
        ]);

        let id = executor.submit(runner.clone(), def, Identity::system()).unwrap();
        let run = wait(&executor, &id).await;

        assert_eq!(run.state, WorkflowState::Succeeded);
        assert_eq!(runner.started(), vec!["seed", "twice", "quad"]);
        let quad_job = run.step("quad").unwrap().job_id.clone().unwrap();
        let job = runner.ledger.snapshot(&quad_job).unwrap();
        assert_eq!(job.outputs.unwrap()["x"], json!(28.0));
        assert_eq!(job.workflow_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn failure_propagates_to_all_dependents_unattempted() {
        let executor = WorkflowExecutor::new(registry());
        let runner = Arc::new(runner());
        let def = WorkflowDefinition::new(vec![
            WorkflowStep::new("a", "fail"),
            WorkflowStep::new("b", "double").from_step("x", "a", "x"),
            WorkflowStep::new("c", "double").after("a"),
            WorkflowStep::new("d", "double").from_step("x", "b", "x"),
        ]);

        let id = executor.submit(runner.clone(), def, Identity::system()).unwrap();
        let run = wait(&executor, &id).await;

        assert_eq!(run.state, WorkflowState::Failed);
        assert_eq!(runner.started(), vec!["a"]);
        let a = run.step("a").unwrap();
        assert_eq!(a.state, StepState::Failed);
        assert!(a.error.as_ref().unwrap().message.contains("topology exception"));
        for id in ["b", "c", "d"] {
            let step = run.step(id).unwrap();
            assert_eq!(step.state, StepState::Failed, "{id}");
            assert!(step.job_id.is_none());
            assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::UpstreamFailed);
        }
    }

    #[tokio::test]
    async fn succeeded_siblings_are_kept_when_another_branch_fails() {
        let executor = WorkflowExecutor::new(registry());
        let runner = Arc::new(runner());
        let def = WorkflowDefinition::new(vec![
            WorkflowStep::new("ok", "emit"),
            WorkflowStep::new("bad", "fail"),
        ]);
        let id = executor.submit(runner.clone(), def, Identity::system()).unwrap();
        let run = wait(&executor, &id).await;

        assert_eq!(run.state, WorkflowState::Failed);
        let ok = run.step("ok").unwrap();
        assert_eq!(ok.state, StepState::Succeeded);
        let job = runner.ledger.snapshot(ok.job_id.as_ref().unwrap()).unwrap();
        assert_eq!(job.outputs.unwrap()["x"], json!(7.0));
    }

    #[tokio::test]
    async fn optional_failure_gives_partial_success() {
        let executor = WorkflowExecutor::new(registry());
        let runner = Arc::new(runner());
        let def = WorkflowDefinition::new(vec![
            WorkflowStep::new("seed", "emit"),
            WorkflowStep::new("extra", "fail").after("seed").optional(),
        ]);
        let id = executor.submit(runner, def, Identity::system()).unwrap();
        let run = wait(&executor, &id).await;
        assert_eq!(run.state, WorkflowState::PartiallySucceeded);
    }

    #[tokio::test]
    async fn independent_steps_run_concurrently() {
        let executor = WorkflowExecutor::new(registry());
        let mut runner = runner();
        runner.barrier = Some(Arc::new(tokio::sync::Barrier::new(3)));
        let def = WorkflowDefinition::new(vec![
            WorkflowStep::new("a", "emit"),
            WorkflowStep::new("b", "emit"),
            WorkflowStep::new("c", "emit"),
        ]);
        let id = executor.submit(Arc::new(runner), def, Identity::system()).unwrap();
        // Sequential execution would never get past the barrier.
        let run = wait(&executor, &id).await;
        assert_eq!(run.state, WorkflowState::Succeeded);
    }

    #[tokio::test]
    async fn cancel_stops_running_and_pending_steps() {
        let executor = WorkflowExecutor::new(registry());
        let runner = Arc::new(runner());
        let def = WorkflowDefinition::new(vec![
            WorkflowStep::new("slow", "hang"),
            WorkflowStep::new("after", "double").from_step("x", "slow", "x"),
        ]);
        let id = executor.submit(runner.clone(), def, Identity::system()).unwrap();

        // Let the first step start.
        for _ in 0..100 {
            if executor.status(&id).unwrap().step("slow").unwrap().state == StepState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.cancel(&id).unwrap(), WorkflowState::Running);
        let run = wait(&executor, &id).await;

        assert_eq!(run.state, WorkflowState::Cancelled);
        assert_eq!(run.step("slow").unwrap().state, StepState::Cancelled);
        assert_eq!(run.step("after").unwrap().state, StepState::Cancelled);
        assert_eq!(runner.started(), vec!["slow"]);
        // Cancelling a finished run changes nothing.
        assert_eq!(executor.cancel(&id).unwrap(), WorkflowState::Cancelled);
    }

    #[tokio::test]
    async fn invalid_workflow_leaves_no_run() {
        let executor = WorkflowExecutor::new(registry());
        let runner = Arc::new(runner());
        let mut def = WorkflowDefinition::new(vec![
            WorkflowStep::new("a", "emit").after("b"),
            WorkflowStep::new("b", "emit").after("a"),
        ]);
        def.id = Some("loop".into());
        assert!(matches!(
            executor.submit(runner.clone(), def, Identity::system()),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(executor.status("loop"), Err(EngineError::WorkflowNotFound(_))));
        assert!(runner.started().is_empty());
    }
}
