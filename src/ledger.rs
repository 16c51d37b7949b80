//! The job ledger: identity and lifecycle of every job.
//!
//! Each job lives in its own `watch` channel. Writers go through a
//! [`JobRecord`], which applies transitions as a single compare-and-modify on
//! the channel, so a job's state walk is totally ordered. Readers take the
//! latest published snapshot and never wait for the writer's work.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ErrorDetail, ErrorKind, Result};
use crate::state_machine::{Job, JobId, JobState, StateMachine, TierAttempt, Transition};

/// Durable home for job snapshots, keyed by job id.
pub trait JobStore: Send + Sync {
    /// Insert or replace the snapshot for `job.id`.
    fn save(&self, job: &Job) -> Result<()>;

    fn load_all(&self) -> Result<Vec<Job>>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn save(&self, job: &Job) -> Result<()> {
        self.jobs.write().insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().values().cloned().collect())
    }
}

/// One JSON file per job.
///
/// Layout: `{data_dir}/jobs/{job_id}.json`
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("jobs");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl JobStore for FileJobStore {
    fn save(&self, job: &Job) -> Result<()> {
        let path = self.path(&job.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(job)?;

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<Job>(&contents) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        Ok(jobs)
    }
}

struct JobEntry {
    tx: Arc<watch::Sender<Job>>,
    cancel: CancellationToken,
}

/// Write handle for one job. Held by the task that runs the job.
#[derive(Clone)]
pub struct JobRecord {
    tx: Arc<watch::Sender<Job>>,
    cancel: CancellationToken,
    store: Arc<dyn JobStore>,
}

impl JobRecord {
    pub fn id(&self) -> JobId {
        self.tx.borrow().id.clone()
    }

    pub fn snapshot(&self) -> Job {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> JobState {
        self.tx.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.tx.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Applies `transition` atomically with respect to every other writer.
    /// A rejected transition publishes nothing.
    pub fn apply(&self, transition: Transition) -> Result<JobState> {
        self.apply_observed(transition, |_| {})
    }

    /// Like [`apply`](Self::apply). The snapshot is persisted and `observe`
    /// runs on the updated job before any waiter is woken.
    pub fn apply_observed(
        &self,
        transition: Transition,
        observe: impl FnOnce(&Job),
    ) -> Result<JobState> {
        let mut result = Err(EngineError::Validation("transition not applied".into()));
        self.tx.send_if_modified(|job| {
            result = StateMachine::apply(job, transition);
            if result.is_err() {
                return false;
            }
            save(self.store.as_ref(), job);
            observe(job);
            true
        });
        let state = result?;
        info!(job = %self.id(), %state, "job transition");
        Ok(state)
    }

    pub fn record_attempt(&self, attempt: TierAttempt) {
        self.tx.send_modify(|job| job.record_attempt(attempt));
    }

    /// Progress only moves forward and is frozen once the job is terminal.
    pub fn set_progress(&self, progress: u8) {
        self.tx.send_if_modified(|job| {
            let progress = progress.min(100);
            if job.state.is_terminal() || progress <= job.progress {
                return false;
            }
            job.progress = progress;
            true
        });
    }

    pub fn set_catalog_output(&self, output: &str, collection_id: &str) {
        self.tx.send_modify(|job| {
            job.catalog_outputs
                .insert(output.to_string(), collection_id.to_string());
        });
    }

    fn persist(&self) {
        save(self.store.as_ref(), &self.tx.borrow());
    }
}

fn save(store: &dyn JobStore, job: &Job) {
    if let Err(e) = store.save(job) {
        warn!(job = %job.id, error = %e, "failed to persist job snapshot");
    }
}

pub struct JobLedger {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    store: Arc<dyn JobStore>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJobStore::new()))
    }

    /// Admits a new job and returns its write handle.
    pub fn create(&self, job: Job) -> JobRecord {
        let id = job.id.clone();
        let (tx, _) = watch::channel(job);
        let entry = JobEntry {
            tx: Arc::new(tx),
            cancel: CancellationToken::new(),
        };
        let record = self.handle(&entry);
        self.jobs.write().insert(id.clone(), entry);
        record.persist();
        debug!(job = %id, "job admitted");
        record
    }

    fn handle(&self, entry: &JobEntry) -> JobRecord {
        JobRecord {
            tx: Arc::clone(&entry.tx),
            cancel: entry.cancel.clone(),
            store: Arc::clone(&self.store),
        }
    }

    pub fn record(&self, id: &str) -> Result<JobRecord> {
        self.jobs
            .read()
            .get(id)
            .map(|entry| self.handle(entry))
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    pub fn snapshot(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .get(id)
            .map(|entry| entry.tx.borrow().clone())
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<Job>> {
        self.jobs
            .read()
            .get(id)
            .map(|entry| entry.tx.subscribe())
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    /// Idempotent. Returns the state the job is in afterwards; a terminal or
    /// already-cancelling job is left alone.
    pub fn request_cancel(&self, id: &str) -> Result<JobState> {
        let record = self.record(id)?;
        let state = record.state();
        if state.is_terminal() || state == JobState::Cancelling {
            debug!(job = %id, %state, "cancel is a no-op");
            return Ok(state);
        }
        match record.apply(Transition::RequestCancel) {
            Ok(state) => {
                record.cancel.cancel();
                Ok(state)
            }
            // Finished or cancelled concurrently.
            Err(EngineError::InvalidTransition { .. }) => Ok(record.state()),
            Err(e) => Err(e),
        }
    }

    /// Waits for the job to reach a terminal state.
    pub async fn wait(&self, id: &str) -> Result<Job> {
        let mut rx = self.subscribe(id)?;
        let job = rx
            .wait_for(|job| job.state.is_terminal())
            .await
            .map_err(|_| EngineError::JobNotFound(id.to_string()))?
            .clone();
        Ok(job)
    }

    /// Newest first.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .map(|entry| entry.tx.borrow().clone())
            .collect();
        jobs.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs.into_iter().skip(offset).take(limit).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Reloads persisted jobs. Jobs that were still in flight when the
    /// previous process stopped can never finish, so they are closed out;
    /// `on_closed` sees each of them in its terminal state before it is
    /// published.
    pub fn restore(&self, mut on_closed: impl FnMut(&Job)) -> Result<usize> {
        let jobs = self.store.load_all()?;
        let count = jobs.len();
        for job in jobs {
            if self.jobs.read().contains_key(&job.id) {
                continue;
            }
            let state = job.state;
            let record = self.create(job);
            let closing = match state {
                JobState::Queued | JobState::Running => Some(Transition::Fail(ErrorDetail::new(
                    ErrorKind::Interrupted,
                    "engine stopped before the job finished",
                ))),
                JobState::Cancelling => Some(Transition::ConfirmCancel),
                _ => None,
            };
            if let Some(transition) = closing {
                record.apply_observed(transition, &mut on_closed)?;
                warn!(job = %record.id(), "closed out interrupted job");
            }
        }
        info!(jobs = count, "restored job ledger");
        Ok(count)
    }
}
