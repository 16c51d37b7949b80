//! Append-only audit trail of completed jobs.
//!
//! A [`ProvenanceRecord`] ties a job's canonical input hash to its output
//! hash and the tier that produced it. For deterministic processes equal
//! input hashes must give equal output hashes;
//! [`ProvenanceRecorder::check_reproducibility`] reports the cases where they
//! do not.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::process::{Process, TierKind};
use crate::state_machine::{Job, JobId, JobState, TierAttempt};

/// Immutable audit entry written when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub job_id: JobId,
    pub process_id: String,
    pub state: JobState,
    pub attempted_tiers: Vec<TierAttempt>,
    /// The tier that produced the outputs, if any did.
    pub tier: Option<TierKind>,
    pub input_hash: String,
    pub output_hash: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl ProvenanceRecord {
    /// Builds the entry for a terminal job.
    pub fn from_job(job: &Job, input_hash: String, output_hash: Option<String>) -> Self {
        let completed_at = job.completed_at.unwrap_or_else(Utc::now);
        Self {
            job_id: job.id.clone(),
            process_id: job.process_id.clone(),
            state: job.state,
            attempted_tiers: job.attempted_tiers.clone(),
            tier: job.executing_tier(),
            input_hash,
            output_hash,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at,
            duration_ms: (completed_at - job.submitted_at).num_milliseconds(),
        }
    }
}

/// Storage behind the recorder. Exposes no update or delete.
pub trait ProvenanceStore: Send + Sync {
    fn append(&self, record: &ProvenanceRecord) -> Result<()>;
    fn load_all(&self) -> Result<Vec<ProvenanceRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryProvenanceStore {
    records: RwLock<Vec<ProvenanceRecord>>,
}

impl MemoryProvenanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProvenanceStore for MemoryProvenanceStore {
    fn append(&self, record: &ProvenanceRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ProvenanceRecord>> {
        Ok(self.records.read().clone())
    }
}

/// JSON Lines file, one record per line.
///
/// Layout: `{data_dir}/provenance.jsonl`
#[derive(Debug)]
pub struct JsonlProvenanceStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlProvenanceStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: data_dir.join("provenance.jsonl"),
            write_lock: Mutex::new(()),
        })
    }
}

impl ProvenanceStore for JsonlProvenanceStore {
    fn append(&self, record: &ProvenanceRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ProvenanceRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

/// One input hash of a deterministic process that produced more than one
/// distinct output hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub input_hash: String,
    pub output_hashes: Vec<String>,
    pub job_ids: Vec<JobId>,
}

pub struct ProvenanceRecorder {
    store: Arc<dyn ProvenanceStore>,
    index: RwLock<HashMap<JobId, ProvenanceRecord>>,
}

impl ProvenanceRecorder {
    pub fn new(store: Arc<dyn ProvenanceStore>) -> Result<Self> {
        let index = store
            .load_all()?
            .into_iter()
            .map(|r| (r.job_id.clone(), r))
            .collect();
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryProvenanceStore::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Appends the entry for a terminal job. A job is recorded at most once.
    pub fn record(
        &self,
        job: &Job,
        input_hash: String,
        output_hash: Option<String>,
    ) -> Result<ProvenanceRecord> {
        if !job.state.is_terminal() {
            return Err(EngineError::Validation(format!(
                "job {} is {}, provenance is only written for terminal jobs",
                job.id, job.state
            )));
        }
        let record = ProvenanceRecord::from_job(job, input_hash, output_hash);

        let mut index = self.index.write();
        if index.contains_key(&record.job_id) {
            return Err(EngineError::ProvenanceExists(record.job_id));
        }
        self.store.append(&record)?;
        index.insert(record.job_id.clone(), record.clone());
        info!(job = %record.job_id, state = %record.state, input = %short(&record.input_hash), "provenance recorded");
        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Option<ProvenanceRecord> {
        self.index.read().get(job_id).cloned()
    }

    /// Every record, oldest completion first.
    pub fn all(&self) -> Vec<ProvenanceRecord> {
        let mut records: Vec<_> = self.index.read().values().cloned().collect();
        records.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        records
    }

    /// Succeeded runs of `process` grouped by input hash, keeping only the
    /// groups whose output hashes disagree. Empty for non-deterministic
    /// processes.
    pub fn check_reproducibility(&self, process: &Process) -> Vec<Divergence> {
        if !process.deterministic {
            return Vec::new();
        }
        let mut groups: BTreeMap<String, Vec<(String, JobId)>> = BTreeMap::new();
        for record in self.all() {
            if record.process_id != process.id || record.state != JobState::Succeeded {
                continue;
            }
            if let Some(output) = record.output_hash {
                groups
                    .entry(record.input_hash)
                    .or_default()
                    .push((output, record.job_id));
            }
        }

        let mut divergences = Vec::new();
        for (input_hash, runs) in groups {
            let mut output_hashes: Vec<String> = runs.iter().map(|(o, _)| o.clone()).collect();
            output_hashes.sort();
            output_hashes.dedup();
            if output_hashes.len() > 1 {
                warn!(process = %process.id, input = %short(&input_hash), "non-reproducible outputs");
                divergences.push(Divergence {
                    input_hash,
                    output_hashes,
                    job_ids: runs.into_iter().map(|(_, id)| id).collect(),
                });
            }
        }
        divergences
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}
