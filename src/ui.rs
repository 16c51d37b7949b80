//! Terminal output: a spinner while jobs run and coloured summaries.
//!
//! Uses `indicatif` for the spinner and `console` for styling.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use geoproc::process::Process;
use geoproc::provenance::ProvenanceRecord;
use geoproc::state_machine::{Job, JobState, TierOutcome};
use geoproc::workflow::{StepState, WorkflowRun, WorkflowState};

/// Spinner shown while a job or workflow runs.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("QUEUED: {label}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn update_job(&self, job: &Job) {
        self.pb
            .set_message(format!("{}: {} ({}%)", job.state, job.process_id, job.progress));
    }

    pub fn update_workflow(&self, run: &WorkflowRun) {
        let done = run.steps.iter().filter(|s| s.state.is_terminal()).count();
        self.pb
            .set_message(format!("{}: {done}/{} steps", run.state, run.steps.len()));
    }

    /// Stops the spinner and prints the job outcome with its tier walk.
    pub fn complete_job(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.state {
            JobState::Succeeded => println!(
                "  {} {} succeeded in {}ms",
                self.green.apply_to("✓"),
                job.process_id,
                job.duration_ms().unwrap_or_default()
            ),
            JobState::Cancelled => println!(
                "  {} {} cancelled",
                self.yellow.apply_to("⊘"),
                job.process_id
            ),
            _ => {
                let reason = job
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| job.state.to_string());
                println!("  {} {} failed: {reason}", self.red.apply_to("✗"), job.process_id);
            }
        }
        for attempt in &job.attempted_tiers {
            let style = match attempt.outcome {
                TierOutcome::Succeeded => &self.green,
                TierOutcome::Failed(_) => &self.red,
                _ => &self.yellow,
            };
            println!("      {} {}", style.apply_to("·"), attempt);
        }
        if let Some(outputs) = &job.outputs {
            println!("{}", serde_json::to_string_pretty(outputs).unwrap_or_default());
        }
        for (output, collection) in &job.catalog_outputs {
            println!("  {} {output} published as {collection}", self.dim.apply_to("→"));
        }
    }

    pub fn complete_workflow(&self, run: &WorkflowRun) {
        self.pb.finish_and_clear();
        let (mark, style) = match run.state {
            WorkflowState::Succeeded => ("✓", &self.green),
            WorkflowState::PartiallySucceeded | WorkflowState::Cancelled => ("⊘", &self.yellow),
            _ => ("✗", &self.red),
        };
        let title = run.title.as_deref().unwrap_or(&run.id);
        println!("  {} {title}: {}", style.apply_to(mark), run.state);
        for step in &run.steps {
            let style = match step.state {
                StepState::Succeeded => &self.green,
                StepState::Failed => &self.red,
                _ => &self.yellow,
            };
            let mut line = format!("      {} {} ({})", style.apply_to(step.state), step.id, step.process);
            if let Some(error) = &step.error {
                line.push_str(&format!(": {error}"));
            }
            println!("{line}");
        }
    }
}

pub fn print_processes(processes: &[std::sync::Arc<Process>]) {
    let bold = Style::new().bold();
    for p in processes {
        let tiers: Vec<String> = p.tier_preferences.iter().map(ToString::to_string).collect();
        println!(
            "{:<20} {:<36} [{}] {}",
            bold.apply_to(&p.id),
            p.title,
            tiers.join(" → "),
            p.resource_class
        );
    }
}

pub fn print_process(process: &Process) {
    println!("{}", serde_json::to_string_pretty(process).unwrap_or_default());
}

pub fn print_jobs(jobs: &[Job]) {
    let dim = Style::new().dim();
    if jobs.is_empty() {
        println!("{}", dim.apply_to("no jobs"));
        return;
    }
    for job in jobs {
        println!(
            "{}  {:<10} {:<20} {}",
            job.id,
            job.state,
            job.process_id,
            dim.apply_to(job.submitted_at.format("%Y-%m-%d %H:%M:%S"))
        );
    }
}

/// Prints an audit record in JSON, styled by terminal state.
pub fn print_provenance(record: &ProvenanceRecord) {
    let style = match record.state {
        JobState::Succeeded => Style::new().green().bold(),
        JobState::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    };
    println!();
    println!("{}", style.apply_to("─── Provenance ───"));
    println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
}
