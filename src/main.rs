mod cli;
mod ui;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use geoproc::builtin;
use geoproc::catalog::{CatalogReference, Identity, MemoryCatalogStore, OutputSpec};
use geoproc::config::EngineConfig;
use geoproc::state_machine::{InputValue, Job};
use geoproc::workflow::{WorkflowDefinition, WorkflowRun, WorkflowStep};
use geoproc::{Engine, EngineBuilder, SubmitOptions};
use ui::JobProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let identity = Identity::new("cli", &cli.tenant);

    // The demo brings its own in-memory engine.
    if let Command::Demo = cli.command {
        return demo(identity).await;
    }
    let config = EngineConfig::load(cli.config.as_deref())?;
    let engine = build_engine(&config)?;
    dispatch(&engine, cli.command, identity).await
}

/// `GEOPROC_LOG` wins; otherwise `--verbose` selects debug output.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("GEOPROC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "geoproc=debug" } else { "geoproc=warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let engine = EngineBuilder::from_config(config)?
        .registry(Arc::new(builtin::registry()?))
        .tier(Arc::new(builtin::in_process_tier()))
        .build()?;
    Ok(engine)
}

async fn dispatch(engine: &Engine, command: Command, identity: Identity) -> Result<()> {
    match command {
        Command::Processes { id: Some(id) } => {
            let process = engine.describe_process(&id)?;
            ui::print_process(&process);
        }
        Command::Processes { id: None } => {
            ui::print_processes(&engine.processes());
        }
        Command::Run {
            process,
            inputs,
            catalog,
            publish,
            ttl,
            json,
        } => {
            let mut values: BTreeMap<String, InputValue> = inputs
                .into_iter()
                .map(|(name, raw)| (name, InputValue::Literal(parse_literal(&raw))))
                .collect();
            for (name, collection) in catalog {
                values.insert(
                    name,
                    InputValue::Catalog(CatalogReference::collection(&collection)),
                );
            }
            let mut options = SubmitOptions::new(identity);
            if let Some((output, id)) = publish {
                options = options.with_output(OutputSpec {
                    output,
                    id,
                    title: None,
                    ttl_secs: ttl,
                });
            }

            let job = run_job(engine, &process, values, options, json).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            }
        }
        Command::Workflow { file } => {
            let def = WorkflowDefinition::load(&file)
                .with_context(|| format!("loading workflow {}", file.display()))?;
            run_workflow(engine, def, identity).await?;
        }
        Command::Jobs { limit, offset } => {
            ui::print_jobs(&engine.list_jobs(limit, offset));
        }
        Command::Demo => demo(identity).await?,
    }
    Ok(())
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_literal(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_job(
    engine: &Engine,
    process: &str,
    inputs: BTreeMap<String, InputValue>,
    options: SubmitOptions,
    quiet: bool,
) -> Result<Job> {
    let handle = engine.submit(process, inputs, options)?;
    if quiet {
        return Ok(handle.wait().await?);
    }

    let progress = JobProgress::start(process);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let wait = handle.wait();
    tokio::pin!(wait);
    let job = loop {
        tokio::select! {
            job = &mut wait => break job?,
            _ = ticker.tick() => progress.update_job(&handle.status()?),
        }
    };
    progress.complete_job(&job);
    if let Some(record) = engine.provenance(&job.id) {
        ui::print_provenance(&record);
    }
    Ok(job)
}

async fn run_workflow(engine: &Engine, def: WorkflowDefinition, identity: Identity) -> Result<WorkflowRun> {
    let label = def.title.clone().unwrap_or_else(|| "workflow".to_string());
    let id = engine.submit_workflow(def, identity)?;

    let progress = JobProgress::start(&label);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let wait = engine.wait_workflow(&id);
    tokio::pin!(wait);
    let run = loop {
        tokio::select! {
            run = &mut wait => break run?,
            _ = ticker.tick() => progress.update_workflow(&engine.workflow_status(&id)?),
        }
    };
    progress.complete_workflow(&run);
    Ok(run)
}

/// Seeds an in-memory catalog with sample parcels and runs a small
/// workflow over it with the built-in processes.
async fn demo(identity: Identity) -> Result<()> {
    let store = Arc::new(MemoryCatalogStore::new());
    store.insert(&identity.tenant, "parcels", "Sample parcels", sample_parcels());

    let engine = EngineBuilder::default()
        .registry(Arc::new(builtin::registry()?))
        .tier(Arc::new(builtin::in_process_tier()))
        .catalog_store(store)
        .build()?;

    let mut def = WorkflowDefinition::new(vec![
        WorkflowStep::new("residential", builtin::FILTER_FEATURES)
            .catalog("features", CatalogReference::collection("parcels"))
            .literal("property", json!("zone"))
            .literal("equals", json!("residential")),
        WorkflowStep::new("count", builtin::COUNT_FEATURES)
            .from_step("features", "residential", "result"),
        WorkflowStep::new("extent", builtin::COLLECTION_EXTENT)
            .from_step("features", "residential", "result"),
    ]);
    def.title = Some("Residential parcel summary".to_string());

    let run = run_workflow(&engine, def, identity).await?;
    for step in &run.steps {
        if let Some(job_id) = &step.job_id
            && let Ok(outputs) = engine.results(job_id)
        {
            println!("  {}: {}", step.id, serde_json::to_string(&outputs)?);
        }
    }
    Ok(())
}

fn sample_parcels() -> Vec<Value> {
    [
        ("residential", [[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]]),
        ("commercial", [[3.0, 0.0], [5.0, 0.0], [5.0, 1.0], [3.0, 1.0], [3.0, 0.0]]),
        ("residential", [[1.0, 3.0], [4.0, 3.0], [4.0, 6.0], [1.0, 6.0], [1.0, 3.0]]),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (zone, ring))| {
        json!({
            "type": "Feature",
            "id": i + 1,
            "properties": {"zone": zone},
            "geometry": {"type": "Polygon", "coordinates": [ring]}
        })
    })
    .collect()
}
