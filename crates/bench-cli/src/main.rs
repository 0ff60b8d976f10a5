use anyhow::{anyhow, Context, Result};
use bench_analysis::ResultReport;
use bench_core::TaskCatalog;
use bench_runner::{
    CancelFlag, HttpPeerProvider, JsonlRunSink, RunManifestRecord, RunRequest, Scenario,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "convobench",
    version,
    about = "Multi-turn agent evaluation harness"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a scenario against its agents and write the run report
    Run {
        scenario: PathBuf,
        #[arg(long, default_value = ".bench/runs")]
        out_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Recompute the aggregate report from a finished run directory
    Report {
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate a task catalog file against the embedded schema
    Validate { catalog: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            scenario,
            out_dir,
            json,
        } => cmd_run(&scenario, &out_dir, json),
        Commands::Report { run_dir, json } => cmd_report(&run_dir, json),
        Commands::Validate { catalog } => cmd_validate(&catalog),
    }
}

fn load_difficulty_overrides(path: &Path) -> Result<BTreeMap<String, f64>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read difficulty file {}", path.display()))?;
    let map: BTreeMap<String, f64> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid difficulty file {}", path.display()))?;
    for (task_id, score) in &map {
        if !(0.0..=1.0).contains(score) {
            return Err(anyhow!(
                "difficulty for task '{}' must be within [0, 1] (got {})",
                task_id,
                score
            ));
        }
    }
    Ok(map)
}

fn cmd_run(scenario_path: &Path, out_dir: &Path, json: bool) -> Result<()> {
    let (scenario, scenario_digest) = Scenario::load(scenario_path)?;
    let catalog = Arc::new(TaskCatalog::load(
        &scenario.resolve_catalog_path(scenario_path),
    )?);
    {
        let selected = catalog.select(&scenario.config.task_ids)?;
        if scenario.user.is_none() && bench_runner::tasks_need_remote_user(&selected) {
            return Err(anyhow!(
                "selected tasks need a user simulator endpoint but the scenario has none"
            ));
        }
    }

    let mut difficulty = catalog.difficulty_scores();
    if let Some(path) = scenario.resolve_difficulty_path(scenario_path) {
        for (task_id, score) in load_difficulty_overrides(&path)? {
            difficulty.insert(task_id, score);
        }
    }

    let provider = Arc::new(HttpPeerProvider::from_scenario(&scenario)?);
    let cancel = CancelFlag::new();
    let interrupt_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("interrupt received, cancelling in-flight trials");
        interrupt_cancel.set();
    })
    .context("failed to install interrupt handler")?;

    let run = bench_runner::execute_run(
        RunRequest {
            scenario: &scenario,
            scenario_digest: &scenario_digest,
            catalog: catalog.clone(),
            provider,
            difficulty: difficulty.clone(),
            out_dir,
        },
        &cancel,
    )?;

    let report = bench_analysis::build_report(
        catalog.domain(),
        &run.outcomes,
        &scenario.config.pass_k,
        &difficulty,
    );
    write_report(&run.run_dir, &report)?;
    print_summary(&report, &run.run_dir, json)
}

fn cmd_report(run_dir: &Path, json: bool) -> Result<()> {
    let manifest_raw = fs::read_to_string(JsonlRunSink::manifest_path(run_dir))
        .with_context(|| format!("no run manifest under {}", run_dir.display()))?;
    let manifest: RunManifestRecord = serde_json::from_str(&manifest_raw)
        .with_context(|| format!("invalid run manifest under {}", run_dir.display()))?;
    let outcomes = bench_analysis::read_outcomes_jsonl(&JsonlRunSink::outcomes_path(run_dir))?;
    if outcomes.len() != manifest.total_trials {
        eprintln!(
            "warning: {} outcomes recorded for {} requested trials (run may have been killed)",
            outcomes.len(),
            manifest.total_trials
        );
    }
    let report = bench_analysis::build_report(
        &manifest.domain,
        &outcomes,
        &manifest.pass_k,
        &manifest.difficulty,
    );
    write_report(run_dir, &report)?;
    print_summary(&report, run_dir, json)
}

fn cmd_validate(catalog_path: &Path) -> Result<()> {
    let catalog = TaskCatalog::load(catalog_path)?;
    println!(
        "{}: {} tasks in domain '{}' ({})",
        catalog_path.display(),
        catalog.tasks().len(),
        catalog.domain(),
        catalog.digest()
    );
    Ok(())
}

fn write_report(run_dir: &Path, report: &ResultReport) -> Result<()> {
    let value = serde_json::to_value(report).context("failed to serialize report")?;
    bench_schemas::validate_against(bench_schemas::RESULT_REPORT_SCHEMA, &value)?;
    bench_core::atomic_write_json(&run_dir.join("report.json"), &value)
}

fn print_summary(report: &ResultReport, run_dir: &Path, json: bool) -> Result<()> {
    let summary = &report.summary;
    if json {
        let out = json!({
            "run_dir": run_dir.display().to_string(),
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!("run dir: {}", run_dir.display());
    println!(
        "{} tasks x {} trials: {}/{} simulations passed",
        summary.total_tasks,
        summary.num_trials,
        summary.successful_simulations,
        summary.total_simulations
    );
    println!("pass_rate (per-task mean): {:.4}", summary.pass_rate);
    for (k, value) in &summary.pass_hat_k {
        println!("pass^{}: {:.4}", k, value);
    }
    println!("avg_difficulty: {:.4}", summary.avg_difficulty);
    println!("mean_duration_ms: {:.1}", summary.mean_duration_ms);
    Ok(())
}
