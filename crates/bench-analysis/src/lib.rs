use anyhow::{Context, Result};
use bench_core::Outcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Difficulty assumed for tasks without a declared score, matching the
/// scoring convention of the leaderboard enrichment pipeline.
pub const DEFAULT_DIFFICULTY: f64 = 0.5;

/// Unbiased estimator for the probability that at least one of `k` trials
/// sampled without replacement (from `n` observed trials with `c` passes)
/// passed: `1 - C(n-c, k) / C(n, k)`, computed in product form. Returns
/// `None` when `k` is zero or exceeds `n`.
pub fn pass_hat_k(n: usize, c: usize, k: usize) -> Option<f64> {
    if k == 0 || k > n {
        return None;
    }
    let mut miss = 1.0_f64;
    for i in 0..k {
        miss *= (n - c).saturating_sub(i) as f64 / (n - i) as f64;
    }
    Some(1.0 - miss)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAggregate {
    pub task_id: String,
    pub trials: usize,
    pub passed: usize,
    pub pass_rate: f64,
    pub pass_hat_k: BTreeMap<String, f64>,
    pub mean_duration_ms: f64,
    pub terminal_reasons: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub domain: String,
    pub total_tasks: usize,
    pub num_trials: usize,
    pub total_simulations: usize,
    pub successful_simulations: usize,
    pub avg_reward: f64,
    /// Mean of per-task pass rates, NOT the raw per-trial rate: tasks with
    /// more repetitions must not dominate the ranking metric.
    pub pass_rate: f64,
    pub pass_hat_k: BTreeMap<String, f64>,
    pub avg_difficulty: f64,
    pub mean_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub summary: RunSummary,
    pub per_task: Vec<TaskAggregate>,
    pub outcomes: Vec<Outcome>,
}

/// Pure reduction of a completed outcome set into per-task aggregates,
/// ordered by task id. Input order is irrelevant.
pub fn aggregate_tasks(outcomes: &[Outcome], ks: &[usize]) -> Vec<TaskAggregate> {
    let mut by_task: BTreeMap<&str, Vec<&Outcome>> = BTreeMap::new();
    for outcome in outcomes {
        by_task.entry(outcome.task_id.as_str()).or_default().push(outcome);
    }

    let mut aggregates = Vec::with_capacity(by_task.len());
    for (task_id, task_outcomes) in by_task {
        let n = task_outcomes.len();
        let c = task_outcomes.iter().filter(|o| o.passed).count();
        let mut pass_hat = BTreeMap::new();
        for &k in ks {
            if let Some(value) = pass_hat_k(n, c, k) {
                pass_hat.insert(k.to_string(), value);
            }
        }
        let mut terminal_reasons: BTreeMap<String, usize> = BTreeMap::new();
        for outcome in &task_outcomes {
            *terminal_reasons
                .entry(outcome.terminal_reason.as_str().to_string())
                .or_default() += 1;
        }
        let total_duration: u64 = task_outcomes.iter().map(|o| o.duration_ms).sum();
        aggregates.push(TaskAggregate {
            task_id: task_id.to_string(),
            trials: n,
            passed: c,
            pass_rate: c as f64 / n as f64,
            pass_hat_k: pass_hat,
            mean_duration_ms: total_duration as f64 / n as f64,
            terminal_reasons,
        });
    }
    aggregates
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Collapses per-task aggregates and the raw outcome set into the run
/// summary. Overall pass_rate and pass_hat_k average across tasks.
pub fn summarize(
    domain: &str,
    outcomes: &[Outcome],
    per_task: &[TaskAggregate],
    difficulty: &BTreeMap<String, f64>,
) -> RunSummary {
    let total_simulations = outcomes.len();
    let successful_simulations = outcomes.iter().filter(|o| o.passed).count();
    let avg_reward = if total_simulations == 0 {
        0.0
    } else {
        successful_simulations as f64 / total_simulations as f64
    };

    let mut overall_pass_hat: BTreeMap<String, f64> = BTreeMap::new();
    let mut seen_ks: Vec<&String> = per_task
        .iter()
        .flat_map(|t| t.pass_hat_k.keys())
        .collect();
    seen_ks.sort();
    seen_ks.dedup();
    for k in seen_ks {
        let value = mean(per_task.iter().filter_map(|t| t.pass_hat_k.get(k)).copied());
        overall_pass_hat.insert(k.clone(), value);
    }

    let passed_difficulties: Vec<f64> = outcomes
        .iter()
        .filter(|o| o.passed)
        .map(|o| {
            difficulty
                .get(&o.task_id)
                .copied()
                .unwrap_or(DEFAULT_DIFFICULTY)
        })
        .collect();

    RunSummary {
        domain: domain.to_string(),
        total_tasks: per_task.len(),
        num_trials: per_task.iter().map(|t| t.trials).max().unwrap_or(0),
        total_simulations,
        successful_simulations,
        avg_reward,
        pass_rate: mean(per_task.iter().map(|t| t.pass_rate)),
        pass_hat_k: overall_pass_hat,
        avg_difficulty: mean(passed_difficulties.into_iter()),
        mean_duration_ms: mean(outcomes.iter().map(|o| o.duration_ms as f64)),
    }
}

/// Builds the full result report: summary, per-task aggregates, and the raw
/// outcome list ordered by `(task_id, trial_index)`.
pub fn build_report(
    domain: &str,
    outcomes: &[Outcome],
    ks: &[usize],
    difficulty: &BTreeMap<String, f64>,
) -> ResultReport {
    let per_task = aggregate_tasks(outcomes, ks);
    let summary = summarize(domain, outcomes, &per_task, difficulty);
    let mut ordered: Vec<Outcome> = outcomes.to_vec();
    ordered.sort_by(|a, b| {
        (a.task_id.as_str(), a.trial_index).cmp(&(b.task_id.as_str(), b.trial_index))
    });
    ResultReport {
        summary,
        per_task,
        outcomes: ordered,
    }
}

/// Reads an `outcomes.jsonl` facts file back into memory, so the aggregate
/// can be recomputed from a finished run directory alone.
pub fn read_outcomes_jsonl(path: &Path) -> Result<Vec<Outcome>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut outcomes = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let outcome: Outcome = serde_json::from_str(&line)
            .with_context(|| format!("invalid outcome row at line {}", idx + 1))?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
