use anyhow::{anyhow, Context, Result};
use bench_core::{
    canonical_json_digest, ensure_dir, Outcome, Task, TaskCatalog, TerminalReason, Transcript,
    UserDirective,
};
use bench_scoring::score_trial;
use chrono::Utc;
use reqwest::blocking::Client as HttpClient;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

mod convo;
mod peer;
mod sink;

pub use convo::{drive_conversation, ConversationLimits, ConversationState, FinishedConversation};
pub use peer::{
    exchange_with_retry, resolve_retry_settings_from_env, AgentCard, ExchangeRequest, Peer,
    PeerError, PeerReply, RemotePeer, RetrySettings, ScriptedUser, UserSignal, AGENT_CARD_PATH,
    MESSAGE_PATH, RETRY_BASE_BACKOFF_MS_ENV, RETRY_MAX_ATTEMPTS_ENV,
};
pub use sink::{
    JsonlRunSink, OutcomeRow, RunManifestRecord, RunSink, TurnRow, RUN_MANIFEST_SCHEMA_VERSION,
};

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn default_num_trials() -> usize {
    1
}

fn default_max_turns() -> usize {
    40
}

fn default_concurrency() -> usize {
    4
}

fn default_turn_timeout_ms() -> u64 {
    30_000
}

fn default_pass_k() -> Vec<usize> {
    vec![1]
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerEndpoint {
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub domain: Option<String>,
    pub catalog: PathBuf,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default = "default_num_trials")]
    pub num_trials: usize,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    #[serde(default = "default_pass_k")]
    pub pass_k: Vec<usize>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub difficulty_file: Option<PathBuf>,
}

/// Run scenario document: which peers to talk to and how hard to drive them.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub agent: PeerEndpoint,
    #[serde(default)]
    pub user: Option<PeerEndpoint>,
    pub config: RunConfig,
}

impl Scenario {
    /// Parses a YAML or JSON scenario file. Returns the scenario together
    /// with the sha256 digest of its canonicalized content.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        let value: serde_json::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid scenario document {}", path.display()))?;
        let digest = canonical_json_digest(&value);
        let scenario: Scenario = serde_json::from_value(value)
            .with_context(|| format!("invalid scenario fields in {}", path.display()))?;
        if scenario.config.num_trials == 0 {
            return Err(anyhow!("config.num_trials must be > 0"));
        }
        if scenario.config.max_turns == 0 {
            return Err(anyhow!("config.max_turns must be > 0"));
        }
        Ok((scenario, digest))
    }

    /// Catalog path relative to the scenario file unless absolute.
    pub fn resolve_catalog_path(&self, scenario_path: &Path) -> PathBuf {
        if self.config.catalog.is_absolute() {
            return self.config.catalog.clone();
        }
        scenario_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.config.catalog)
    }

    /// Difficulty override file relative to the scenario file unless absolute.
    pub fn resolve_difficulty_path(&self, scenario_path: &Path) -> Option<PathBuf> {
        let file = self.config.difficulty_file.as_ref()?;
        if file.is_absolute() {
            return Some(file.clone());
        }
        Some(
            scenario_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(file),
        )
    }
}

/// Cooperative cancellation shared between the CLI signal handler, the run
/// deadline, and every in-flight conversation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builds the two conversational peers for one trial. Construction performs
/// discovery; failures here mark the trial `discovery_failure`.
pub trait PeerProvider: Send + Sync {
    fn agent_client(&self, task: &Task) -> Result<Box<dyn Peer>, PeerError>;
    fn user_client(&self, task: &Task) -> Result<Box<dyn Peer>, PeerError>;
}

/// Default provider: remote candidate agent, plus either a remote user
/// simulator or the in-process scripted one. The HTTP client (and its
/// connection pool) is shared across trials; each trial gets its own
/// discovered peer.
pub struct HttpPeerProvider {
    client: HttpClient,
    agent_base: String,
    user_base: Option<String>,
    turn_timeout: Duration,
}

impl HttpPeerProvider {
    pub fn from_scenario(scenario: &Scenario) -> Result<Self> {
        let client = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            agent_base: scenario.agent.endpoint.clone(),
            user_base: scenario.user.as_ref().map(|u| u.endpoint.clone()),
            turn_timeout: Duration::from_millis(scenario.config.turn_timeout_ms),
        })
    }
}

impl PeerProvider for HttpPeerProvider {
    fn agent_client(&self, _task: &Task) -> Result<Box<dyn Peer>, PeerError> {
        let peer = RemotePeer::connect(self.client.clone(), &self.agent_base, self.turn_timeout)?;
        debug!(agent = %peer.card().name, "agent discovery complete");
        Ok(Box::new(peer))
    }

    fn user_client(&self, task: &Task) -> Result<Box<dyn Peer>, PeerError> {
        if let Some(base) = &self.user_base {
            let peer = RemotePeer::connect(self.client.clone(), base, self.turn_timeout)?;
            debug!(simulator = %peer.card().name, "user simulator discovery complete");
            return Ok(Box::new(peer));
        }
        match ScriptedUser::for_task(task) {
            Some(user) => Ok(Box::new(user)),
            None => Err(PeerError::Protocol(format!(
                "task {} needs a remote user simulator but the scenario has no user endpoint",
                task.id
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct TrialDispatch {
    task_id: String,
    trial_index: usize,
    seed: u64,
}

struct TrialCompletion {
    task_id: String,
    trial_index: usize,
    outcome: Outcome,
    transcript: Option<Transcript>,
}

fn infra_completion(dispatch: &TrialDispatch, message: &str) -> TrialCompletion {
    error!(
        task = %dispatch.task_id,
        trial_index = dispatch.trial_index,
        "{}",
        message
    );
    TrialCompletion {
        task_id: dispatch.task_id.clone(),
        trial_index: dispatch.trial_index,
        outcome: Outcome::unscored(
            &dispatch.task_id,
            dispatch.trial_index,
            TerminalReason::InfraError,
        ),
        transcript: None,
    }
}

type TrialExecutor = dyn Fn(&TrialDispatch) -> TrialCompletion + Send + Sync;

/// Thread-per-trial pool with an in-flight ceiling; completions come back
/// over a channel in whatever order trials finish.
struct TrialWorkerPool {
    max_in_flight: usize,
    in_flight: usize,
    executor: Arc<TrialExecutor>,
    completions_tx: mpsc::Sender<TrialCompletion>,
    completions_rx: mpsc::Receiver<TrialCompletion>,
}

impl TrialWorkerPool {
    fn new(max_in_flight: usize, executor: Arc<TrialExecutor>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            max_in_flight: max_in_flight.max(1),
            in_flight: 0,
            executor,
            completions_tx: tx,
            completions_rx: rx,
        }
    }

    fn has_capacity(&self) -> bool {
        self.in_flight < self.max_in_flight
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn submit(&mut self, dispatch: TrialDispatch) {
        self.in_flight += 1;
        let executor = self.executor.clone();
        let tx = self.completions_tx.clone();
        let worker_dispatch = dispatch.clone();
        let spawned = thread::Builder::new()
            .name(format!(
                "trial-{}-{}",
                worker_dispatch.task_id, worker_dispatch.trial_index
            ))
            .spawn(move || {
                let completion =
                    std::panic::catch_unwind(AssertUnwindSafe(|| executor(&worker_dispatch)))
                        .unwrap_or_else(|_| {
                            infra_completion(&worker_dispatch, "trial worker panicked")
                        });
                let _ = tx.send(completion);
            });
        if spawned.is_err() {
            let _ = self
                .completions_tx
                .send(infra_completion(&dispatch, "failed to spawn trial worker"));
        }
    }

    fn recv(&mut self, timeout: Duration) -> Option<TrialCompletion> {
        match self.completions_rx.recv_timeout(timeout) {
            Ok(completion) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Some(completion)
            }
            Err(_) => None,
        }
    }
}

fn execute_trial(
    catalog: &TaskCatalog,
    provider: &dyn PeerProvider,
    limits: &ConversationLimits,
    cancel: &CancelFlag,
    dispatch: &TrialDispatch,
) -> TrialCompletion {
    let Some(task) = catalog.task(&dispatch.task_id) else {
        return infra_completion(dispatch, "dispatch references a task missing from the catalog");
    };
    let started = Instant::now();

    let discovery_failed = |err: PeerError, side: &str| {
        warn!(
            task = %task.id,
            trial_index = dispatch.trial_index,
            error = %err,
            "{} discovery failed",
            side
        );
        let mut outcome = Outcome::unscored(
            &task.id,
            dispatch.trial_index,
            TerminalReason::DiscoveryFailure,
        );
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        TrialCompletion {
            task_id: task.id.clone(),
            trial_index: dispatch.trial_index,
            outcome,
            transcript: None,
        }
    };

    let agent = match provider.agent_client(task) {
        Ok(peer) => peer,
        Err(err) => return discovery_failed(err, "agent"),
    };
    let user = match provider.user_client(task) {
        Ok(peer) => peer,
        Err(err) => return discovery_failed(err, "user simulator"),
    };

    let finished = drive_conversation(
        task,
        dispatch.seed,
        user.as_ref(),
        agent.as_ref(),
        limits,
        cancel,
    );
    let outcome = score_trial(
        catalog,
        task,
        dispatch.trial_index,
        &finished.transcript,
        finished.terminal_reason,
        started.elapsed(),
    );
    TrialCompletion {
        task_id: task.id.clone(),
        trial_index: dispatch.trial_index,
        outcome,
        transcript: Some(finished.transcript),
    }
}

/// One completed trial: its outcome plus the transcript when a conversation
/// actually ran.
#[derive(Debug)]
pub struct TrialResult {
    pub outcome: Outcome,
    pub transcript: Option<Transcript>,
}

/// Materializes the task × repetition schedule and executes it under the
/// configured concurrency limit. Returns exactly one result per requested
/// trial, ordered by `(task_id, trial_index)` regardless of completion
/// order.
pub fn run_trials(
    catalog: &Arc<TaskCatalog>,
    config: &RunConfig,
    provider: Arc<dyn PeerProvider>,
    cancel: &CancelFlag,
) -> Result<Vec<TrialResult>> {
    if config.num_trials == 0 {
        return Err(anyhow!("config.num_trials must be > 0"));
    }
    if let Some(domain) = &config.domain {
        if domain != catalog.domain() {
            return Err(anyhow!(
                "scenario domain '{}' does not match catalog domain '{}'",
                domain,
                catalog.domain()
            ));
        }
    }

    let selected = catalog.select(&config.task_ids)?;
    let retry = resolve_retry_settings_from_env()?;
    let limits = ConversationLimits {
        max_turns: config.max_turns,
        retry,
    };

    let mut pending: VecDeque<TrialDispatch> = VecDeque::new();
    for task in &selected {
        for trial_index in 0..config.num_trials {
            pending.push_back(TrialDispatch {
                task_id: task.id.clone(),
                trial_index,
                seed: config.seed.wrapping_add(trial_index as u64),
            });
        }
    }
    let total = pending.len();
    let deadline = config
        .run_timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let executor_catalog = catalog.clone();
    let executor_cancel = cancel.clone();
    let executor: Arc<TrialExecutor> = Arc::new(move |dispatch: &TrialDispatch| {
        execute_trial(
            &executor_catalog,
            provider.as_ref(),
            &limits,
            &executor_cancel,
            dispatch,
        )
    });

    let mut pool = TrialWorkerPool::new(config.concurrency, executor);
    let mut results: BTreeMap<(String, usize), TrialResult> = BTreeMap::new();
    info!(
        total,
        concurrency = config.concurrency,
        tasks = selected.len(),
        repetitions = config.num_trials,
        "starting trials"
    );

    while results.len() < total {
        if let Some(deadline) = deadline {
            if !cancel.is_set() && Instant::now() >= deadline {
                warn!("run timeout reached, cancelling in-flight trials");
                cancel.set();
            }
        }
        if cancel.is_set() {
            while let Some(dispatch) = pending.pop_front() {
                results.insert(
                    (dispatch.task_id.clone(), dispatch.trial_index),
                    TrialResult {
                        outcome: Outcome::unscored(
                            &dispatch.task_id,
                            dispatch.trial_index,
                            TerminalReason::RunCancelled,
                        ),
                        transcript: None,
                    },
                );
            }
        }
        loop {
            if !pool.has_capacity() {
                break;
            }
            let Some(dispatch) = pending.pop_front() else {
                break;
            };
            pool.submit(dispatch);
        }
        if pool.in_flight() == 0 {
            if pending.is_empty() && results.len() >= total {
                break;
            }
            continue;
        }
        if let Some(completion) = pool.recv(COMPLETION_POLL_INTERVAL) {
            debug!(
                task = %completion.task_id,
                trial_index = completion.trial_index,
                reason = completion.outcome.terminal_reason.as_str(),
                passed = completion.outcome.passed,
                "trial finished"
            );
            results.insert(
                (completion.task_id.clone(), completion.trial_index),
                TrialResult {
                    outcome: completion.outcome,
                    transcript: completion.transcript,
                },
            );
        }
    }

    if results.len() != total {
        return Err(anyhow!(
            "run produced {} results for {} requested trials",
            results.len(),
            total
        ));
    }
    Ok(results.into_values().collect())
}

/// Everything execute_run needs beyond the cancel flag.
pub struct RunRequest<'a> {
    pub scenario: &'a Scenario,
    pub scenario_digest: &'a str,
    pub catalog: Arc<TaskCatalog>,
    pub provider: Arc<dyn PeerProvider>,
    pub difficulty: BTreeMap<String, f64>,
    pub out_dir: &'a Path,
}

#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub outcomes: Vec<Outcome>,
}

/// Executes a full run and persists the manifest plus the outcome and turn
/// facts. The aggregate report is derived downstream from the outcome set.
pub fn execute_run(request: RunRequest<'_>, cancel: &CancelFlag) -> Result<RunResult> {
    let run_id = format!("run_{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"));
    let run_dir = request.out_dir.join(&run_id);
    ensure_dir(&run_dir)?;

    let selected = request.catalog.select(&request.scenario.config.task_ids)?;
    let total_trials = selected.len() * request.scenario.config.num_trials;

    let mut sink = JsonlRunSink::new(&run_dir)?;
    sink.write_run_manifest(&RunManifestRecord {
        schema_version: RUN_MANIFEST_SCHEMA_VERSION.to_string(),
        run_id: run_id.clone(),
        created_at: Utc::now().to_rfc3339(),
        domain: request.catalog.domain().to_string(),
        agent_endpoint: request.scenario.agent.endpoint.clone(),
        user_endpoint: request.scenario.user.as_ref().map(|u| u.endpoint.clone()),
        scenario_digest: request.scenario_digest.to_string(),
        catalog_digest: request.catalog.digest().to_string(),
        total_trials,
        pass_k: request.scenario.config.pass_k.clone(),
        difficulty: request.difficulty.clone(),
    })?;

    let results = run_trials(
        &request.catalog,
        &request.scenario.config,
        request.provider.clone(),
        cancel,
    )?;

    for result in &results {
        sink.append_outcome(&OutcomeRow {
            run_id: run_id.clone(),
            outcome: result.outcome.clone(),
        })?;
        if let Some(transcript) = &result.transcript {
            let rows: Vec<TurnRow> = transcript
                .turns()
                .iter()
                .enumerate()
                .map(|(seq, turn)| TurnRow {
                    run_id: run_id.clone(),
                    task_id: result.outcome.task_id.clone(),
                    trial_index: result.outcome.trial_index,
                    seq,
                    speaker: turn.speaker.as_str().to_string(),
                    content: turn.content.clone(),
                    tool_calls: turn.tool_calls.clone(),
                    ts: turn.ts.to_rfc3339(),
                })
                .collect();
            sink.append_turn_rows(&rows)?;
        }
    }
    sink.flush()?;

    let passed = results.iter().filter(|r| r.outcome.passed).count();
    info!(
        run_id = %run_id,
        outcomes = results.len(),
        passed,
        "run complete"
    );
    Ok(RunResult {
        run_id,
        run_dir,
        outcomes: results.into_iter().map(|r| r.outcome).collect(),
    })
}

/// True when any selected task cannot be simulated without a remote user
/// endpoint; lets callers fail fast before starting trials.
pub fn tasks_need_remote_user(tasks: &[&Task]) -> bool {
    tasks
        .iter()
        .any(|t| matches!(t.user, UserDirective::Remote { .. }))
}
