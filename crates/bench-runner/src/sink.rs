use anyhow::Result;
use bench_core::{Outcome, ToolCall};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const FACTS_DIR: &str = "facts";
const FACTS_OUTCOMES_FILE: &str = "outcomes.jsonl";
const FACTS_TURNS_FILE: &str = "turns.jsonl";
const RUN_MANIFEST_FILE: &str = "run_manifest.json";

pub const RUN_MANIFEST_SCHEMA_VERSION: &str = "run_manifest_v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestRecord {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub domain: String,
    pub agent_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_endpoint: Option<String>,
    pub scenario_digest: String,
    pub catalog_digest: String,
    pub total_trials: usize,
    pub pass_k: Vec<usize>,
    #[serde(default)]
    pub difficulty: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub run_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRow {
    pub run_id: String,
    pub task_id: String,
    pub trial_index: usize,
    pub seq: usize,
    pub speaker: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub ts: String,
}

pub trait RunSink {
    fn write_run_manifest(&mut self, manifest: &RunManifestRecord) -> Result<()>;
    fn append_outcome(&mut self, row: &OutcomeRow) -> Result<()>;
    fn append_turn_rows(&mut self, rows: &[TurnRow]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlRunSink {
    manifest_path: PathBuf,
    outcomes_writer: BufWriter<File>,
    turns_writer: BufWriter<File>,
}

impl JsonlRunSink {
    pub fn new(run_dir: &Path) -> Result<Self> {
        let facts_dir = run_dir.join(FACTS_DIR);
        fs::create_dir_all(&facts_dir)?;

        Ok(Self {
            manifest_path: run_dir.join(RUN_MANIFEST_FILE),
            outcomes_writer: open_append(facts_dir.join(FACTS_OUTCOMES_FILE))?,
            turns_writer: open_append(facts_dir.join(FACTS_TURNS_FILE))?,
        })
    }

    pub fn outcomes_path(run_dir: &Path) -> PathBuf {
        run_dir.join(FACTS_DIR).join(FACTS_OUTCOMES_FILE)
    }

    pub fn manifest_path(run_dir: &Path) -> PathBuf {
        run_dir.join(RUN_MANIFEST_FILE)
    }
}

impl RunSink for JsonlRunSink {
    fn write_run_manifest(&mut self, manifest: &RunManifestRecord) -> Result<()> {
        fs::write(&self.manifest_path, serde_json::to_vec_pretty(manifest)?)?;
        Ok(())
    }

    fn append_outcome(&mut self, row: &OutcomeRow) -> Result<()> {
        append_row(&mut self.outcomes_writer, row)
    }

    fn append_turn_rows(&mut self, rows: &[TurnRow]) -> Result<()> {
        for row in rows {
            append_row(&mut self.turns_writer, row)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.outcomes_writer.flush()?;
        self.turns_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
