use crate::canonical_json_digest;
use crate::task::{Task, WriteSpec};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CatalogDoc {
    domain: String,
    #[serde(default)]
    write_tools: BTreeMap<String, WriteSpec>,
    tasks: Vec<Task>,
}

/// The domain's task definitions. Loaded and validated once, then shared
/// read-only across every trial that references it.
#[derive(Debug)]
pub struct TaskCatalog {
    domain: String,
    write_tools: BTreeMap<String, WriteSpec>,
    tasks: Vec<Task>,
    digest: String,
}

impl TaskCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read task catalog {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in task catalog {}", path.display()))?;
        Self::from_value(value)
            .with_context(|| format!("failed to load task catalog {}", path.display()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        bench_schemas::validate_against(bench_schemas::TASK_CATALOG_SCHEMA, &value)?;
        let digest = canonical_json_digest(&value);
        let doc: CatalogDoc = serde_json::from_value(value)?;

        let mut seen = BTreeSet::new();
        for task in &doc.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(anyhow!("duplicate task id: {}", task.id));
            }
        }

        Ok(Self {
            domain: doc.domain,
            write_tools: doc.write_tools,
            tasks: doc.tasks,
            digest,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn write_tools(&self) -> &BTreeMap<String, WriteSpec> {
        &self.write_tools
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Resolves a task selection; an empty selection means every task.
    /// Unknown ids are a setup error, not a per-trial one.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&Task>> {
        if ids.is_empty() {
            return Ok(self.tasks.iter().collect());
        }
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let task = self
                .task(id)
                .ok_or_else(|| anyhow!("task id not in catalog: {}", id))?;
            selected.push(task);
        }
        Ok(selected)
    }

    /// sha256 of the canonicalized catalog document, recorded in the run
    /// manifest so results are attributable to their exact inputs.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Per-task difficulty scores for the tasks that declare one.
    pub fn difficulty_scores(&self) -> BTreeMap<String, f64> {
        self.tasks
            .iter()
            .filter_map(|t| t.difficulty.map(|d| (t.id.clone(), d)))
            .collect()
    }
}
