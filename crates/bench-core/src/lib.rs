use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

mod catalog;
mod outcome;
mod task;
mod transcript;

pub use catalog::TaskCatalog;
pub use outcome::{Outcome, PolicyViolation, TerminalReason};
pub use task::{PolicyRule, SeedTurn, Task, UserDirective, WriteSpec};
pub use transcript::{Speaker, ToolCall, Transcript, Turn};

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Renders `value` with object keys sorted, so structurally equal documents
/// produce identical text regardless of insertion order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut parts = Vec::with_capacity(keys.len());
            for k in keys {
                let ks = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{}\"", k));
                let vs = canonical_json(&map[k]);
                parts.push(format!("{}:{}", ks, vs));
            }
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn hashchain(prev: Option<&str>, line: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(p) = prev {
        hasher.update(p.as_bytes());
    }
    hasher.update(line.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes pretty JSON through a temp file and renames it into place, so a
/// crashed process never leaves a half-written document behind.
pub fn atomic_write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_object_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_digest_is_order_insensitive() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
    }

    #[test]
    fn canonical_json_distinguishes_number_forms() {
        assert_ne!(canonical_json(&json!(1)), canonical_json(&json!(1.0)));
    }

    #[test]
    fn hashchain_depends_on_previous_head() {
        let first = hashchain(None, "a");
        let chained = hashchain(Some(&first), "b");
        assert_ne!(chained, hashchain(None, "b"));
        assert!(chained.starts_with("sha256:"));
    }

    #[test]
    fn atomic_write_json_creates_parents() {
        let dir = std::env::temp_dir().join(format!(
            "bench_core_atomic_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock should be past the epoch")
                .as_nanos()
        ));
        let path = dir.join("nested").join("doc.json");
        atomic_write_json(&path, &json!({"ok": true})).expect("write should succeed");
        let raw = fs::read_to_string(&path).expect("file should exist");
        assert!(raw.contains("\"ok\""));
        let _ = fs::remove_dir_all(dir);
    }
}
