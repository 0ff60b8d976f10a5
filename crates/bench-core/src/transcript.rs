use crate::{canonical_json, hashchain};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub ts: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            content: content.into(),
            tool_calls: Vec::new(),
            ts: Utc::now(),
        }
    }

    pub fn agent(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            speaker: Speaker::Agent,
            content: content.into(),
            tool_calls,
            ts: Utc::now(),
        }
    }
}

/// Ordered turn history of one trial. Turns can only be appended; nothing is
/// ever reordered or removed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Hash-chain head over the canonical JSON of every turn in order.
    pub fn digest(&self) -> String {
        let mut head: Option<String> = None;
        for turn in &self.turns {
            let value = serde_json::to_value(turn).unwrap_or(Value::Null);
            let line = canonical_json(&value);
            head = Some(hashchain(head.as_deref(), &line));
        }
        head.unwrap_or_else(|| hashchain(None, ""))
    }
}
