use crate::Speaker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One seed turn placed in the transcript before the first live exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedTurn {
    pub speaker: Speaker,
    pub content: String,
}

/// How the user side of the conversation is produced: a deterministic
/// in-process script, or instructions forwarded to a remote simulator peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserDirective {
    Scripted { script: Vec<String> },
    Remote { instructions: String },
}

impl UserDirective {
    /// Text handed to a remote simulator as its scenario context. Scripted
    /// tasks expose the script itself so an LLM-backed simulator can follow
    /// the same storyline when one is configured.
    pub fn context(&self) -> String {
        match self {
            Self::Scripted { script } => script.join("\n"),
            Self::Remote { instructions } => instructions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trigger_tool: String,
    pub requires_tool: String,
}

/// Declares the world effect of one tool. `target` is an entity-path template
/// over the call arguments (e.g. `"orders/{order_id}"`); `fields` names the
/// argument keys written onto that entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSpec {
    pub target: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<f64>,
    #[serde(default)]
    pub initial_state: BTreeMap<String, Value>,
    #[serde(default)]
    pub initial_context: Vec<SeedTurn>,
    pub user: UserDirective,
    #[serde(default)]
    pub goal_state: BTreeMap<String, Value>,
    #[serde(default)]
    pub policy_rules: Vec<PolicyRule>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_directive_parses_scripted_form() {
        let task: Task = serde_json::from_value(json!({
            "id": "t1",
            "user": {"script": ["hi", "my order is o1"]}
        }))
        .expect("scripted task should parse");
        match task.user {
            UserDirective::Scripted { ref script } => assert_eq!(script.len(), 2),
            UserDirective::Remote { .. } => panic!("expected scripted directive"),
        }
        assert_eq!(task.user.context(), "hi\nmy order is o1");
    }

    #[test]
    fn user_directive_parses_remote_form() {
        let task: Task = serde_json::from_value(json!({
            "id": "t2",
            "user": {"instructions": "you want a refund for order o1"}
        }))
        .expect("remote task should parse");
        match task.user {
            UserDirective::Remote { ref instructions } => {
                assert!(instructions.contains("refund"))
            }
            UserDirective::Scripted { .. } => panic!("expected remote directive"),
        }
    }

    #[test]
    fn optional_sections_default_empty() {
        let task: Task = serde_json::from_value(json!({
            "id": "t3",
            "user": {"script": ["hello"]}
        }))
        .expect("minimal task should parse");
        assert!(task.initial_state.is_empty());
        assert!(task.initial_context.is_empty());
        assert!(task.goal_state.is_empty());
        assert!(task.policy_rules.is_empty());
        assert!(task.difficulty.is_none());
    }
}
