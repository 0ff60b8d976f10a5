use bench_core::{
    canonical_json, Outcome, PolicyViolation, Speaker, Task, TaskCatalog, TerminalReason, ToolCall,
    Transcript, WriteSpec,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Final world state implied by the agent's recorded tool calls: entity path
/// to field assignments, seeded from the task's initial state.
pub type WorldState = BTreeMap<String, Map<String, Value>>;

/// Substitutes `{arg}` placeholders in a write target template with the
/// call's argument values. A call missing a template argument resolves to
/// nothing and has no world effect.
fn render_target(template: &str, arguments: &Value) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let close = rest[open..].find('}')? + open;
        out.push_str(&rest[..open]);
        let key = &rest[open + 1..close];
        let value = arguments.get(key)?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    Some(out)
}

fn apply_write(state: &mut WorldState, spec: &WriteSpec, call: &ToolCall) {
    let Some(target) = render_target(&spec.target, &call.arguments) else {
        return;
    };
    let entity = state.entry(target).or_default();
    for field in &spec.fields {
        if let Some(value) = call.arguments.get(field) {
            entity.insert(field.clone(), value.clone());
        }
    }
}

/// Replays every agent tool call that matches a declared write tool against
/// the task's initial state.
pub fn final_world_state(catalog: &TaskCatalog, task: &Task, transcript: &Transcript) -> WorldState {
    let mut state: WorldState = BTreeMap::new();
    for (entity, fields) in &task.initial_state {
        if let Value::Object(map) = fields {
            state.insert(entity.clone(), map.clone());
        }
    }
    for turn in transcript.turns() {
        if turn.speaker != Speaker::Agent {
            continue;
        }
        for call in &turn.tool_calls {
            if let Some(spec) = catalog.write_tools().get(&call.name) {
                apply_write(&mut state, spec, call);
            }
        }
    }
    state
}

/// Exact field-level comparison of the goal state against the final world
/// state. Every goal entity and field must be present and canonically equal;
/// entities the goal does not mention are ignored.
pub fn goal_achieved(task: &Task, state: &WorldState) -> bool {
    for (entity, expected) in &task.goal_state {
        let Value::Object(expected_fields) = expected else {
            return false;
        };
        let Some(actual) = state.get(entity) else {
            return false;
        };
        for (field, want) in expected_fields {
            match actual.get(field) {
                Some(got) if canonical_json(got) == canonical_json(want) => {}
                _ => return false,
            }
        }
    }
    true
}

/// Checks every policy rule against the full transcript in one linear scan.
/// A rule is violated when its trigger tool is called without a prior call
/// to its required tool. Violations are collected, never short-circuited.
pub fn check_policies(task: &Task, transcript: &Transcript) -> Vec<PolicyViolation> {
    let mut called: BTreeSet<&str> = BTreeSet::new();
    let mut violations = Vec::new();
    for (turn_index, turn) in transcript.turns().iter().enumerate() {
        for call in &turn.tool_calls {
            for rule in &task.policy_rules {
                if rule.trigger_tool == call.name && !called.contains(rule.requires_tool.as_str())
                {
                    violations.push(PolicyViolation {
                        rule_id: rule.id.clone(),
                        turn_index,
                        message: format!(
                            "{} called without prior {}",
                            rule.trigger_tool, rule.requires_tool
                        ),
                    });
                }
            }
            called.insert(call.name.as_str());
        }
    }
    violations
}

/// Maps a terminal transcript to its Outcome. Both checks always run so the
/// outcome carries full diagnostics, but a trial only passes when the
/// conversation concluded normally, the goal state matched, and no policy
/// rule was violated.
pub fn score_trial(
    catalog: &TaskCatalog,
    task: &Task,
    trial_index: usize,
    transcript: &Transcript,
    terminal_reason: TerminalReason,
    duration: Duration,
) -> Outcome {
    let state = final_world_state(catalog, task, transcript);
    let goal = goal_achieved(task, &state);
    let violations = check_policies(task, transcript);
    let passed =
        terminal_reason == TerminalReason::UserConcluded && goal && violations.is_empty();
    Outcome {
        task_id: task.id.clone(),
        trial_index,
        passed,
        goal_achieved: goal,
        policy_violations: violations,
        terminal_reason,
        turns: transcript.len(),
        duration_ms: duration.as_millis() as u64,
        transcript_digest: Some(transcript.digest()),
    }
}
