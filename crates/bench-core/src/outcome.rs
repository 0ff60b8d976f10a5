use serde::{Deserialize, Serialize};

/// Why a trial's conversation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    UserConcluded,
    MaxTurnsExceeded,
    Timeout,
    PeerError,
    DiscoveryFailure,
    RunCancelled,
    InfraError,
}

impl TerminalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserConcluded => "user_concluded",
            Self::MaxTurnsExceeded => "max_turns_exceeded",
            Self::Timeout => "timeout",
            Self::PeerError => "peer_error",
            Self::DiscoveryFailure => "discovery_failure",
            Self::RunCancelled => "run_cancelled",
            Self::InfraError => "infra_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule_id: String,
    pub turn_index: usize,
    pub message: String,
}

/// The scored result of one trial. Emitted exactly once, never revised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub task_id: String,
    pub trial_index: usize,
    pub passed: bool,
    pub goal_achieved: bool,
    #[serde(default)]
    pub policy_violations: Vec<PolicyViolation>,
    pub terminal_reason: TerminalReason,
    pub turns: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_digest: Option<String>,
}

impl Outcome {
    /// Outcome for a trial that never produced a conversation (cancelled
    /// before start, discovery failed, or orchestration plumbing broke).
    pub fn unscored(task_id: &str, trial_index: usize, reason: TerminalReason) -> Self {
        Self {
            task_id: task_id.to_string(),
            trial_index,
            passed: false,
            goal_achieved: false,
            policy_violations: Vec::new(),
            terminal_reason: reason,
            turns: 0,
            duration_ms: 0,
            transcript_digest: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_reason_round_trips_snake_case() {
        for reason in [
            TerminalReason::UserConcluded,
            TerminalReason::MaxTurnsExceeded,
            TerminalReason::Timeout,
            TerminalReason::PeerError,
            TerminalReason::DiscoveryFailure,
            TerminalReason::RunCancelled,
            TerminalReason::InfraError,
        ] {
            let text = serde_json::to_string(&reason).expect("reason should serialize");
            assert_eq!(text, format!("\"{}\"", reason.as_str()));
            let back: TerminalReason =
                serde_json::from_str(&text).expect("reason should deserialize");
            assert_eq!(back, reason);
        }
    }

    #[test]
    fn unscored_outcome_is_failed_and_empty() {
        let outcome = Outcome::unscored("t1", 2, TerminalReason::DiscoveryFailure);
        assert!(!outcome.passed);
        assert!(!outcome.goal_achieved);
        assert_eq!(outcome.turns, 0);
        assert_eq!(outcome.trial_index, 2);
        assert!(outcome.transcript_digest.is_none());
    }
}
