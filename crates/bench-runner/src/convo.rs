use crate::peer::{exchange_with_retry, ExchangeRequest, Peer, PeerError, RetrySettings};
use crate::CancelFlag;
use bench_core::{Speaker, Task, TerminalReason, Transcript, Turn};
use tracing::debug;

/// Turn-taking states of one trial's conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    AwaitUserTurn,
    AwaitAgentTurn,
    Terminated(TerminalReason),
}

#[derive(Debug, Clone, Copy)]
pub struct ConversationLimits {
    /// Maximum live turns appended after the seed context.
    pub max_turns: usize,
    pub retry: RetrySettings,
}

#[derive(Debug)]
pub struct FinishedConversation {
    pub transcript: Transcript,
    pub terminal_reason: TerminalReason,
}

fn terminal_reason_for(err: &PeerError) -> TerminalReason {
    match err {
        PeerError::Timeout(_) => TerminalReason::Timeout,
        PeerError::Unreachable(_) | PeerError::Protocol(_) => TerminalReason::PeerError,
    }
}

/// Drives one trial from its seed context to a terminal transcript. Always
/// returns a finished conversation; peer failures become terminal reasons,
/// never panics or dropped trials.
pub fn drive_conversation(
    task: &Task,
    seed: u64,
    user: &dyn Peer,
    agent: &dyn Peer,
    limits: &ConversationLimits,
    cancel: &CancelFlag,
) -> FinishedConversation {
    let mut transcript = Transcript::new();
    for seed_turn in &task.initial_context {
        transcript.append(match seed_turn.speaker {
            Speaker::User => Turn::user(seed_turn.content.clone()),
            Speaker::Agent => Turn::agent(seed_turn.content.clone(), Vec::new()),
        });
    }
    let seeded = transcript.len();
    let user_context = task.user.context();

    let mut state = ConversationState::AwaitUserTurn;
    loop {
        if let ConversationState::Terminated(reason) = state {
            debug!(
                task = %task.id,
                reason = reason.as_str(),
                turns = transcript.len(),
                "conversation finished"
            );
            return FinishedConversation {
                transcript,
                terminal_reason: reason,
            };
        }
        if cancel.is_set() {
            state = ConversationState::Terminated(TerminalReason::RunCancelled);
            continue;
        }
        if transcript.len() - seeded >= limits.max_turns {
            state = ConversationState::Terminated(TerminalReason::MaxTurnsExceeded);
            continue;
        }
        state = match state {
            ConversationState::AwaitUserTurn => {
                let request = ExchangeRequest {
                    seed,
                    context: Some(&user_context),
                    history: transcript.turns(),
                };
                match exchange_with_retry(user, &request, limits.retry) {
                    Ok(reply) => {
                        let concluded = reply.signal.is_some();
                        let mut turn = Turn::user(reply.content);
                        turn.tool_calls = reply.tool_calls;
                        transcript.append(turn);
                        if concluded {
                            ConversationState::Terminated(TerminalReason::UserConcluded)
                        } else {
                            ConversationState::AwaitAgentTurn
                        }
                    }
                    Err(err) => ConversationState::Terminated(terminal_reason_for(&err)),
                }
            }
            ConversationState::AwaitAgentTurn => {
                let request = ExchangeRequest {
                    seed,
                    context: None,
                    history: transcript.turns(),
                };
                match exchange_with_retry(agent, &request, limits.retry) {
                    Ok(reply) => {
                        transcript.append(Turn::agent(reply.content, reply.tool_calls));
                        ConversationState::AwaitUserTurn
                    }
                    Err(err) => ConversationState::Terminated(terminal_reason_for(&err)),
                }
            }
            ConversationState::Terminated(_) => unreachable!("terminal state returns above"),
        };
    }
}
