use anyhow::{anyhow, Result};
use bench_core::{Speaker, Task, ToolCall, Turn};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::env;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Well-known discovery path on a peer's base URL.
pub const AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";
/// Turn-exchange path on a peer's base URL.
pub const MESSAGE_PATH: &str = "/message";

pub const RETRY_MAX_ATTEMPTS_ENV: &str = "CONVOBENCH_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_BACKOFF_MS_ENV: &str = "CONVOBENCH_RETRY_BASE_BACKOFF_MS";
const RETRY_MAX_ATTEMPTS_DEFAULT: usize = 3;
const RETRY_BASE_BACKOFF_MS_DEFAULT: u64 = 200;
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Peer exchange failures, split by kind so the orchestrator can decide
/// retry versus terminate without string matching.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("peer response timed out after {0} ms")]
    Timeout(u64),
    #[error("peer protocol error: {0}")]
    Protocol(String),
}

/// Conclusion signal a user simulator may attach to its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserSignal {
    Done,
    GiveUp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReply {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<UserSignal>,
}

/// One turn-exchange request: the full transcript so far plus the trial seed
/// and, for user simulators, the task's scenario context.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRequest<'a> {
    pub seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'a str>,
    pub history: &'a [Turn],
}

/// A conversational peer. The transcript is read-only on this side of the
/// contract; the peer answers with its next turn.
pub trait Peer: Send + Sync {
    fn exchange(&self, request: &ExchangeRequest<'_>) -> Result<PeerReply, PeerError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS_DEFAULT,
            base_backoff_ms: RETRY_BASE_BACKOFF_MS_DEFAULT,
        }
    }
}

fn parse_optional_positive_usize_env(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed
                .parse::<usize>()
                .map_err(|_| anyhow!("{} must be a positive integer when set (got: {})", name, raw))?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed
                .parse::<u64>()
                .map_err(|_| anyhow!("{} must be a positive integer when set (got: {})", name, raw))?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

pub fn resolve_retry_settings_from_env() -> Result<RetrySettings> {
    let mut settings = RetrySettings::default();
    if let Some(max_attempts) = parse_optional_positive_usize_env(RETRY_MAX_ATTEMPTS_ENV)? {
        settings.max_attempts = max_attempts;
    }
    if let Some(base_backoff_ms) = parse_optional_positive_u64_env(RETRY_BASE_BACKOFF_MS_ENV)? {
        settings.base_backoff_ms = base_backoff_ms;
    }
    Ok(settings)
}

fn retry_backoff_delay(settings: RetrySettings, attempt: usize) -> Duration {
    let shift = attempt.saturating_sub(1).min(8) as u32;
    let multiplier = 1u64 << shift;
    Duration::from_millis(settings.base_backoff_ms.saturating_mul(multiplier))
}

/// The single retry/timeout composition point for both peer adapters.
/// Timeouts and transient unavailability are retried up to the attempt
/// bound; a protocol error is retried exactly once.
pub fn exchange_with_retry(
    peer: &dyn Peer,
    request: &ExchangeRequest<'_>,
    settings: RetrySettings,
) -> Result<PeerReply, PeerError> {
    let attempts = settings.max_attempts.max(1);
    let mut protocol_errors = 0usize;
    for attempt in 1..=attempts {
        match peer.exchange(request) {
            Ok(reply) => return Ok(reply),
            Err(err) => {
                let retry = match &err {
                    PeerError::Timeout(_) | PeerError::Unreachable(_) => attempt < attempts,
                    PeerError::Protocol(_) => {
                        protocol_errors += 1;
                        protocol_errors < 2 && attempt < attempts
                    }
                };
                if !retry {
                    return Err(err);
                }
                thread::sleep(retry_backoff_delay(settings, attempt));
            }
        }
    }
    unreachable!("attempt loop always returns");
}

fn truncate_error_body(raw: &str) -> String {
    let normalized = raw.replace('\n', " ");
    if normalized.chars().count() <= MAX_ERROR_BODY_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

fn is_transient_http_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

fn peer_error_for_status(status: u16, body: &str) -> PeerError {
    if is_transient_http_status(status) {
        PeerError::Unreachable(format!("peer returned status {}", status))
    } else {
        PeerError::Protocol(format!(
            "unexpected status {}: {}",
            status,
            truncate_error_body(body)
        ))
    }
}

fn classify_transport_error(err: &reqwest::Error, timeout_ms: u64) -> PeerError {
    if err.is_timeout() {
        PeerError::Timeout(timeout_ms)
    } else if err.is_connect() {
        PeerError::Unreachable(err.to_string())
    } else {
        PeerError::Protocol(err.to_string())
    }
}

/// Capability descriptor fetched from a peer's well-known path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// HTTP adapter for a remote peer. Discovery happens once in `connect` and
/// the card is held for the lifetime of the trial that owns this client.
#[derive(Debug)]
pub struct RemotePeer {
    client: HttpClient,
    base_url: String,
    turn_timeout: Duration,
    card: AgentCard,
}

impl RemotePeer {
    pub fn connect(
        client: HttpClient,
        base_url: &str,
        turn_timeout: Duration,
    ) -> Result<Self, PeerError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let timeout_ms = turn_timeout.as_millis() as u64;
        let url = format!("{}{}", base_url, AGENT_CARD_PATH);
        let response = client
            .get(&url)
            .timeout(turn_timeout)
            .send()
            .map_err(|e| classify_transport_error(&e, timeout_ms))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(peer_error_for_status(status.as_u16(), &body));
        }
        let card: AgentCard = response
            .json()
            .map_err(|e| PeerError::Protocol(format!("malformed agent card: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            turn_timeout,
            card,
        })
    }

    pub fn card(&self) -> &AgentCard {
        &self.card
    }
}

impl Peer for RemotePeer {
    fn exchange(&self, request: &ExchangeRequest<'_>) -> Result<PeerReply, PeerError> {
        let timeout_ms = self.turn_timeout.as_millis() as u64;
        let url = format!("{}{}", self.base_url, MESSAGE_PATH);
        let response = self
            .client
            .post(&url)
            .timeout(self.turn_timeout)
            .json(request)
            .send()
            .map_err(|e| classify_transport_error(&e, timeout_ms))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(peer_error_for_status(status.as_u16(), &body));
        }
        response
            .json()
            .map_err(|e| PeerError::Protocol(format!("malformed peer reply: {}", e)))
    }
}

/// Deterministic in-process user simulator replaying a task's script one
/// utterance per user turn, then concluding.
pub struct ScriptedUser {
    script: Vec<String>,
    seed_user_turns: usize,
}

const SCRIPT_CLOSING_LINE: &str = "That's everything I needed, thanks.";

impl ScriptedUser {
    pub fn new(script: Vec<String>, seed_user_turns: usize) -> Self {
        Self {
            script,
            seed_user_turns,
        }
    }

    pub fn for_task(task: &Task) -> Option<Self> {
        match &task.user {
            bench_core::UserDirective::Scripted { script } => {
                let seed_user_turns = task
                    .initial_context
                    .iter()
                    .filter(|t| t.speaker == Speaker::User)
                    .count();
                Some(Self::new(script.clone(), seed_user_turns))
            }
            bench_core::UserDirective::Remote { .. } => None,
        }
    }
}

impl Peer for ScriptedUser {
    fn exchange(&self, request: &ExchangeRequest<'_>) -> Result<PeerReply, PeerError> {
        let spoken = request
            .history
            .iter()
            .filter(|t| t.speaker == Speaker::User)
            .count()
            .saturating_sub(self.seed_user_turns);
        match self.script.get(spoken) {
            Some(line) => Ok(PeerReply {
                content: line.clone(),
                tool_calls: Vec::new(),
                signal: None,
            }),
            None => Ok(PeerReply {
                content: SCRIPT_CLOSING_LINE.to_string(),
                tool_calls: Vec::new(),
                signal: Some(UserSignal::Done),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tiny_http::{Header, Response, Server};

    struct FlakyPeer {
        calls: AtomicUsize,
        failures: usize,
        error: PeerError,
    }

    impl FlakyPeer {
        fn new(failures: usize, error: PeerError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                error,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Peer for FlakyPeer {
        fn exchange(&self, _request: &ExchangeRequest<'_>) -> Result<PeerReply, PeerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            Ok(PeerReply {
                content: "ok".to_string(),
                tool_calls: Vec::new(),
                signal: None,
            })
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            base_backoff_ms: 1,
        }
    }

    fn empty_request() -> ExchangeRequest<'static> {
        ExchangeRequest {
            seed: 0,
            context: None,
            history: &[],
        }
    }

    #[test]
    fn timeouts_are_retried_up_to_the_attempt_bound() {
        let peer = FlakyPeer::new(2, PeerError::Timeout(5));
        let reply = exchange_with_retry(&peer, &empty_request(), fast_retry())
            .expect("third attempt should succeed");
        assert_eq!(reply.content, "ok");
        assert_eq!(peer.calls(), 3);

        let peer = FlakyPeer::new(3, PeerError::Timeout(5));
        let err = exchange_with_retry(&peer, &empty_request(), fast_retry())
            .expect_err("exhausted retries should fail");
        assert!(matches!(err, PeerError::Timeout(_)));
        assert_eq!(peer.calls(), 3);
    }

    #[test]
    fn protocol_errors_are_retried_exactly_once() {
        let peer = FlakyPeer::new(1, PeerError::Protocol("bad payload".to_string()));
        exchange_with_retry(&peer, &empty_request(), fast_retry())
            .expect("one protocol retry should succeed");
        assert_eq!(peer.calls(), 2);

        let peer = FlakyPeer::new(2, PeerError::Protocol("bad payload".to_string()));
        let err = exchange_with_retry(&peer, &empty_request(), fast_retry())
            .expect_err("second protocol error should be terminal");
        assert!(matches!(err, PeerError::Protocol(_)));
        assert_eq!(peer.calls(), 2);
    }

    #[test]
    fn first_success_short_circuits() {
        let peer = FlakyPeer::new(0, PeerError::Timeout(5));
        exchange_with_retry(&peer, &empty_request(), fast_retry()).expect("should succeed");
        assert_eq!(peer.calls(), 1);
    }

    #[test]
    fn backoff_grows_exponentially_with_a_cap() {
        let settings = RetrySettings {
            max_attempts: 16,
            base_backoff_ms: 10,
        };
        assert_eq!(retry_backoff_delay(settings, 1), Duration::from_millis(10));
        assert_eq!(retry_backoff_delay(settings, 2), Duration::from_millis(20));
        assert_eq!(retry_backoff_delay(settings, 4), Duration::from_millis(80));
        assert_eq!(
            retry_backoff_delay(settings, 12),
            Duration::from_millis(10 * 256)
        );
    }

    #[test]
    fn transient_statuses_classify_as_unreachable() {
        for status in [408u16, 425, 429, 500, 502, 503, 504] {
            assert!(matches!(
                peer_error_for_status(status, ""),
                PeerError::Unreachable(_)
            ));
        }
        assert!(matches!(
            peer_error_for_status(404, "not here"),
            PeerError::Protocol(_)
        ));
    }

    #[test]
    fn scripted_user_replays_then_concludes() {
        let user = ScriptedUser::new(vec!["hi".to_string(), "order o1".to_string()], 0);
        let mut history: Vec<Turn> = Vec::new();

        let request = ExchangeRequest {
            seed: 0,
            context: None,
            history: &history,
        };
        let reply = user.exchange(&request).expect("first line");
        assert_eq!(reply.content, "hi");
        assert!(reply.signal.is_none());

        history.push(Turn::user("hi"));
        history.push(Turn::agent("hello", Vec::new()));
        let request = ExchangeRequest {
            seed: 0,
            context: None,
            history: &history,
        };
        let reply = user.exchange(&request).expect("second line");
        assert_eq!(reply.content, "order o1");

        history.push(Turn::user("order o1"));
        history.push(Turn::agent("done", Vec::new()));
        let request = ExchangeRequest {
            seed: 0,
            context: None,
            history: &history,
        };
        let reply = user.exchange(&request).expect("conclusion");
        assert_eq!(reply.signal, Some(UserSignal::Done));
    }

    #[test]
    fn scripted_user_skips_seed_context_turns() {
        let user = ScriptedUser::new(vec!["next line".to_string()], 1);
        let history = vec![Turn::user("seeded opening"), Turn::agent("hi", Vec::new())];
        let request = ExchangeRequest {
            seed: 0,
            context: None,
            history: &history,
        };
        let reply = user.exchange(&request).expect("scripted line");
        assert_eq!(reply.content, "next line");
    }

    fn json_header() -> Header {
        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
            .expect("static header should parse")
    }

    fn spawn_peer_server(card_status: u16) -> (String, std::thread::JoinHandle<()>) {
        let listener =
            std::net::TcpListener::bind(("127.0.0.1", 0)).expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an addr");
        let server = Server::from_listener(listener, None).expect("server should start");
        let base = format!("http://{}", addr);
        let handle = std::thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let url = request.url().to_string();
                if url.ends_with("agent-card.json") {
                    if card_status == 200 {
                        let body = serde_json::json!({
                            "name": "mock-agent",
                            "version": "1.0"
                        });
                        let _ = request.respond(
                            Response::from_string(body.to_string()).with_header(json_header()),
                        );
                    } else {
                        let _ = request.respond(
                            Response::from_string("no card").with_status_code(card_status),
                        );
                    }
                } else if url.ends_with("/message") {
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    let parsed: serde_json::Value =
                        serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
                    let turns = parsed["history"].as_array().map(|a| a.len()).unwrap_or(0);
                    let reply = serde_json::json!({
                        "content": format!("echo after {} turns", turns),
                        "tool_calls": [{"name": "noop", "arguments": {}}]
                    });
                    let _ = request.respond(
                        Response::from_string(reply.to_string()).with_header(json_header()),
                    );
                } else {
                    let _ = request.respond(Response::from_string("?").with_status_code(404));
                }
            }
        });
        (base, handle)
    }

    #[test]
    fn remote_peer_discovers_then_exchanges() {
        let (base, _handle) = spawn_peer_server(200);
        let client = HttpClient::new();
        let peer = RemotePeer::connect(client, &base, Duration::from_secs(5))
            .expect("discovery should succeed");
        assert_eq!(peer.card().name, "mock-agent");

        let history = vec![Turn::user("hi")];
        let request = ExchangeRequest {
            seed: 7,
            context: None,
            history: &history,
        };
        let reply = peer.exchange(&request).expect("exchange should succeed");
        assert_eq!(reply.content, "echo after 1 turns");
        assert_eq!(reply.tool_calls.len(), 1);
    }

    #[test]
    fn missing_agent_card_fails_discovery() {
        let (base, _handle) = spawn_peer_server(404);
        let client = HttpClient::new();
        let err = RemotePeer::connect(client, &base, Duration::from_secs(5))
            .expect_err("discovery should fail");
        assert!(matches!(err, PeerError::Protocol(_)));
    }

    #[test]
    fn unreachable_endpoint_classifies_as_unreachable() {
        let client = HttpClient::new();
        // Reserved port with nothing listening.
        let err = RemotePeer::connect(client, "http://127.0.0.1:1", Duration::from_secs(2))
            .expect_err("connect should fail");
        assert!(matches!(
            err,
            PeerError::Unreachable(_) | PeerError::Timeout(_)
        ));
    }

    #[test]
    fn retry_env_overrides_apply() {
        let attempts_key = RETRY_MAX_ATTEMPTS_ENV;
        let backoff_key = RETRY_BASE_BACKOFF_MS_ENV;
        let attempts_prev = env::var(attempts_key).ok();
        let backoff_prev = env::var(backoff_key).ok();

        env::set_var(attempts_key, "5");
        env::set_var(backoff_key, "75");
        let settings = resolve_retry_settings_from_env().expect("settings should resolve");
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.base_backoff_ms, 75);

        let zero_key = "CONVOBENCH_TEST_RETRY_KNOB";
        env::set_var(zero_key, "0");
        assert!(parse_optional_positive_usize_env(zero_key).is_err());
        env::remove_var(zero_key);

        match attempts_prev {
            Some(value) => env::set_var(attempts_key, value),
            None => env::remove_var(attempts_key),
        }
        match backoff_prev {
            Some(value) => env::set_var(backoff_key, value),
            None => env::remove_var(backoff_key),
        }
    }

    #[test]
    fn flaky_peer_is_shareable_across_threads() {
        let peer = Arc::new(FlakyPeer::new(0, PeerError::Timeout(1)));
        let cloned = peer.clone();
        let handle = std::thread::spawn(move || {
            cloned
                .exchange(&ExchangeRequest {
                    seed: 0,
                    context: None,
                    history: &[],
                })
                .expect("exchange should succeed")
        });
        handle.join().expect("thread should join");
        assert_eq!(peer.calls(), 1);
    }
}
