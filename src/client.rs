//! Resilient request client: one logical model/proxy call with
//! exponential-backoff retry on transient failures. Connection pooling via
//! reqwest; a fixed per-attempt timeout; terminal upstream rejections
//! (auth/quota/malformed) are surfaced immediately without retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{Credential, TranslatorConfig};
use crate::error::TranslateError;

/// Server-specified retry hints are honored up to this cap.
const RETRY_AFTER_CAP_SECS: u64 = 120;
/// Computed backoff delays never exceed this.
const MAX_BACKOFF_SECS: u64 = 60;
/// Uniform jitter added to every delay, in milliseconds.
const JITTER_MAX_MS: u64 = 2000;
/// HTTP status the upstream uses for "overloaded"; backs off on a slower
/// ramp because overload conditions clear slowly.
const STATUS_OVERLOADED: u16 = 529;

/// One logical translation request: instruction preamble + user payload.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
}

/// What one network attempt produced, before classification.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub status: u16,
    pub body: String,
    /// Parsed `retry-after` hint in seconds, if the response carried one.
    pub retry_after: Option<u64>,
}

/// Successful model reply.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub tokens_used: u64,
}

/// Transport seam: executes exactly one attempt. Production uses reqwest;
/// tests substitute scripted outcomes.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn execute(&self, request: &ModelRequest) -> Result<AttemptOutcome, TranslateError>;
}

/// Metering collaborator: answers whether calls are authorized at all, and
/// receives usage reports off the critical path.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    fn is_authorized(&self) -> bool;
    async fn report_usage(&self, tokens: u64);
}

/// Meter that authorizes everything and discards usage. Default for direct
/// API mode, where the vendor does its own metering.
pub struct NoopMeter;

#[async_trait]
impl UsageMeter for NoopMeter {
    fn is_authorized(&self) -> bool {
        true
    }

    async fn report_usage(&self, _tokens: u64) {}
}

/// reqwest-backed transport for a chat-completions style endpoint, in direct
/// (bearer key) or proxy (license key) mode.
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    credential: Credential,
}

impl HttpTransport {
    pub fn new(config: &TranslatorConfig) -> Result<Self, TranslateError> {
        let credential = config.require_credential()?.clone();
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TranslateError::TransportError(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            credential,
        })
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    async fn execute(&self, request: &ModelRequest) -> Result<AttemptOutcome, TranslateError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user}
            ],
            "temperature": 0.1
        });

        let mut builder = self
            .http
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .header("Content-Type", "application/json");
        builder = match &self.credential {
            Credential::Direct { api_key } => {
                builder.header("Authorization", format!("Bearer {api_key}"))
            }
            Credential::Proxy { license_key } => builder.header("X-License-Key", license_key),
        };

        let response = builder.json(&body).send().await.map_err(|e| {
            // A timed-out attempt counts as a transport error.
            TranslateError::TransportError(e.to_string())
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        Ok(AttemptOutcome {
            status,
            body,
            retry_after,
        })
    }
}

/// Backoff delay for a retryable outcome, before jitter. A server-specified
/// hint wins (capped); the overloaded class ramps from 10 s; everything else
/// ramps from 2 s. `attempt` is 1-based.
pub fn backoff_delay(status: u16, attempt: u32, retry_after: Option<u64>) -> Duration {
    if let Some(hint) = retry_after {
        return Duration::from_secs(hint.min(RETRY_AFTER_CAP_SECS));
    }
    let secs = if status == STATUS_OVERLOADED {
        (10u64 << attempt.saturating_sub(1).min(10)).min(MAX_BACKOFF_SECS)
    } else {
        (1u64 << attempt.min(10)).min(MAX_BACKOFF_SECS)
    };
    Duration::from_secs(secs)
}

/// Map a non-success HTTP status to its error class. Terminal classes carry
/// a user-actionable meaning; the proxy's insufficient-funds response may
/// include a credit balance in the body.
fn classify_status(status: u16, body: &str) -> TranslateError {
    match status {
        401 => TranslateError::Unauthorized,
        402 => TranslateError::QuotaExceeded {
            balance: parse_balance(body),
        },
        403 => TranslateError::Forbidden,
        429 => TranslateError::RateLimited,
        STATUS_OVERLOADED => TranslateError::Overloaded,
        500..=599 => TranslateError::ServerError { status },
        _ => TranslateError::InvalidRequest(format!(
            "upstream rejected the request (HTTP {status}): {}",
            body.chars().take(200).collect::<String>()
        )),
    }
}

fn parse_balance(body: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("balance")
        .or_else(|| value.get("credits"))
        .and_then(|v| v.as_i64())
}

// --- Chat response envelope ---

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

fn parse_reply(body: &str) -> Result<ModelReply, TranslateError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| TranslateError::ParseError(format!("chat envelope: {e}")))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| TranslateError::ParseError("empty choices".into()))?;
    Ok(ModelReply {
        text,
        tokens_used: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
    })
}

/// Drives the retry loop over a [`ModelTransport`].
pub struct RequestClient {
    transport: Arc<dyn ModelTransport>,
    meter: Arc<dyn UsageMeter>,
    max_attempts: u32,
}

impl RequestClient {
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        meter: Arc<dyn UsageMeter>,
        max_attempts: u32,
    ) -> Self {
        Self {
            transport,
            meter,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Execute one logical call: up to `max_attempts` attempts with backoff
    /// on retryable failures. After exhaustion the last observed error is
    /// returned verbatim so callers can tell a 429 exhaustion from a 502 one.
    pub async fn send(&self, request: &ModelRequest) -> Result<ModelReply, TranslateError> {
        if !self.meter.is_authorized() {
            return Err(TranslateError::NotConfigured);
        }

        let mut attempt: u32 = 1;
        loop {
            let outcome = self.transport.execute(request).await;

            let (error, delay) = match outcome {
                Ok(o) if (200..300).contains(&o.status) => {
                    let reply = parse_reply(&o.body)?;
                    self.report_usage_once(reply.tokens_used);
                    return Ok(reply);
                }
                Ok(o) => {
                    let error = classify_status(o.status, &o.body);
                    let delay = backoff_delay(o.status, attempt, o.retry_after);
                    (error, delay)
                }
                Err(e @ TranslateError::TransportError(_)) => {
                    let delay = backoff_delay(0, attempt, None);
                    (e, delay)
                }
                Err(e) => return Err(e),
            };

            if !error.is_retryable() || attempt >= self.max_attempts {
                return Err(error);
            }

            let delay = delay + jitter();
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient upstream failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Report usage exactly once per successful call, off the result path.
    fn report_usage_once(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let meter = Arc::clone(&self.meter);
        tokio::spawn(async move {
            meter.report_usage(tokens).await;
            debug!(tokens, "usage reported");
        });
    }
}

/// Uniform 0–2 s jitter to avoid thundering-herd retries.
fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn ok_body(text: &str, tokens: u64) -> String {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": text}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": tokens}
        })
        .to_string()
    }

    /// Transport that replays a fixed script of outcomes.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<AttemptOutcome, TranslateError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<AttemptOutcome, TranslateError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        fn status(status: u16) -> Result<AttemptOutcome, TranslateError> {
            Ok(AttemptOutcome {
                status,
                body: String::new(),
                retry_after: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelTransport for ScriptedTransport {
        async fn execute(&self, _request: &ModelRequest) -> Result<AttemptOutcome, TranslateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().remove(0)
        }
    }

    struct CountingMeter {
        authorized: bool,
        reports: AtomicU64,
    }

    #[async_trait]
    impl UsageMeter for CountingMeter {
        fn is_authorized(&self) -> bool {
            self.authorized
        }

        async fn report_usage(&self, tokens: u64) {
            self.reports.fetch_add(tokens, Ordering::SeqCst);
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            system: "translate".into(),
            user: "Hello".into(),
        }
    }

    #[test]
    fn backoff_honors_server_hint_with_cap() {
        assert_eq!(backoff_delay(429, 1, Some(7)), Duration::from_secs(7));
        assert_eq!(backoff_delay(429, 1, Some(600)), Duration::from_secs(120));
    }

    #[test]
    fn overloaded_backoff_ramps_slowly_and_caps() {
        assert_eq!(backoff_delay(529, 1, None), Duration::from_secs(10));
        assert_eq!(backoff_delay(529, 2, None), Duration::from_secs(20));
        assert_eq!(backoff_delay(529, 3, None), Duration::from_secs(40));
        assert_eq!(backoff_delay(529, 4, None), Duration::from_secs(60));
        assert_eq!(backoff_delay(529, 8, None), Duration::from_secs(60));
        // Extreme attempt counts stay capped rather than overflowing the shift.
        assert_eq!(backoff_delay(529, 70, None), Duration::from_secs(60));
    }

    #[test]
    fn default_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(502, 1, None), Duration::from_secs(2));
        assert_eq!(backoff_delay(502, 2, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(502, 5, None), Duration::from_secs(32));
        assert_eq!(backoff_delay(502, 6, None), Duration::from_secs(60));
    }

    #[test]
    fn all_bounded_delays_stay_under_the_cap() {
        for attempt in 1..=5 {
            for status in [429u16, 500, 502, 503, 529] {
                assert!(backoff_delay(status, attempt, None) <= Duration::from_secs(60));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_through_overload_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedTransport::status(529),
            ScriptedTransport::status(529),
            ScriptedTransport::status(529),
            ScriptedTransport::status(529),
            Ok(AttemptOutcome {
                status: 200,
                body: ok_body("Hola", 12),
                retry_after: None,
            }),
        ]));
        let client = RequestClient::new(Arc::clone(&transport) as _, Arc::new(NoopMeter), 5);

        let reply = client.send(&request()).await.unwrap();
        assert_eq!(reply.text, "Hola");
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test]
    async fn terminal_401_fails_on_first_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::status(401)]));
        let client = RequestClient::new(Arc::clone(&transport) as _, Arc::new(NoopMeter), 5);

        let err = client.send(&request()).await.unwrap_err();
        assert_eq!(err, TranslateError::Unauthorized);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn quota_error_carries_balance_from_body() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(AttemptOutcome {
            status: 402,
            body: r#"{"error":"insufficient credits","balance":0}"#.into(),
            retry_after: None,
        })]));
        let client = RequestClient::new(transport as _, Arc::new(NoopMeter), 5);

        let err = client.send(&request()).await.unwrap_err();
        assert_eq!(err, TranslateError::QuotaExceeded { balance: Some(0) });
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_verbatim() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedTransport::status(502),
            ScriptedTransport::status(502),
            ScriptedTransport::status(429),
        ]));
        let client = RequestClient::new(Arc::clone(&transport) as _, Arc::new(NoopMeter), 3);

        let err = client.send(&request()).await.unwrap_err();
        assert_eq!(err, TranslateError::RateLimited);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TranslateError::TransportError("connection reset".into())),
            Ok(AttemptOutcome {
                status: 200,
                body: ok_body("Hallo", 3),
                retry_after: None,
            }),
        ]));
        let client = RequestClient::new(Arc::clone(&transport) as _, Arc::new(NoopMeter), 5);

        assert_eq!(client.send(&request()).await.unwrap().text, "Hallo");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn unauthorized_meter_blocks_before_any_network_call() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let meter = Arc::new(CountingMeter {
            authorized: false,
            reports: AtomicU64::new(0),
        });
        let client = RequestClient::new(Arc::clone(&transport) as _, meter, 5);

        let err = client.send(&request()).await.unwrap_err();
        assert_eq!(err, TranslateError::NotConfigured);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn usage_reported_once_on_success_only() {
        let meter = Arc::new(CountingMeter {
            authorized: true,
            reports: AtomicU64::new(0),
        });
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedTransport::status(503),
            Ok(AttemptOutcome {
                status: 200,
                body: ok_body("done", 42),
                retry_after: None,
            }),
        ]));
        let client = RequestClient::new(transport as _, Arc::clone(&meter) as _, 5);

        client.send(&request()).await.unwrap();
        // Let the fire-and-forget report task run; paused time only advances
        // once every runnable task has been polled to completion.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(meter.reports.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_parse_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(AttemptOutcome {
            status: 200,
            body: "not json".into(),
            retry_after: None,
        })]));
        let client = RequestClient::new(transport as _, Arc::new(NoopMeter), 5);

        assert!(matches!(
            client.send(&request()).await.unwrap_err(),
            TranslateError::ParseError(_)
        ));
    }
}
