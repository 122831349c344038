//! HTTP fetch with retry/backoff + ClickHouse raw-table storage for astros ingestion.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub mod clickhouse;

pub use clickhouse::{
    raw_row_json, ClickHouseConfig, ClickHouseStore, MemoryStore, RawPayloadStore, StoreError,
};
pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "astros-storage";

pub const DEFAULT_USER_AGENT: &str = "astros-ingestor/1.0";

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Exponential backoff: attempt `k` (1-based) waits `base_secs^k` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_secs: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_secs: 1.0,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.max_attempts == 0 {
            return Err(FetchError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.base_secs.is_finite() || self.base_secs < 0.0 {
            return Err(FetchError::InvalidPolicy(format!(
                "backoff base must be a finite, non-negative number of seconds (got {})",
                self.base_secs
            )));
        }
        Ok(())
    }

    /// No jitter and no cap; delays too large for `Duration` saturate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(self.base_secs.powi(exponent)).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Applied to each attempt, not to the whole retry loop.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid backoff policy: {0}")]
    InvalidPolicy(String),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited (429) by {url}")]
    RateLimited { url: String },
    #[error("decoding json body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("all {attempts} attempts failed: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

/// One GET against the source, without any retry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let transport_error = |err: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source: Box::new(err),
        };
        let resp = self.client.get(url).send().await.map_err(transport_error)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await.map_err(transport_error)?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// How a single attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(JsonValue),
    RateLimited,
    Failed(FetchError),
}

pub fn classify_response(resp: FetchedResponse) -> AttemptOutcome {
    if resp.status == StatusCode::TOO_MANY_REQUESTS {
        return AttemptOutcome::RateLimited;
    }
    if !resp.status.is_success() {
        return AttemptOutcome::Failed(FetchError::HttpStatus {
            status: resp.status.as_u16(),
            url: resp.final_url,
        });
    }
    match serde_json::from_slice(&resp.body) {
        Ok(value) => AttemptOutcome::Success(value),
        Err(source) => AttemptOutcome::Failed(FetchError::Decode {
            url: resp.final_url,
            source,
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedJson {
    pub value: JsonValue,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct JsonFetcher<T = ReqwestTransport, S = TokioSleeper> {
    transport: T,
    sleeper: S,
    backoff: BackoffPolicy,
}

impl JsonFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        config.backoff.validate()?;
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_parts(transport, TokioSleeper, config.backoff))
    }
}

impl<T: HttpTransport, S: Sleeper> JsonFetcher<T, S> {
    pub fn with_parts(transport: T, sleeper: S, backoff: BackoffPolicy) -> Self {
        Self {
            transport,
            sleeper,
            backoff,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url` and parse the body as JSON, retrying per the backoff policy.
    ///
    /// Transport errors, non-2xx statuses and undecodable bodies are retried
    /// until the final attempt, which returns [`FetchError::Exhausted`]. A 429
    /// always sleeps and moves on to the next attempt; if the budget runs out
    /// on a 429 the result is also `Exhausted`.
    pub async fn fetch_json(&self, url: &str) -> Result<FetchedJson, FetchError> {
        self.backoff.validate()?;
        let span = info_span!("http_fetch", url);
        self.fetch_with_retry(url).instrument(span).await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedJson, FetchError> {
        let max_attempts = self.backoff.max_attempts;

        for attempt in 1..=max_attempts {
            let outcome = match self.transport.get(url).await {
                Ok(resp) => classify_response(resp),
                Err(err) => AttemptOutcome::Failed(err),
            };

            match outcome {
                AttemptOutcome::Success(value) => {
                    info!(attempt, max_attempts, "json fetched");
                    return Ok(FetchedJson { value, attempts: attempt });
                }
                AttemptOutcome::RateLimited => {
                    let wait = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        wait_secs = wait.as_secs_f64(),
                        "rate limited (429), backing off"
                    );
                    self.sleeper.sleep(wait).await;
                }
                AttemptOutcome::Failed(err) => {
                    if attempt == max_attempts {
                        return Err(FetchError::Exhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    let wait = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        wait_secs = wait.as_secs_f64(),
                        error = %err,
                        "fetch attempt failed, retrying"
                    );
                    self.sleeper.sleep(wait).await;
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: max_attempts,
            source: Box::new(FetchError::RateLimited {
                url: url.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Scripted {
        Status(u16, &'static str),
        TransportError,
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            *self.calls.lock().unwrap() += 1;
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("transport called more often than scripted");
            match next {
                Scripted::Status(code, body) => Ok(FetchedResponse {
                    status: StatusCode::from_u16(code).unwrap(),
                    final_url: url.to_string(),
                    body: body.as_bytes().to_vec(),
                }),
                Scripted::TransportError => Err(FetchError::Transport {
                    url: url.to_string(),
                    source: Box::new(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    )),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn slept(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    const URL: &str = "http://source.test/astros.json";

    fn scripted_fetcher(
        transport: ScriptedTransport,
        backoff: BackoffPolicy,
    ) -> JsonFetcher<ScriptedTransport, RecordingSleeper> {
        JsonFetcher::with_parts(transport, RecordingSleeper::default(), backoff)
    }

    fn policy(max_attempts: u32, base_secs: f64) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_secs,
        }
    }

    #[tokio::test]
    async fn three_rate_limits_then_success_sleeps_exponentially() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Status(429, ""),
            Scripted::Status(429, ""),
            Scripted::Status(429, ""),
            Scripted::Status(200, r#"{"number":1}"#),
        ]);
        let fetcher = scripted_fetcher(transport, policy(5, 2.0));

        let fetched = fetcher.fetch_json(URL).await.expect("fetch succeeds");

        assert_eq!(fetched.value, serde_json::json!({"number": 1}));
        assert_eq!(fetched.attempts, 4);
        assert_eq!(fetcher.transport.calls(), 4);
        assert_eq!(
            fetcher.sleeper.slept(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        let total: Duration = fetcher.sleeper.slept().iter().sum();
        assert_eq!(total, Duration::from_secs(2 + 4 + 8));
    }

    #[tokio::test]
    async fn transport_errors_exhaust_after_exactly_max_attempts() {
        let transport = ScriptedTransport::new((0..5).map(|_| Scripted::TransportError).collect());
        let fetcher = scripted_fetcher(transport, policy(5, 1.0));

        let err = fetcher.fetch_json(URL).await.expect_err("fetch fails");

        match err {
            FetchError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*source, FetchError::Transport { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fetcher.transport.calls(), 5);
        // No sleep after the final attempt.
        assert_eq!(fetcher.sleeper.slept(), vec![Duration::from_secs(1); 4]);
    }

    #[tokio::test]
    async fn server_error_is_retried_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Status(503, "unavailable"),
            Scripted::Status(200, r#"{"ok":true}"#),
        ]);
        let fetcher = scripted_fetcher(transport, policy(3, 3.0));

        let fetched = fetcher.fetch_json(URL).await.expect("fetch succeeds");

        assert_eq!(fetched.attempts, 2);
        assert_eq!(fetcher.sleeper.slept(), vec![Duration::from_secs(3)]);
    }

    #[tokio::test]
    async fn client_error_status_is_retried_like_any_failure() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Status(404, "missing"),
            Scripted::Status(404, "missing"),
        ]);
        let fetcher = scripted_fetcher(transport, policy(2, 1.0));

        let err = fetcher.fetch_json(URL).await.expect_err("fetch fails");

        match err {
            FetchError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, FetchError::HttpStatus { status: 404, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fetcher.transport.calls(), 2);
    }

    #[tokio::test]
    async fn undecodable_body_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Status(200, "<html>not json</html>"),
            Scripted::Status(200, "[1,2]"),
        ]);
        let fetcher = scripted_fetcher(transport, policy(5, 1.0));

        let fetched = fetcher.fetch_json(URL).await.expect("fetch succeeds");

        assert_eq!(fetched.value, serde_json::json!([1, 2]));
        assert_eq!(fetched.attempts, 2);
    }

    #[tokio::test]
    async fn rate_limited_on_every_attempt_still_sleeps_then_fails() {
        let transport = ScriptedTransport::new((0..3).map(|_| Scripted::Status(429, "")).collect());
        let fetcher = scripted_fetcher(transport, policy(3, 2.0));

        let err = fetcher.fetch_json(URL).await.expect_err("fetch fails");

        match err {
            FetchError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, FetchError::RateLimited { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fetcher.transport.calls(), 3);
        assert_eq!(
            fetcher.sleeper.slept(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[tokio::test]
    async fn zero_attempt_policy_is_rejected_without_requests() {
        let transport = ScriptedTransport::new(vec![]);
        let fetcher = scripted_fetcher(transport, policy(0, 1.0));

        let err = fetcher.fetch_json(URL).await.expect_err("invalid policy");

        assert!(matches!(err, FetchError::InvalidPolicy(_)));
        assert_eq!(fetcher.transport.calls(), 0);
    }

    #[test]
    fn classify_distinguishes_each_kind() {
        let resp = |code: u16, body: &str| FetchedResponse {
            status: StatusCode::from_u16(code).unwrap(),
            final_url: URL.to_string(),
            body: body.as_bytes().to_vec(),
        };

        assert!(matches!(
            classify_response(resp(200, r#"{"a":1}"#)),
            AttemptOutcome::Success(_)
        ));
        assert!(matches!(
            classify_response(resp(429, "")),
            AttemptOutcome::RateLimited
        ));
        assert!(matches!(
            classify_response(resp(500, "")),
            AttemptOutcome::Failed(FetchError::HttpStatus { status: 500, .. })
        ));
        assert!(matches!(
            classify_response(resp(200, "{")),
            AttemptOutcome::Failed(FetchError::Decode { .. })
        ));
    }

    #[test]
    fn backoff_is_exponential_without_cap() {
        let policy = policy(5, 2.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1024));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::MAX);

        let unit = BackoffPolicy::default();
        assert_eq!(unit.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(unit.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn backoff_policy_validation() {
        assert!(BackoffPolicy::default().validate().is_ok());
        assert!(policy(1, 0.0).validate().is_ok());
        assert!(policy(0, 1.0).validate().is_err());
        assert!(policy(3, -1.0).validate().is_err());
        assert!(policy(3, f64::NAN).validate().is_err());
        assert!(policy(3, f64::INFINITY).validate().is_err());
    }
}
