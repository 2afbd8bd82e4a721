// Retry logic with exponential backoff and per-attempt timeouts
use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Low-level failure kinds a request attempt can run into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    BrokenPipe,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::ConnectionReset => write!(f, "connection reset"),
            ErrorKind::ConnectionRefused => write!(f, "connection refused"),
            ErrorKind::BrokenPipe => write!(f, "broken pipe"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Why a single attempt did not produce a usable response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The server answered with a status from the retryable set
    Status(u16),
    /// The request never got a response
    Network { kind: ErrorKind, message: String },
}

impl FailureCause {
    pub fn network(kind: ErrorKind, message: impl Into<String>) -> Self {
        FailureCause::Network {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            FailureCause::Status(_) => None,
            FailureCause::Network { kind, .. } => Some(*kind),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Status(status) => write!(f, "HTTP status {}", status),
            FailureCause::Network { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

/// Raised once the retry budget is spent, or on a failure that is not worth retrying
#[derive(Debug, Clone, Error)]
#[error("request failed after {attempts} attempt(s), last error: {last_cause}")]
pub struct TransportError {
    pub attempts: u32,
    pub last_cause: FailureCause,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Budget for a single attempt
    pub timeout_ms: u64,
    pub retry_on_status: Vec<u16>,
    pub retry_on_errors: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            timeout_ms: 5000,
            retry_on_status: vec![408, 429, 500, 502, 503, 504],
            retry_on_errors: vec![
                ErrorKind::Timeout,
                ErrorKind::ConnectionReset,
                ErrorKind::ConnectionRefused,
                ErrorKind::BrokenPipe,
            ],
        }
    }
}

impl RetryConfig {
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retry_on_status.contains(&status.as_u16())
    }

    pub fn should_retry(&self, cause: &FailureCause) -> bool {
        match cause {
            FailureCause::Status(status) => self.retry_on_status.contains(status),
            FailureCause::Network { kind, .. } => self.retry_on_errors.contains(kind),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delays slept between consecutive attempts, in milliseconds.
    ///
    /// The first element is the pause after the first failure. The sequence is
    /// unbounded; callers take as many as they need.
    pub fn backoff_schedule(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::successors(Some(self.initial_delay_ms.min(self.max_delay_ms)), |delay| {
            Some(self.next_delay(*delay))
        })
    }

    fn next_delay(&self, delay_ms: u64) -> u64 {
        let grown = (delay_ms as f64) * self.backoff_multiplier;
        if grown.is_finite() && grown < self.max_delay_ms as f64 {
            grown as u64
        } else {
            self.max_delay_ms
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Execute an operation with retry logic
///
/// The operation receives the 1-based attempt number and reports either a
/// value or the classified cause of its failure. Causes the config does not
/// consider retryable end the loop straight away.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FailureCause>>,
{
    let max_attempts = config.attempts();
    let mut delays = config.backoff_schedule();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "request succeeded after retrying");
                }
                return Ok(result);
            }
            Err(cause) => {
                warn!(attempt, max_attempts, cause = %cause, "request attempt failed");

                if !config.should_retry(&cause) || attempt >= max_attempts {
                    return Err(TransportError {
                        attempts: attempt,
                        last_cause: cause,
                    });
                }

                let delay_ms = delays.next().unwrap_or(config.max_delay_ms);
                debug!(attempt, delay_ms, "backing off before next attempt");
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

/// HTTP client that time-boxes and retries every request it sends.
///
/// Responses with a retryable status are swallowed and retried. Anything else,
/// 401 included, goes back to the caller to interpret.
#[derive(Clone)]
pub struct RetryingHttpClient {
    client: Client,
    config: RetryConfig,
}

impl RetryingHttpClient {
    pub fn new(config: RetryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("refwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: RetryConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    pub async fn execute(&self, builder: RequestBuilder) -> Result<Response, TransportError> {
        self.execute_with(builder, &self.config).await
    }

    /// Same as [`execute`](Self::execute) but with a one-off policy
    pub async fn execute_with(
        &self,
        builder: RequestBuilder,
        policy: &RetryConfig,
    ) -> Result<Response, TransportError> {
        let attempt_timeout = policy.attempt_timeout();

        with_retry(policy, |_| {
            // The request timeout also bounds reading the body later on
            let request = builder
                .try_clone()
                .map(|request| request.timeout(attempt_timeout));
            async move {
                let request = request.ok_or_else(|| {
                    FailureCause::network(ErrorKind::Other, "request body cannot be cloned for retries")
                })?;

                match timeout(attempt_timeout, request.send()).await {
                    Err(_) => Err(FailureCause::network(
                        ErrorKind::Timeout,
                        format!("no response within {}ms", attempt_timeout.as_millis()),
                    )),
                    Ok(Err(err)) => Err(classify_error(&err)),
                    Ok(Ok(response)) => {
                        let status = response.status();
                        if policy.is_retryable_status(status) {
                            Err(FailureCause::Status(status.as_u16()))
                        } else {
                            Ok(response)
                        }
                    }
                }
            }
        })
        .await
    }
}

/// Map a reqwest error onto the kinds the retry policy understands
pub fn classify_error(err: &reqwest::Error) -> FailureCause {
    let message = err.to_string();

    if err.is_timeout() {
        return FailureCause::network(ErrorKind::Timeout, message);
    }

    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            let kind = match io.kind() {
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    Some(ErrorKind::ConnectionReset)
                }
                std::io::ErrorKind::ConnectionRefused => Some(ErrorKind::ConnectionRefused),
                std::io::ErrorKind::BrokenPipe => Some(ErrorKind::BrokenPipe),
                std::io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
                _ => None,
            };
            if let Some(kind) = kind {
                return FailureCause::network(kind, message);
            }
        }
        source = inner.source();
    }

    if err.is_connect() {
        return FailureCause::network(ErrorKind::ConnectionRefused, message);
    }

    FailureCause::network(ErrorKind::Other, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            timeout_ms: 1000,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let config = RetryConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            ..RetryConfig::default()
        };

        let delays: Vec<u64> = config.backoff_schedule().take(6).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn test_default_retryable_statuses() {
        let config = RetryConfig::default();
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(config.is_retryable_status(StatusCode::from_u16(status).unwrap()));
        }
        assert!(!config.is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!config.is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!config.is_retryable_status(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let config = fast_config(3);
        let call_count = AtomicU32::new(0);

        let result = with_retry(&config, |_| async {
            call_count.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FailureCause>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let config = fast_config(3);
        let call_count = AtomicU32::new(0);

        let result = with_retry(&config, |_| async {
            call_count.fetch_add(1, Ordering::SeqCst);
            Err::<i32, _>(FailureCause::Status(503))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_cause, FailureCause::Status(503));
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_cause_fails_fast() {
        let config = fast_config(5);
        let call_count = AtomicU32::new(0);

        let result = with_retry(&config, |_| async {
            call_count.fetch_add(1, Ordering::SeqCst);
            Err::<i32, _>(FailureCause::network(ErrorKind::Other, "invalid header"))
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_retries_server_errors() {
        let server = MockServer::start().await;
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        Mock::given(method("POST"))
            .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
                if hits_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(200).set_body_string("ok")
                }
            })
            .expect(3)
            .mount(&server)
            .await;

        let client = RetryingHttpClient::new(fast_config(3)).unwrap();
        let builder = client.request(Method::POST, &server.uri()).body("{}");
        let response = client.execute(builder).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_returns_unauthorized_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = RetryingHttpClient::new(fast_config(3)).unwrap();
        let builder = client.request(Method::POST, &server.uri());
        let response = client.execute(builder).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_execute_exhausts_on_persistent_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let client = RetryingHttpClient::new(fast_config(2)).unwrap();
        let builder = client.request(Method::GET, &server.uri());
        let err = client.execute(builder).await.unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_cause, FailureCause::Status(502));
    }

    #[tokio::test]
    async fn test_execute_times_out_slow_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config = RetryConfig {
            timeout_ms: 50,
            ..fast_config(2)
        };
        let client = RetryingHttpClient::new(config).unwrap();
        let builder = client.request(Method::GET, &server.uri());
        let err = client.execute(builder).await.unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_cause.kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_execute_classifies_refused_connections() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RetryingHttpClient::new(fast_config(2)).unwrap();
        let builder = client.request(Method::GET, &format!("http://{}", addr));
        let err = client.execute(builder).await.unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_cause.kind(), Some(ErrorKind::ConnectionRefused));
    }
}
