//! Calling side of the protocol: discovery, negotiation, and invocation.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

use aip_primitives::{
    BUDGET_HEADER, CORRELATION_HEADER, CapabilityCard, CorrelationId, InvocationResult,
    NegotiationRequest, NegotiationResult, PROTOCOL_VERSION, StreamEvent, Usage,
};
use futures::{Stream, StreamExt};
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Uri};
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::http_client::{HyperClient, build_https_client};
use crate::sse::SseDecoder;

/// Lazily produced sequence of events from one streamed call.
pub type EventStream = Pin<Box<dyn Stream<Item = ClientResult<StreamEvent>> + Send>>;

/// Timeout knobs for the protocol client.
#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    connect_timeout: Duration,
    request_timeout: Duration,
    chunk_timeout: Duration,
}

impl ClientConfig {
    /// Overrides the TCP connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the whole-request timeout for synchronous exchanges.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the per-event inactivity timeout for streamed calls.
    #[must_use]
    pub const fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    fn validate(&self) -> ClientResult<()> {
        if self.connect_timeout.is_zero()
            || self.request_timeout.is_zero()
            || self.chunk_timeout.is_zero()
        {
            return Err(ClientError::configuration(
                "timeouts must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounded retry with exponential backoff and deterministic jitter.
///
/// Only transient taxonomy classes are retried; terminal errors and any
/// stream that has already delivered a chunk are surfaced immediately.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    /// Overrides the total attempt count (first try included).
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Overrides the base backoff delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Overrides the backoff ceiling.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns the total attempt count.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn validate(&self) -> ClientResult<()> {
        if self.max_attempts == 0 {
            return Err(ClientError::configuration(
                "retry policy needs at least one attempt",
            ));
        }
        if self.base_delay.is_zero() {
            return Err(ClientError::configuration(
                "base delay must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ClientError::configuration(
                "jitter ratio must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Returns `true` when another attempt should follow `attempt` (1-based).
    #[must_use]
    pub fn should_retry(&self, attempt: u32, transient: bool) -> bool {
        transient && attempt < self.max_attempts
    }

    /// Computes the delay before the attempt following `attempt`.
    ///
    /// The jitter factor is derived from the attempt number, so the schedule
    /// is reproducible without a randomness source.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(2u32.pow(exponent));
        let capped = scaled.min(self.max_delay);
        let jitter_factor = f64::from(attempt.wrapping_mul(31) % 100) / 100.0;
        capped + capped.mul_f64(self.jitter_ratio * jitter_factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.2,
        }
    }
}

/// HTTP/JSON client for one agent endpoint.
#[derive(Debug)]
pub struct ProtocolClient {
    client: HyperClient,
    base_url: String,
    config: ClientConfig,
    retry: RetryPolicy,
}

impl ProtocolClient {
    /// Creates a client for the agent at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] when the URL is invalid or a
    /// config knob is out of range.
    pub fn new(
        base_url: impl AsRef<str>,
        config: ClientConfig,
        retry: RetryPolicy,
    ) -> ClientResult<Self> {
        config.validate()?;
        retry.validate()?;
        let base_url = sanitize_base_url(base_url.as_ref())?;
        let client = build_https_client(config.connect_timeout)?;
        Ok(Self {
            client,
            base_url,
            config,
            retry,
        })
    }

    /// Fetches and validates the agent's capability card.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] on exchange failure and
    /// [`ClientError::Protocol`] when the card does not decode or validate.
    pub async fn fetch_card(&self) -> ClientResult<CapabilityCard> {
        let uri = self.endpoint("card")?;
        let request = Request::get(uri)
            .body(Body::empty())
            .map_err(|err| ClientError::transport(format!("failed to build request: {err}")))?;
        let bytes = self.exchange(request).await?;
        let document = std::str::from_utf8(&bytes)
            .map_err(|_| ClientError::protocol("card payload is not valid UTF-8"))?;
        CapabilityCard::from_json(document)
            .map_err(|err| ClientError::protocol(format!("invalid capability card: {err}")))
    }

    /// Submits a pre-flight negotiation proposal.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] on exchange failure and
    /// [`ClientError::Protocol`] on an undecodable response.
    pub async fn negotiate(&self, request: &NegotiationRequest) -> ClientResult<NegotiationResult> {
        let uri = self.endpoint("negotiate")?;
        let body = serde_json::to_vec(request)
            .map_err(|err| ClientError::protocol(format!("failed to encode proposal: {err}")))?;
        let request = Request::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|err| ClientError::transport(format!("failed to build request: {err}")))?;
        let bytes = self.exchange(request).await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| ClientError::protocol(format!("undecodable negotiation result: {err}")))
    }

    /// Executes one synchronous call with a fresh correlation id.
    ///
    /// # Errors
    ///
    /// See [`call_with_correlation`](Self::call_with_correlation).
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        budget_usd: f64,
    ) -> ClientResult<(Value, Usage)> {
        self.call_with_correlation(method, params, &CorrelationId::random(), budget_usd)
            .await
    }

    /// Executes one synchronous call, retrying transient failures.
    ///
    /// The correlation id is held constant across attempts so agents with
    /// replay protection can deduplicate.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Agent`] with the final envelope when the agent
    /// rejected the call (terminally, or after retries were exhausted), and
    /// [`ClientError::Transport`] when the exchange itself kept failing.
    pub async fn call_with_correlation(
        &self,
        method: &str,
        params: Value,
        correlation_id: &CorrelationId,
        budget_usd: f64,
    ) -> ClientResult<(Value, Usage)> {
        let mut attempt = 1;
        loop {
            let outcome = self
                .send_invoke(method, &params, correlation_id, budget_usd)
                .await;
            let error = match outcome {
                Ok(result) => match result.into_result() {
                    Ok(pair) => return Ok(pair),
                    Err(envelope) => {
                        if !self
                            .retry
                            .should_retry(attempt, envelope.kind().is_transient())
                        {
                            return Err(ClientError::Agent(envelope));
                        }
                        ClientError::Agent(envelope)
                    }
                },
                // Exchange failures are always transient from the caller's
                // point of view.
                Err(err) => {
                    if !self.retry.should_retry(attempt, true) {
                        return Err(err);
                    }
                    err
                }
            };

            let delay = self.retry.backoff(attempt);
            warn!(method, attempt, ?delay, %error, "retrying after transient failure");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Opens one streamed call.
    ///
    /// Retries apply only until the first event arrives; once any event has
    /// been delivered the stream is bound to its attempt and failures are
    /// surfaced as-is.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when no attempt produced a stream.
    pub async fn call_stream(
        &self,
        method: &str,
        params: Value,
        budget_usd: f64,
    ) -> ClientResult<EventStream> {
        let correlation_id = CorrelationId::random();
        let mut attempt = 1;
        loop {
            match self
                .open_stream(method, &params, &correlation_id, budget_usd)
                .await
            {
                Ok((first, rest)) => {
                    let transient_failure = first
                        .error()
                        .is_some_and(|envelope| envelope.kind().is_transient());
                    if transient_failure && self.retry.should_retry(attempt, true) {
                        let delay = self.retry.backoff(attempt);
                        debug!(method, attempt, ?delay, "retrying stream before first chunk");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(into_event_stream(first, rest));
                }
                Err(err) => {
                    if !self.retry.should_retry(attempt, true) {
                        return Err(err);
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(method, attempt, ?delay, %err, "retrying stream open");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Runs many synchronous calls with bounded concurrency.
    ///
    /// Results are returned in the order the calls were supplied; each entry
    /// succeeds or fails independently.
    pub async fn call_fanout(
        &self,
        calls: Vec<(String, Value, f64)>,
        concurrency: usize,
    ) -> Vec<ClientResult<(Value, Usage)>> {
        futures::stream::iter(calls.into_iter().map(|(method, params, budget_usd)| {
            async move { self.call(&method, params, budget_usd).await }
        }))
        .buffered(concurrency.max(1))
        .collect()
        .await
    }

    async fn send_invoke(
        &self,
        method: &str,
        params: &Value,
        correlation_id: &CorrelationId,
        budget_usd: f64,
    ) -> ClientResult<InvocationResult> {
        let request =
            self.invoke_request("invoke", method, params, correlation_id, budget_usd)?;
        let bytes = self.exchange(request).await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| ClientError::protocol(format!("undecodable result: {err}")))
    }

    async fn open_stream(
        &self,
        method: &str,
        params: &Value,
        correlation_id: &CorrelationId,
        budget_usd: f64,
    ) -> ClientResult<(StreamEvent, SseBody)> {
        let request =
            self.invoke_request("invoke/stream", method, params, correlation_id, budget_usd)?;
        let response = timeout(self.config.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ClientError::timeout("request deadline exceeded"))?
            .map_err(|err| ClientError::transport(format!("request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(ClientError::transport(format!(
                "agent returned {}",
                response.status()
            )));
        }

        let mut body = SseBody::new(
            response.into_body(),
            self.config.chunk_timeout,
            self.config.request_timeout,
        );
        match body.next_event().await {
            Some(Ok(first)) => Ok((first, body)),
            Some(Err(err)) => Err(err),
            None => Err(ClientError::protocol("stream carried no events")),
        }
    }

    fn invoke_request(
        &self,
        path: &str,
        method: &str,
        params: &Value,
        correlation_id: &CorrelationId,
        budget_usd: f64,
    ) -> ClientResult<Request<Body>> {
        let uri = self.endpoint(path)?;
        let payload = json!({
            "protocol_version": PROTOCOL_VERSION,
            "method": method,
            "params": params,
        });
        Request::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .header(BUDGET_HEADER, format!("{budget_usd}"))
            .body(Body::from(payload.to_string()))
            .map_err(|err| ClientError::transport(format!("failed to build request: {err}")))
    }

    async fn exchange(&self, request: Request<Body>) -> ClientResult<hyper::body::Bytes> {
        let response = timeout(self.config.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ClientError::timeout("request deadline exceeded"))?
            .map_err(|err| ClientError::transport(format!("request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(ClientError::transport(format!(
                "agent returned {}",
                response.status()
            )));
        }
        hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| ClientError::transport(format!("failed to read response: {err}")))
    }

    fn endpoint(&self, path: &str) -> ClientResult<Uri> {
        format!("{}{path}", self.base_url)
            .parse::<Uri>()
            .map_err(|err| ClientError::configuration(format!("invalid endpoint: {err}")))
    }
}

/// Body-side state of one open stream.
///
/// Two deadlines bound every read: the per-event inactivity window and the
/// overall deadline fixed when the stream opened. A server dripping events
/// just inside the inactivity window still cannot hold the stream past the
/// overall deadline.
struct SseBody {
    body: Body,
    decoder: SseDecoder,
    pending: VecDeque<StreamEvent>,
    chunk_timeout: Duration,
    deadline: Instant,
    failed: bool,
}

impl SseBody {
    fn new(body: Body, chunk_timeout: Duration, overall_timeout: Duration) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            chunk_timeout,
            deadline: Instant::now() + overall_timeout,
            failed: false,
        }
    }

    async fn next_event(&mut self) -> Option<ClientResult<StreamEvent>> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.decoder.is_finished() {
                return None;
            }
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.failed = true;
                return Some(Err(ClientError::timeout(
                    "stream exceeded the overall deadline",
                )));
            }
            match timeout(remaining.min(self.chunk_timeout), self.body.next()).await {
                Err(_) => {
                    self.failed = true;
                    let reason = if Instant::now() >= self.deadline {
                        "stream exceeded the overall deadline".to_owned()
                    } else {
                        format!(
                            "no event within the {}ms inactivity deadline",
                            self.chunk_timeout.as_millis()
                        )
                    };
                    return Some(Err(ClientError::timeout(reason)));
                }
                Ok(None) => {
                    self.failed = true;
                    return self.decoder.finish().err().map(Err);
                }
                Ok(Some(Err(err))) => {
                    self.failed = true;
                    return Some(Err(ClientError::transport(format!(
                        "stream read failed: {err}"
                    ))));
                }
                Ok(Some(Ok(bytes))) => match self.decoder.push(&bytes) {
                    Ok(events) => self.pending.extend(events),
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                },
            }
        }
    }
}

fn into_event_stream(first: StreamEvent, rest: SseBody) -> EventStream {
    Box::pin(futures::stream::unfold(
        (Some(first), rest),
        |(first, mut body)| async move {
            if let Some(event) = first {
                return Some((Ok(event), (None, body)));
            }
            body.next_event().await.map(|item| (item, (None, body)))
        },
    ))
}

fn sanitize_base_url(input: &str) -> ClientResult<String> {
    let mut base = input.trim().to_owned();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ClientError::configuration(
            "base URL must start with http:// or https://",
        ));
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    base.parse::<Uri>()
        .map_err(|err| ClientError::configuration(format!("invalid base URL: {err}")))?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_requires_scheme() {
        let err = ProtocolClient::new(
            "agent.example.com",
            ClientConfig::default(),
            RetryPolicy::default(),
        )
        .expect_err("missing scheme should error");
        assert!(matches!(err, ClientError::Configuration { .. }));
    }

    #[test]
    fn sanitize_appends_trailing_slash() {
        assert_eq!(
            sanitize_base_url("https://agent.example.com/aip").unwrap(),
            "https://agent.example.com/aip/"
        );
    }

    #[test]
    fn retry_policy_rejects_zero_attempts() {
        let err = RetryPolicy::default()
            .with_max_attempts(0)
            .validate()
            .expect_err("zero attempts");
        assert!(matches!(err, ClientError::Configuration { .. }));
    }

    #[test]
    fn backoff_is_deterministic_and_capped() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(policy.backoff(1), policy.backoff(1));
        assert!(policy.backoff(2) > policy.backoff(1));
        // The exponential component is capped; only jitter varies beyond it.
        assert!(policy.backoff(10) <= Duration::from_millis(600));
    }

    #[test]
    fn only_transient_failures_are_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, true));
        assert!(policy.should_retry(2, true));
        assert!(!policy.should_retry(3, true));
        assert!(!policy.should_retry(1, false));
    }
}
