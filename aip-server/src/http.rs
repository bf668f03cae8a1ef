//! HTTP/JSON transport surface for one agent.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use aip_primitives::{
    BUDGET_HEADER, CORRELATION_HEADER, CapabilityCard, CorrelationId, ErrorEnvelope, ErrorKind,
    InvocationRequest, InvocationResult, NegotiationRequest, PROTOCOL_VERSION, StreamEvent,
};
use bytes::Bytes;
use futures::StreamExt;
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::negotiate::Negotiator;
use crate::registry::HandlerRegistry;
use crate::router::InvocationRouter;
use crate::stream::{StreamConfig, StreamingRouter};
use crate::traits::{AuditSink, CostEstimator, IdempotencyStore};

/// Errors raised while assembling or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The capability card failed validation at startup.
    #[error("invalid capability card: {0}")]
    Card(#[from] aip_primitives::Error),

    /// A configuration knob was out of range.
    #[error("invalid server configuration: {0}")]
    Config(&'static str),

    /// The underlying HTTP listener failed.
    #[error("transport failure: {0}")]
    Transport(#[from] hyper::Error),
}

/// Result alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Agent-side protocol endpoint.
///
/// Routes `GET /card`, `GET /healthz`, `POST /negotiate`, `POST /invoke` and
/// `POST /invoke/stream`. Protocol failures travel in-band as typed error
/// envelopes with a `200` status; only transport-level problems surface as
/// non-success statuses.
pub struct AgentServer {
    card: Arc<CapabilityCard>,
    router: InvocationRouter,
    streaming: StreamingRouter,
    negotiator: Negotiator,
}

impl AgentServer {
    /// Builds a server over a card and its collaborators.
    ///
    /// The card is validated here so a malformed card fails startup instead
    /// of serving garbage.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Card`] when the card fails validation.
    pub fn new(
        card: CapabilityCard,
        registry: HandlerRegistry,
        estimator: Arc<dyn CostEstimator>,
        audit: Arc<dyn AuditSink>,
    ) -> ServerResult<Self> {
        card.validate()?;
        let card = Arc::new(card);
        let registry = Arc::new(registry);
        let router = InvocationRouter::new(
            Arc::clone(&card),
            Arc::clone(&registry),
            Arc::clone(&estimator),
            Arc::clone(&audit),
        );
        let streaming = StreamingRouter::new(
            Arc::clone(&card),
            registry,
            Arc::clone(&estimator),
            audit,
        );
        let negotiator = Negotiator::new(Arc::clone(&card), estimator);
        Ok(Self {
            card,
            router,
            streaming,
            negotiator,
        })
    }

    /// Installs the replay-safety collaborator for synchronous invocations.
    #[must_use]
    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.router = self.router.with_idempotency(store);
        self
    }

    /// Overrides the streaming configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] when a knob is out of range.
    pub fn with_stream_config(mut self, config: StreamConfig) -> ServerResult<Self> {
        config.validate().map_err(ServerError::Config)?;
        self.streaming = self.streaming.with_config(config);
        Ok(self)
    }

    /// Serves requests on `addr` until the process is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Transport`] when binding or serving fails.
    pub async fn run(self, addr: SocketAddr) -> ServerResult<()> {
        let server = Arc::new(self);
        info!(%addr, agent = %server.card.id(), "agent server listening");
        let make_svc = make_service_fn(move |_conn| {
            let server = Arc::clone(&server);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(route(server, req).await) }
                }))
            }
        });
        Server::try_bind(&addr)?.serve(make_svc).await?;
        Ok(())
    }

    /// Binds to `addr` and returns the bound address plus a shutdown handle.
    ///
    /// The server runs on a spawned task until the handle is dropped or
    /// triggered. Intended for tests and embedding.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Transport`] when binding fails.
    pub fn bind(self, addr: SocketAddr) -> ServerResult<(SocketAddr, ShutdownHandle)> {
        let server = Arc::new(self);
        let make_svc = make_service_fn(move |_conn| {
            let server = Arc::clone(&server);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(route(server, req).await) }
                }))
            }
        });
        let bound = Server::try_bind(&addr)?.serve(make_svc);
        let local_addr = bound.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let graceful = bound.with_graceful_shutdown(async move {
            let _ = rx.await;
        });
        tokio::spawn(async move {
            if let Err(err) = graceful.await {
                error!(%err, "agent server terminated abnormally");
            }
        });
        Ok((local_addr, ShutdownHandle { tx: Some(tx) }))
    }
}

/// Stops a bound server when triggered or dropped.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Requests a graceful shutdown.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Body accepted by the invoke endpoints; correlation id and budget travel
/// in headers.
#[derive(Debug, Deserialize)]
struct InvokeBody {
    protocol_version: String,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

pub(crate) async fn route(server: Arc<AgentServer>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    debug!(%method, path, "request received");

    match (method, path.as_str()) {
        (Method::GET, "/card") => json_response(StatusCode::OK, server.card.as_ref()),
        (Method::GET, "/healthz") => json_response(
            StatusCode::OK,
            &json!({"status": "ok", "agent": server.card.id(), "protocol": PROTOCOL_VERSION}),
        ),
        (Method::POST, "/negotiate") => negotiate(&server, req).await,
        (Method::POST, "/invoke") => invoke(&server, req).await,
        (Method::POST, "/invoke/stream") => invoke_stream(&server, req).await,
        _ => json_response(
            StatusCode::NOT_FOUND,
            &json!({"error": "unknown endpoint"}),
        ),
    }
}

async fn negotiate(server: &AgentServer, req: Request<Body>) -> Response<Body> {
    let request: NegotiationRequest = match read_json(req).await {
        Ok(request) => request,
        Err(envelope) => return json_response(StatusCode::OK, &envelope),
    };
    json_response(StatusCode::OK, &server.negotiator.negotiate(&request))
}

async fn invoke(server: &AgentServer, req: Request<Body>) -> Response<Body> {
    let request = match extract_invocation(req).await {
        Ok(request) => request,
        Err(envelope) => {
            return json_response(StatusCode::OK, &InvocationResult::failure(envelope));
        }
    };
    let result = server.router.invoke(&request).await;
    json_response(StatusCode::OK, &result)
}

async fn invoke_stream(server: &AgentServer, req: Request<Body>) -> Response<Body> {
    let request = match extract_invocation(req).await {
        Ok(request) => request,
        Err(envelope) => {
            // Even pre-check failures travel as a single SSE error frame so
            // consumers parse one surface.
            let event = StreamEvent::failed(0, envelope, None);
            let frame = sse_frame(&event);
            return sse_response(Body::from(frame));
        }
    };

    let mut events = server.streaming.invoke_stream(request);
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let frame = sse_frame(&event);
            if sender.send_data(Bytes::from(frame)).await.is_err() {
                // Consumer is gone; dropping the stream cancels the worker.
                debug!("event stream consumer disconnected");
                return;
            }
        }
    });
    sse_response(body)
}

/// Pulls correlation id and budget from headers and the call shape from the
/// body, then assembles the validated wire request.
async fn extract_invocation(req: Request<Body>) -> Result<InvocationRequest, ErrorEnvelope> {
    let correlation_id = header_str(&req, CORRELATION_HEADER)?;
    let correlation_id = CorrelationId::new(correlation_id).map_err(|err| {
        ErrorEnvelope::new(ErrorKind::ValidationError, err.to_string())
    })?;

    let budget = header_str(&req, BUDGET_HEADER)?;
    let budget_usd: f64 = budget.parse().map_err(|_| {
        ErrorEnvelope::new(
            ErrorKind::ValidationError,
            format!("`{BUDGET_HEADER}` must be a decimal USD amount"),
        )
    })?;

    let body: InvokeBody = read_json(req).await?;
    if body.protocol_version != PROTOCOL_VERSION {
        return Err(ErrorEnvelope::new(
            ErrorKind::ValidationError,
            format!(
                "unsupported protocol version `{}`; this agent speaks `{PROTOCOL_VERSION}`",
                body.protocol_version
            ),
        ));
    }

    InvocationRequest::new(body.method, body.params, correlation_id, budget_usd)
        .map_err(|err| ErrorEnvelope::new(ErrorKind::ValidationError, err.to_string()))
}

fn header_str<'a>(req: &'a Request<Body>, name: &str) -> Result<&'a str, ErrorEnvelope> {
    req.headers()
        .get(name)
        .ok_or_else(|| {
            ErrorEnvelope::new(
                ErrorKind::ValidationError,
                format!("missing required `{name}` header"),
            )
        })?
        .to_str()
        .map_err(|_| {
            ErrorEnvelope::new(
                ErrorKind::ValidationError,
                format!("`{name}` header is not valid ASCII"),
            )
        })
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, ErrorEnvelope> {
    let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|err| {
        ErrorEnvelope::new(
            ErrorKind::ValidationError,
            format!("failed to read request body: {err}"),
        )
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        ErrorEnvelope::new(
            ErrorKind::ValidationError,
            format!("malformed request body: {err}"),
        )
    })
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            error!(%err, "response serialization failed");
            let mut response = Response::new(Body::from(r#"{"error":"serialization failure"}"#));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn sse_response(body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/event-stream"));
    response
}

/// Encodes one event as an SSE data frame.
fn sse_frame(event: &StreamEvent) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("data: {json}\n\n"),
        Err(err) => {
            error!(%err, "stream event serialization failed");
            let fallback = StreamEvent::failed(
                event.sequence(),
                ErrorEnvelope::new(ErrorKind::AgentUnavailable, "internal agent failure"),
                None,
            );
            // A failed-event is plain data and always serializes.
            serde_json::to_string(&fallback)
                .map(|json| format!("data: {json}\n\n"))
                .unwrap_or_default()
        }
    }
}
