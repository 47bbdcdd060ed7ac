//! HTTP request handling.
//!
//! Per request:
//!
//! ```text
//! match rule -> request filters -> pick backend -> [buffer body]
//!   -> retry loop { allocate target -> forward } -> response filters
//!   -> stream body (lease held until the body ends)
//! ```
//!
//! Local responses: 404 no route, 403/429 filter rejection, 500 no usable
//! backend, 413 body too large to replay, 503 no healthy target, 502 upstream
//! failure, 504 rule timeout.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TE, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::backend::{AllocateHint, Selection};
use super::forward::{ActiveGuard, ForwardError, ForwardStats, ProxyBody, Upstream};
use super::health::StreamEnd;
use super::registry::BackendRuntime;
use super::retry::{Attempted, RetryContext, RetryExecutor, Tier};
use super::filters::FilterVerdict;
use super::router::{RequestHead, RouteRule, RouteTable};
use super::ProxyContext;
use crate::observe::{GatewayObserver, RequestRecord, ResponseRecord};

/// Serves HTTP for one listener.
pub struct HttpService {
    listener: String,
    routes: Arc<ArcSwap<RouteTable>>,
    ctx: Arc<ProxyContext>,
}

impl HttpService {
    pub fn new(listener: String, routes: Arc<ArcSwap<RouteTable>>, ctx: Arc<ProxyContext>) -> Self {
        Self {
            listener,
            routes,
            ctx,
        }
    }

    /// Serve HTTP/1 or HTTP/2 on an accepted connection until it closes.
    pub async fn serve_connection<IO>(self: Arc<Self>, io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |request| {
            let this = Arc::clone(&self);
            async move { Ok::<_, Infallible>(this.handle(peer, request).await) }
        });
        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(io), service)
            .await
        {
            debug!(error = %e, "HTTP connection closed with error");
        }
    }

    /// Handle one request. Never fails; errors become status responses.
    pub async fn handle(&self, peer: SocketAddr, request: Request<Incoming>) -> Response<ProxyBody> {
        let started = Instant::now();
        let table = self.routes.load_full();
        let head = RequestHead::from_request(&request);
        let record = RequestRecord {
            listener: self.listener.clone(),
            peer,
            method: request.method().clone(),
            host: head.host.map(str::to_string),
            path: request.uri().path().to_string(),
        };
        self.ctx.observer.request_start(&record);

        let grpc = head.is_grpc();
        let rule = match table.as_ref() {
            RouteTable::Http(matcher) => matcher.find(&head).cloned(),
            _ => None,
        };
        let Some(rule) = rule else {
            debug!(path = %record.path, "No route matched");
            return self.local(&record, started, StatusCode::NOT_FOUND, None, None);
        };

        let (mut parts, body) = request.into_parts();
        if let FilterVerdict::Reject(status) = rule.filters.on_request(peer.ip(), &mut parts.headers)
        {
            return self.local(&record, started, status, Some(&*rule), None);
        }

        let Some(choice) = rule.selector.select(&parts.headers) else {
            warn!(route = %rule.route(), rule = rule.index(), "Rule has no backend with weight");
            return self.local(&record, started, StatusCode::INTERNAL_SERVER_ERROR, Some(&*rule), None);
        };
        let Some(backend) = self.ctx.registry.get(choice.backend) else {
            warn!(route = %rule.route(), backend = %choice.backend, "Backend not found");
            return self.local(
                &record,
                started,
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(&*rule),
                Some(choice.backend),
            );
        };

        let executor = RetryExecutor::new(rule.retry.as_ref().or(backend.retry()), backend.has_failover());
        let body = if executor.may_replay() {
            match buffer_body(&parts.headers, body, self.ctx.limits.max_replay_body_bytes).await {
                Ok(bytes) => RequestBody::Buffered(bytes),
                Err(status) => {
                    return self.local(&record, started, status, Some(&*rule), Some(backend.name()))
                }
            }
        } else {
            RequestBody::Once(Mutex::new(Some(body)))
        };
        let template = RequestTemplate::new(parts.method, parts.uri, parts.headers);

        let sticky = backend.session().and_then(|s| s.restore(&template.headers));
        let hash = backend.request_hash(&template.headers, peer.ip());
        let mut retry = RetryContext::default();
        let attempts = executor.run(
            &mut retry,
            attempt_fn(&self.ctx, &backend, &template, &body, sticky.as_deref(), hash, grpc),
        );
        let outcome = match rule.timeout {
            Some(limit) => match tokio::time::timeout(limit, attempts).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(route = %rule.route(), timeout_ms = limit.as_millis() as u64, "Request timed out");
                    return self.local(
                        &record,
                        started,
                        StatusCode::GATEWAY_TIMEOUT,
                        Some(&*rule),
                        Some(backend.name()),
                    );
                }
            },
            None => attempts.await,
        };

        let (response, lease) = match outcome.result {
            Ok(leased) => leased,
            Err(error) => {
                let status = match &error {
                    AttemptError::NoTarget => StatusCode::SERVICE_UNAVAILABLE,
                    AttemptError::Upstream(_) => StatusCode::BAD_GATEWAY,
                };
                debug!(
                    route = %rule.route(),
                    backend = %backend.name(),
                    attempts = retry.attempts,
                    error = %error,
                    "Request failed"
                );
                let response = status_response(status);
                self.ctx.observer.response_head(
                    &record,
                    &ResponseRecord {
                        status,
                        route: Some(rule.route()),
                        backend: Some(backend.name()),
                        target: outcome.target.as_deref(),
                        retry: Some(&retry),
                    },
                );
                self.ctx
                    .observer
                    .response_end(&record, status, 0, started.elapsed());
                return response;
            }
        };

        let (mut parts, incoming) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        rule.filters.on_response(&mut parts.headers);
        rule.selector.preserve(&choice, &mut parts.headers);
        if let Some(session) = backend.session() {
            let token = lease.target().token();
            if sticky.as_deref() != Some(token) {
                session.preserve(&mut parts.headers, token);
            }
        }

        let status = parts.status;
        self.ctx.observer.response_head(
            &record,
            &ResponseRecord {
                status,
                route: Some(rule.route()),
                backend: Some(backend.name()),
                target: Some(lease.target().key()),
                retry: Some(&retry),
            },
        );

        let body = LeasedBody {
            inner: incoming,
            lease: Some(lease),
            backend: Arc::clone(&backend),
            stats: Arc::clone(self.ctx.forwarder.stats()),
            _active: self.ctx.forwarder.stats().track_active(),
            observer: Arc::clone(&self.ctx.observer),
            record,
            status,
            started,
            bytes: 0,
            finished: false,
        };
        Response::from_parts(parts, body.boxed())
    }

    /// Respond without contacting an upstream.
    fn local(
        &self,
        record: &RequestRecord,
        started: Instant,
        status: StatusCode,
        rule: Option<&RouteRule>,
        backend: Option<&str>,
    ) -> Response<ProxyBody> {
        self.ctx.observer.response_head(
            record,
            &ResponseRecord {
                status,
                route: rule.map(RouteRule::route),
                backend,
                target: None,
                retry: None,
            },
        );
        self.ctx
            .observer
            .response_end(record, status, 0, started.elapsed());
        status_response(status)
    }
}

// =============================================================================
// Attempts
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("no healthy target")]
    NoTarget,
    #[error(transparent)]
    Upstream(#[from] ForwardError),
}

type AttemptResult = Result<(Response<Incoming>, Selection), AttemptError>;

type AttemptFuture<'a> = Pin<Box<dyn Future<Output = Attempted<AttemptResult>> + Send + 'a>>;

/// One attempt: lease a target of the tier, then forward.
fn attempt_fn<'a>(
    ctx: &'a ProxyContext,
    backend: &'a BackendRuntime,
    template: &'a RequestTemplate,
    body: &'a RequestBody,
    sticky: Option<&'a str>,
    hash: Option<u64>,
    grpc: bool,
) -> impl FnMut(Tier) -> AttemptFuture<'a> + 'a {
    move |tier| {
        Box::pin(async move {
            let hint = AllocateHint { sticky, hash };
            let Some(lease) = backend.allocate(tier, &hint) else {
                debug!(backend = %backend.name(), tier = ?tier, "No healthy target");
                return Attempted {
                    result: Err(AttemptError::NoTarget),
                    status: None,
                    target: None,
                };
            };

            let target = lease.target().key().to_string();
            let upstream = Upstream {
                backend: backend.name(),
                generation: backend.generation(),
                target: lease.target().as_ref(),
                tls: backend.tls(),
                h2: grpc,
            };
            match ctx.forwarder.send(&upstream, template.build(body.next())).await {
                Ok(response) => Attempted {
                    status: Some(response.status()),
                    target: Some(target),
                    result: Ok((response, lease)),
                },
                Err(e) => {
                    debug!(backend = %backend.name(), target = %target, error = %e, "Upstream request failed");
                    backend.report(&target, e.stream_end());
                    Attempted {
                        result: Err(AttemptError::Upstream(e)),
                        status: None,
                        target: Some(target),
                    }
                }
            }
        })
    }
}

/// Request head kept for every attempt.
struct RequestTemplate {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl RequestTemplate {
    fn new(method: Method, uri: Uri, mut headers: HeaderMap) -> Self {
        strip_hop_by_hop(&mut headers);
        if !headers.contains_key(HOST) {
            if let Some(value) = uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                headers.insert(HOST, value);
            }
        }
        Self {
            method,
            uri,
            headers,
        }
    }

    fn build(&self, body: ProxyBody) -> Request<ProxyBody> {
        let mut request = Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

enum RequestBody {
    /// Replayable copy for retries and failover.
    Buffered(Bytes),
    /// Streamed through on the single attempt.
    Once(Mutex<Option<Incoming>>),
}

impl RequestBody {
    fn next(&self) -> ProxyBody {
        match self {
            RequestBody::Buffered(bytes) => Full::new(bytes.clone())
                .map_err(|never| match never {})
                .boxed(),
            RequestBody::Once(body) => match body.lock().unwrap_or_else(PoisonError::into_inner).take() {
                Some(body) => body.boxed(),
                None => Empty::new().map_err(|never| match never {}).boxed(),
            },
        }
    }
}

async fn buffer_body(headers: &HeaderMap, body: Incoming, limit: usize) -> Result<Bytes, StatusCode> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(StatusCode::PAYLOAD_TOO_LARGE),
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Upstream response body that holds the target lease until it ends.
struct LeasedBody {
    inner: Incoming,
    lease: Option<Selection>,
    backend: Arc<BackendRuntime>,
    stats: Arc<ForwardStats>,
    _active: ActiveGuard,
    observer: Arc<dyn GatewayObserver>,
    record: RequestRecord,
    status: StatusCode,
    started: Instant,
    bytes: u64,
    finished: bool,
}

impl LeasedBody {
    /// `end` is `None` when the client went away first; that says nothing
    /// about the upstream.
    fn finish(&mut self, end: Option<StreamEnd>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(lease) = self.lease.take() {
            if let Some(end) = end {
                self.backend.report(lease.target().key(), end);
            }
        }
        self.stats
            .bytes_from_upstream
            .fetch_add(self.bytes, Ordering::Relaxed);
        self.observer
            .response_end(&self.record, self.status, self.bytes, self.started.elapsed());
    }
}

impl Body for LeasedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(Some(StreamEnd::Error));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(Some(StreamEnd::Completed));
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LeasedBody {
    fn drop(&mut self) {
        self.finish(None);
    }
}

pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or_default();
    let mut response = Response::new(
        Full::new(Bytes::from(format!("{reason}\n")))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

/// Remove connection-scoped headers. `te: trailers` survives for gRPC.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in [CONNECTION, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    if headers
        .get(TE)
        .is_some_and(|v| !v.as_bytes().eq_ignore_ascii_case(b"trailers"))
    {
        headers.remove(TE);
    }
}
