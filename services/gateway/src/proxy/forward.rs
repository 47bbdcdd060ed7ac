//! Upstream connections.
//!
//! The [`Forwarder`] opens raw streams for L4 proxying and sends HTTP requests
//! for L7 proxying. HTTP/1 connections are pooled per target and reused once
//! the previous response has been fully read; HTTP/2 keeps one multiplexed
//! connection per target.
//!
//! Every failure is classified into a [`ForwardError`] whose
//! [`stream_end`](ForwardError::stream_end) feeds passive health checks.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, Uri, Version};
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, Instrument};

use edgeway_resources::AppProtocol;

use super::backend::TargetState;
use super::health::StreamEnd;
use super::tls::UpstreamTls;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle HTTP/1 connections kept per target.
const MAX_IDLE_PER_TARGET: usize = 32;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connection refused by {target}")]
    ConnectionRefused { target: String },

    #[error("connect to {target} timed out")]
    ConnectTimeout { target: String },

    #[error("tls handshake with {target} failed: {reason}")]
    Tls { target: String, reason: String },

    #[error("i/o error with {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("http error with {target}: {source}")]
    Http {
        target: String,
        #[source]
        source: hyper::Error,
    },
}

impl ForwardError {
    pub fn target(&self) -> &str {
        match self {
            ForwardError::ConnectionRefused { target }
            | ForwardError::ConnectTimeout { target }
            | ForwardError::Tls { target, .. }
            | ForwardError::Io { target, .. }
            | ForwardError::Http { target, .. } => target,
        }
    }

    /// Passive health classification.
    pub fn stream_end(&self) -> StreamEnd {
        match self {
            ForwardError::ConnectionRefused { .. } => StreamEnd::ConnectionRefused,
            ForwardError::ConnectTimeout { .. } => StreamEnd::ConnectTimeout,
            ForwardError::Io { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                StreamEnd::ReadTimeout
            }
            ForwardError::Tls { .. } | ForwardError::Io { .. } | ForwardError::Http { .. } => {
                StreamEnd::Error
            }
        }
    }

    fn from_connect(target: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ForwardError::ConnectionRefused {
                target: target.to_string(),
            },
            io::ErrorKind::TimedOut => ForwardError::ConnectTimeout {
                target: target.to_string(),
            },
            _ => ForwardError::Io {
                target: target.to_string(),
                source: err,
            },
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Upstream traffic counters.
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Upstream connections opened.
    pub connections_opened: AtomicU64,
    /// Upstream connections or streamed responses currently in flight.
    pub connections_active: AtomicU64,
    /// HTTP/1 connections reused from the pool.
    pub connections_reused: AtomicU64,
    /// HTTP requests that received a response head.
    pub requests_forwarded: AtomicU64,
    /// Connect or request failures.
    pub failures: AtomicU64,
    /// Bytes proxied to upstreams.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes proxied from upstreams.
    pub bytes_from_upstream: AtomicU64,
}

impl ForwardStats {
    /// Raise the active gauge until the guard is dropped.
    pub fn track_active(self: &Arc<Self>) -> ActiveGuard {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// Keeps [`ForwardStats::connections_active`] raised while alive.
#[derive(Debug)]
pub struct ActiveGuard {
    stats: Arc<ForwardStats>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Upstream stream
// =============================================================================

/// Connected upstream socket, plain or TLS.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// =============================================================================
// Forwarder
// =============================================================================

/// Where an HTTP request goes.
#[derive(Debug, Clone, Copy)]
pub struct Upstream<'a> {
    pub backend: &'a str,
    /// Registry generation of the backend; pooled connections never cross it.
    pub generation: u64,
    pub target: &'a TargetState,
    pub tls: Option<&'a UpstreamTls>,
    /// Force HTTP/2 (gRPC) regardless of the target's declared protocol.
    pub h2: bool,
}

impl Upstream<'_> {
    fn wants_h2(&self) -> bool {
        self.h2 || self.target.protocol() == Some(AppProtocol::H2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    backend: String,
    generation: u64,
    target: String,
}

impl PoolKey {
    fn of(upstream: &Upstream<'_>) -> Self {
        Self {
            backend: upstream.backend.to_string(),
            generation: upstream.generation,
            target: upstream.target.key().to_string(),
        }
    }
}

pub struct Forwarder {
    connect_timeout: Duration,
    http1: Mutex<HashMap<PoolKey, Vec<http1::SendRequest<ProxyBody>>>>,
    h2: Mutex<HashMap<PoolKey, http2::SendRequest<ProxyBody>>>,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            http1: Mutex::new(HashMap::new()),
            h2: Mutex::new(HashMap::new()),
            stats: Arc::new(ForwardStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ForwardStats> {
        &self.stats
    }

    /// Drop pooled connections of a backend, e.g. after it was rebuilt.
    pub fn evict_backend(&self, backend: &str) {
        self.http1
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.backend != backend);
        self.h2
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.backend != backend);
    }

    /// Open a stream to `target`, wrapping it in TLS when configured.
    pub async fn connect(
        &self,
        target: &TargetState,
        tls: Option<&UpstreamTls>,
        h2: bool,
    ) -> Result<UpstreamStream, ForwardError> {
        let result = self.connect_inner(target, tls, h2).await;
        match &result {
            Ok(_) => {
                self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!(target = %target.key(), error = %e, "Upstream connect failed");
            }
        }
        result
    }

    async fn connect_inner(
        &self,
        target: &TargetState,
        tls: Option<&UpstreamTls>,
        h2: bool,
    ) -> Result<UpstreamStream, ForwardError> {
        let key = target.key();
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((target.address(), target.port())),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ForwardError::from_connect(key, e)),
            Err(_) => {
                return Err(ForwardError::ConnectTimeout {
                    target: key.to_string(),
                })
            }
        };
        let _ = stream.set_nodelay(true);

        let Some(tls) = tls else {
            return Ok(UpstreamStream::Plain(stream));
        };
        match timeout(self.connect_timeout, tls.connect(stream, target.address(), h2)).await {
            Ok(Ok(stream)) => Ok(UpstreamStream::Tls(Box::new(stream))),
            Ok(Err(e)) => Err(ForwardError::Tls {
                target: key.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ForwardError::ConnectTimeout {
                target: key.to_string(),
            }),
        }
    }

    /// Send a request and wait for the response head.
    pub async fn send(
        &self,
        upstream: &Upstream<'_>,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let result = if upstream.wants_h2() {
            self.send_h2(upstream, request).await
        } else {
            self.send_http1(upstream, request).await
        };
        match &result {
            Ok(_) => {
                self.stats.requests_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if matches!(e, ForwardError::Http { .. }) {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        result
    }

    async fn send_http1(
        &self,
        upstream: &Upstream<'_>,
        mut request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let key = PoolKey::of(upstream);
        let target = upstream.target.key();

        let mut sender = match self.checkout_http1(&key) {
            Some(sender) => {
                self.stats.connections_reused.fetch_add(1, Ordering::Relaxed);
                sender
            }
            None => {
                let stream = self.connect(upstream.target, upstream.tls, false).await?;
                let (sender, conn) = http1::handshake(TokioIo::new(stream))
                    .await
                    .map_err(|source| ForwardError::Http {
                        target: target.to_string(),
                        source,
                    })?;
                tokio::spawn(
                    async move {
                        if let Err(e) = conn.await {
                            debug!(error = %e, "Upstream connection closed with error");
                        }
                    }
                    .in_current_span(),
                );
                sender
            }
        };

        *request.uri_mut() = origin_form(request.uri());
        *request.version_mut() = Version::HTTP_11;
        let response = sender
            .send_request(request)
            .await
            .map_err(|source| ForwardError::Http {
                target: target.to_string(),
                source,
            })?;
        self.checkin_http1(key, sender);
        Ok(response)
    }

    /// Take a ready connection, keeping those still streaming a response.
    fn checkout_http1(&self, key: &PoolKey) -> Option<http1::SendRequest<ProxyBody>> {
        let mut pool = self.http1.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = pool.get_mut(key)?;
        idle.retain(|sender| !sender.is_closed());
        let position = idle.iter().position(|sender| sender.is_ready())?;
        Some(idle.swap_remove(position))
    }

    fn checkin_http1(&self, key: PoolKey, sender: http1::SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }
        let mut pool = self.http1.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = pool.entry(key).or_default();
        if idle.len() >= MAX_IDLE_PER_TARGET {
            idle.remove(0);
        }
        idle.push(sender);
    }

    async fn send_h2(
        &self,
        upstream: &Upstream<'_>,
        mut request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let key = PoolKey::of(upstream);
        let target = upstream.target.key();

        let cached = {
            let pool = self.h2.lock().unwrap_or_else(PoisonError::into_inner);
            pool.get(&key)
                .filter(|sender| !sender.is_closed() && sender.is_ready())
                .cloned()
        };
        let mut sender = match cached {
            Some(sender) => sender,
            None => {
                let stream = self.connect(upstream.target, upstream.tls, true).await?;
                let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                    .await
                    .map_err(|source| ForwardError::Http {
                        target: target.to_string(),
                        source,
                    })?;
                tokio::spawn(
                    async move {
                        if let Err(e) = conn.await {
                            debug!(error = %e, "Upstream h2 connection closed with error");
                        }
                    }
                    .in_current_span(),
                );
                self.h2
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, sender.clone());
                sender
            }
        };

        let scheme = if upstream.tls.is_some() {
            Scheme::HTTPS
        } else {
            Scheme::HTTP
        };
        *request.uri_mut() = absolute_form(request.uri(), scheme, target);
        *request.version_mut() = Version::HTTP_2;
        sender
            .send_request(request)
            .await
            .map_err(|source| ForwardError::Http {
                target: target.to_string(),
                source,
            })
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

fn path_and_query(uri: &Uri) -> PathAndQuery {
    uri.path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"))
}

fn origin_form(uri: &Uri) -> Uri {
    Uri::from(path_and_query(uri))
}

fn absolute_form(uri: &Uri, scheme: Scheme, target: &str) -> Uri {
    let mut parts = http::uri::Parts::default();
    parts.scheme = Some(scheme);
    parts.authority = uri
        .authority()
        .cloned()
        .or_else(|| target.parse::<Authority>().ok());
    parts.path_and_query = Some(path_and_query(uri));
    Uri::from_parts(parts).unwrap_or_else(|_| origin_form(uri))
}
