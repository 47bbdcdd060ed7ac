//! L4 stream proxying.
//!
//! TCP routes, TLS passthrough and terminated TLS routes all end here: the
//! route's backend is chosen once per connection, a target is leased and the
//! two streams are copied in both directions until either side closes.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::backend::{AllocateHint, Selection};
use super::forward::{ForwardError, UpstreamStream};
use super::health::StreamEnd;
use super::registry::BackendRuntime;
use super::retry::{Attempted, RetryContext, RetryExecutor, Tier};
use super::router::L4Rule;
use super::ProxyContext;
use crate::observe::ConnectionRecord;

const COPY_BUFFER_SIZE: usize = 8192;

/// Bytes moved by [`proxy_bidirectional`] and how the exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub to_b: u64,
    pub from_b: u64,
    pub end: StreamEnd,
}

/// Copy data between two streams until both directions close.
///
/// `a` is the client side and `b` the upstream. Each direction half-closes
/// its destination when its source reaches EOF. Only failures on the
/// upstream side are reported as errors.
pub async fn proxy_bidirectional<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> Transfer
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = copy_half(&mut a_read, &mut b_write, idle_timeout);
    let b_to_a = copy_half(&mut b_read, &mut a_write, idle_timeout);
    let ((to_b, a_error), (from_b, b_error)) = tokio::join!(a_to_b, b_to_a);

    let end = match (&a_error, &b_error) {
        (Some(CopyError::Idle), _) | (_, Some(CopyError::Idle)) => StreamEnd::IdleTimeout,
        (_, Some(CopyError::Read(e))) if e.kind() == io::ErrorKind::TimedOut => {
            StreamEnd::ReadTimeout
        }
        (Some(CopyError::Write(e)), _) if e.kind() == io::ErrorKind::TimedOut => {
            StreamEnd::WriteTimeout
        }
        (_, Some(CopyError::Read(_))) | (Some(CopyError::Write(_)), _) => StreamEnd::Error,
        _ => StreamEnd::Completed,
    };

    // Return bytes transferred even if one direction errored
    Transfer { to_b, from_b, end }
}

#[derive(Debug)]
enum CopyError {
    Idle,
    Read(io::Error),
    Write(io::Error),
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
) -> (u64, Option<CopyError>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read_result = if let Some(timeout) = idle_timeout {
            match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return (total, Some(CopyError::Idle)),
            }
        } else {
            reader.read(&mut buf).await
        };

        match read_result {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return (total, Some(CopyError::Write(e)));
                }
                total += n as u64;
            }
            Err(e) => return (total, Some(CopyError::Read(e))),
        }
    }
    let _ = writer.shutdown().await;
    (total, None)
}

// =============================================================================
// Connection handling
// =============================================================================

/// Where a stream connection was accepted.
#[derive(Debug, Clone, Copy)]
pub struct StreamOrigin<'a> {
    pub listener: &'a str,
    pub peer: SocketAddr,
}

/// Proxy one client stream through `rule`.
///
/// `prefix` holds bytes already read from the client (a sniffed ClientHello)
/// and is written upstream first.
pub async fn proxy_stream<S>(
    ctx: &ProxyContext,
    origin: StreamOrigin<'_>,
    rule: &L4Rule,
    client: S,
    prefix: &[u8],
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut record = ConnectionRecord {
        listener: origin.listener,
        peer: origin.peer,
        route: Some(rule.route()),
        backend: None,
        target: None,
        bytes_to_upstream: 0,
        bytes_from_upstream: 0,
        end: None,
        elapsed: Duration::ZERO,
    };

    let Some(choice) = rule.selector.select(&HeaderMap::new()) else {
        debug!(route = %rule.route(), "Route has no backend with weight");
        record.elapsed = started.elapsed();
        ctx.observer.connection_end(&record);
        return;
    };
    record.backend = Some(choice.backend);
    let Some(backend) = ctx.registry.get(choice.backend) else {
        debug!(route = %rule.route(), backend = %choice.backend, "Backend not found");
        record.elapsed = started.elapsed();
        ctx.observer.connection_end(&record);
        return;
    };

    // Connection failures may fail over; there is no response to retry on.
    let executor = RetryExecutor::new(None, backend.has_failover());
    let hint = AllocateHint {
        sticky: None,
        hash: backend.request_hash(&HeaderMap::new(), origin.peer.ip()),
    };
    let mut retry = RetryContext::default();
    let runtime: &BackendRuntime = &backend;
    let outcome = executor
        .run(&mut retry, |tier| connect(ctx, runtime, tier, &hint))
        .await;

    let target_key = outcome.target.clone();
    record.target = target_key.as_deref();
    let (upstream, lease) = match outcome.result {
        Ok(connected) => connected,
        Err(e) => {
            debug!(backend = %backend.name(), error = ?e, "No upstream for connection");
            record.elapsed = started.elapsed();
            ctx.observer.connection_end(&record);
            return;
        }
    };

    let stats = ctx.forwarder.stats();
    let _active = stats.track_active();
    let transfer = relay(client, upstream, prefix, ctx.limits.stream_idle_timeout).await;
    stats
        .bytes_to_upstream
        .fetch_add(transfer.to_b, Ordering::Relaxed);
    stats
        .bytes_from_upstream
        .fetch_add(transfer.from_b, Ordering::Relaxed);
    backend.report(lease.target().key(), transfer.end);
    drop(lease);

    record.bytes_to_upstream = transfer.to_b;
    record.bytes_from_upstream = transfer.from_b;
    record.end = Some(transfer.end);
    record.elapsed = started.elapsed();
    ctx.observer.connection_end(&record);
}

async fn relay<S>(
    client: S,
    mut upstream: UpstreamStream,
    prefix: &[u8],
    idle_timeout: Option<Duration>,
) -> Transfer
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !prefix.is_empty() {
        if let Err(e) = upstream.write_all(prefix).await {
            debug!(error = %e, "Failed to replay sniffed bytes");
            return Transfer {
                to_b: 0,
                from_b: 0,
                end: StreamEnd::Error,
            };
        }
    }
    let mut transfer = proxy_bidirectional(client, upstream, idle_timeout).await;
    transfer.to_b += prefix.len() as u64;
    transfer
}

#[derive(Debug)]
enum ConnectError {
    NoTarget,
    Upstream(ForwardError),
}

async fn connect(
    ctx: &ProxyContext,
    backend: &BackendRuntime,
    tier: Tier,
    hint: &AllocateHint<'_>,
) -> Attempted<Result<(UpstreamStream, Selection), ConnectError>> {
    let Some(lease) = backend.allocate(tier, hint) else {
        return Attempted {
            result: Err(ConnectError::NoTarget),
            status: None,
            target: None,
        };
    };
    let target = lease.target().key().to_string();
    match ctx.forwarder.connect(lease.target(), backend.tls(), false).await {
        // an established connection concludes the loop like a 200
        Ok(stream) => Attempted {
            result: Ok((stream, lease)),
            status: Some(StatusCode::OK),
            target: Some(target),
        },
        Err(e) => {
            backend.report(&target, e.stream_end());
            Attempted {
                result: Err(ConnectError::Upstream(e)),
                status: None,
                target: Some(target),
            }
        }
    }
}
