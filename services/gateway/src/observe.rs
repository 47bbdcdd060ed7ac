//! Observability hooks.
//!
//! The proxy calls a [`GatewayObserver`] at fixed points of every request and
//! connection. All methods default to no-ops; [`TracingObserver`] turns them
//! into structured `tracing` events and is what the binary installs.

use std::net::SocketAddr;
use std::time::Duration;

use http::{Method, StatusCode};
use tracing::{debug, info};

use crate::proxy::health::StreamEnd;
use crate::proxy::retry::RetryContext;

/// Request identity captured when the head arrives.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub listener: String,
    pub peer: SocketAddr,
    pub method: Method,
    pub host: Option<String>,
    pub path: String,
}

/// Routing outcome known once the response head is ready.
#[derive(Debug, Clone, Copy)]
pub struct ResponseRecord<'a> {
    pub status: StatusCode,
    pub route: Option<&'a str>,
    pub backend: Option<&'a str>,
    pub target: Option<&'a str>,
    pub retry: Option<&'a RetryContext>,
}

/// A finished L4 connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRecord<'a> {
    pub listener: &'a str,
    pub peer: SocketAddr,
    pub route: Option<&'a str>,
    pub backend: Option<&'a str>,
    pub target: Option<&'a str>,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
    /// `None` when no upstream was reached.
    pub end: Option<StreamEnd>,
    pub elapsed: Duration,
}

pub trait GatewayObserver: Send + Sync + 'static {
    fn request_start(&self, _request: &RequestRecord) {}

    fn response_head(&self, _request: &RequestRecord, _response: &ResponseRecord<'_>) {}

    /// Called once the response body finished streaming or was abandoned.
    fn response_end(
        &self,
        _request: &RequestRecord,
        _status: StatusCode,
        _body_bytes: u64,
        _elapsed: Duration,
    ) {
    }

    fn connection_end(&self, _connection: &ConnectionRecord<'_>) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl GatewayObserver for NoopObserver {}

/// Emits access-log style `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl GatewayObserver for TracingObserver {
    fn request_start(&self, request: &RequestRecord) {
        debug!(
            listener = %request.listener,
            peer = %request.peer,
            method = %request.method,
            host = request.host.as_deref().unwrap_or("-"),
            path = %request.path,
            "Request started"
        );
    }

    fn response_head(&self, request: &RequestRecord, response: &ResponseRecord<'_>) {
        let (attempts, retries, limit_exceeded, failed_over) = response
            .retry
            .map(|ctx| (ctx.attempts, ctx.retries, ctx.limit_exceeded, ctx.failed_over))
            .unwrap_or_default();
        debug!(
            listener = %request.listener,
            path = %request.path,
            status = response.status.as_u16(),
            route = response.route.unwrap_or("-"),
            backend = response.backend.unwrap_or("-"),
            target = response.target.unwrap_or("-"),
            attempts,
            retries,
            limit_exceeded,
            failed_over,
            "Response head"
        );
    }

    fn response_end(
        &self,
        request: &RequestRecord,
        status: StatusCode,
        body_bytes: u64,
        elapsed: Duration,
    ) {
        info!(
            listener = %request.listener,
            peer = %request.peer,
            method = %request.method,
            host = request.host.as_deref().unwrap_or("-"),
            path = %request.path,
            status = status.as_u16(),
            body_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
    }

    fn connection_end(&self, connection: &ConnectionRecord<'_>) {
        info!(
            listener = %connection.listener,
            peer = %connection.peer,
            route = connection.route.unwrap_or("-"),
            backend = connection.backend.unwrap_or("-"),
            target = connection.target.unwrap_or("-"),
            bytes_to_upstream = connection.bytes_to_upstream,
            bytes_from_upstream = connection.bytes_from_upstream,
            end = ?connection.end,
            elapsed_ms = connection.elapsed.as_millis() as u64,
            "Connection closed"
        );
    }
}
