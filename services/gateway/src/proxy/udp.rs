//! UDP session relay.
//!
//! Each client address gets a session: a connected upstream socket on a
//! leased target plus a task relaying replies back to the client. A session
//! ends after `idle_timeout` without traffic in either direction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use http::HeaderMap;
use tokio::net::UdpSocket;
use tracing::{debug, warn, Instrument};

use super::backend::{AllocateHint, Selection};
use super::health::StreamEnd;
use super::registry::BackendRuntime;
use super::retry::Tier;
use super::router::RouteTable;
use super::ProxyContext;
use crate::observe::ConnectionRecord;

/// Largest datagram relayed.
const MAX_DATAGRAM: usize = 65_535;

struct Session {
    upstream: Arc<UdpSocket>,
    last_seen: Mutex<Instant>,
    sent: AtomicU64,
}

impl Session {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

type Sessions = Arc<Mutex<HashMap<SocketAddr, Arc<Session>>>>;

/// Receive loop of one UDP listener. Runs until the task is aborted.
pub async fn serve(
    socket: Arc<UdpSocket>,
    listener: Arc<str>,
    routes: Arc<ArcSwap<RouteTable>>,
    ctx: Arc<ProxyContext>,
) {
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "UDP receive error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let existing = sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .cloned();
        let session = match existing {
            Some(session) => session,
            None => {
                let table = routes.load_full();
                let RouteTable::Stream(Some(rule)) = table.as_ref() else {
                    debug!(peer = %peer, "No UDP route");
                    continue;
                };
                let Some(backend) = rule
                    .selector
                    .select(&HeaderMap::new())
                    .and_then(|choice| ctx.registry.get(choice.backend))
                else {
                    debug!(route = %rule.route(), "No backend for UDP route");
                    continue;
                };
                match open_session(&backend, peer).await {
                    Some((session, lease)) => {
                        sessions
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(peer, Arc::clone(&session));
                        let relay = ReplyRelay {
                            listener: Arc::clone(&listener),
                            route: rule.route().to_string(),
                            client: Arc::clone(&socket),
                            peer,
                            session: Arc::clone(&session),
                            sessions: Arc::clone(&sessions),
                            backend,
                            lease,
                            ctx: Arc::clone(&ctx),
                        };
                        tokio::spawn(
                            relay
                                .run()
                                .instrument(tracing::info_span!("udp_session", peer = %peer)),
                        );
                        session
                    }
                    None => continue,
                }
            }
        };

        session.touch();
        match session.upstream.send(&buf[..n]).await {
            Ok(sent) => {
                session.sent.fetch_add(sent as u64, Ordering::Relaxed);
                ctx.forwarder
                    .stats()
                    .bytes_to_upstream
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(e) => debug!(peer = %peer, error = %e, "UDP send to upstream failed"),
        }
    }
}

/// Lease a target (failing over when the primary tier is empty) and connect
/// a fresh socket to it.
async fn open_session(
    backend: &BackendRuntime,
    peer: SocketAddr,
) -> Option<(Arc<Session>, Selection)> {
    let hint = AllocateHint {
        sticky: None,
        hash: backend.request_hash(&HeaderMap::new(), peer.ip()),
    };
    let lease = backend
        .allocate(Tier::Primary, &hint)
        .or_else(|| backend.allocate(Tier::Failover, &hint));
    let Some(lease) = lease else {
        debug!(backend = %backend.name(), "No healthy UDP target");
        return None;
    };

    let target = lease.target();
    let bind_addr = if target.address().parse::<std::net::Ipv6Addr>().is_ok() {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "Failed to bind UDP upstream socket");
            return None;
        }
    };
    if let Err(e) = socket.connect((target.address(), target.port())).await {
        debug!(target = %target.key(), error = %e, "UDP upstream connect failed");
        backend.report(target.key(), StreamEnd::Error);
        return None;
    }

    let session = Arc::new(Session {
        upstream: Arc::new(socket),
        last_seen: Mutex::new(Instant::now()),
        sent: AtomicU64::new(0),
    });
    Some((session, lease))
}

struct ReplyRelay {
    listener: Arc<str>,
    route: String,
    client: Arc<UdpSocket>,
    peer: SocketAddr,
    session: Arc<Session>,
    sessions: Sessions,
    backend: Arc<BackendRuntime>,
    lease: Selection,
    ctx: Arc<ProxyContext>,
}

impl ReplyRelay {
    async fn run(self) {
        let started = Instant::now();
        let idle_timeout = self.ctx.limits.udp_idle_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut from_upstream = 0u64;

        let end = loop {
            let wait = idle_timeout.saturating_sub(self.session.idle_for());
            if wait.is_zero() {
                break StreamEnd::IdleTimeout;
            }
            match tokio::time::timeout(wait, self.session.upstream.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    self.session.touch();
                    from_upstream += n as u64;
                    if let Err(e) = self.client.send_to(&buf[..n], self.peer).await {
                        debug!(error = %e, "UDP send to client failed");
                    }
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    break StreamEnd::ConnectionRefused
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "UDP receive from upstream failed");
                    break StreamEnd::Error;
                }
                // re-checked against client activity at the top of the loop
                Err(_) => continue,
            }
        };

        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer);
        self.ctx
            .forwarder
            .stats()
            .bytes_from_upstream
            .fetch_add(from_upstream, Ordering::Relaxed);
        self.backend.report(self.lease.target().key(), end);

        self.ctx.observer.connection_end(&ConnectionRecord {
            listener: &self.listener,
            peer: self.peer,
            route: Some(&self.route),
            backend: Some(self.backend.name()),
            target: Some(self.lease.target().key()),
            bytes_to_upstream: self.session.sent.load(Ordering::Relaxed),
            bytes_from_upstream: from_upstream,
            end: Some(end),
            elapsed: started.elapsed(),
        });
    }
}
