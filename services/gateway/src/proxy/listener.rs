//! Listener sockets and connection dispatch.
//!
//! A [`ListenerHandle`] owns one bound socket and its accept loop. The
//! listener's [`RouteTable`] sits behind an `ArcSwap` so routes can be
//! replaced without rebinding; each connection loads the table once, HTTP
//! connections once per request.
//!
//! | protocol | per connection |
//! |----------|----------------|
//! | HTTP     | hyper, HTTP/1 or h2c |
//! | HTTPS    | TLS accept, then hyper |
//! | TLS passthrough | sniff SNI, replay ClientHello upstream |
//! | TLS terminate   | TLS accept, SNI from the handshake, plaintext upstream |
//! | TCP      | raw relay |
//! | UDP      | per-client sessions, see [`super::udp`] |

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use edgeway_resources::{ListenerProtocol, ListenerSpec, TlsMode};

use super::http::HttpService;
use super::router::RouteTable;
use super::sni::SniResult;
use super::stream::{proxy_stream, StreamOrigin};
use super::tls;
use super::udp;
use super::ProxyContext;
use crate::error::BuildError;

const DEFAULT_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Socket identity of a listener. Two listeners with the same key cannot
/// both be bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    pub address: String,
    pub port: u16,
    pub transport: Transport,
}

impl ListenerKey {
    pub fn for_spec(spec: &ListenerSpec) -> Self {
        let address = spec
            .address
            .as_deref()
            .map(|a| a.trim_start_matches('[').trim_end_matches(']'))
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_ADDRESS)
            .to_string();
        Self {
            address,
            port: spec.port,
            transport: if spec.protocol.is_udp() {
                Transport::Udp
            } else {
                Transport::Tcp
            },
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = match self.transport {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        };
        if self.address.contains(':') {
            write!(f, "{}/[{}]:{}", transport, self.address, self.port)
        } else {
            write!(f, "{}/{}:{}", transport, self.address, self.port)
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Failed TLS handshakes on terminating listeners.
    pub tls_failed: AtomicU64,
    pub sni_found: AtomicU64,
    /// SNI extraction failures (timeout, not TLS, no extension).
    pub sni_failed: AtomicU64,
    pub routes_matched: AtomicU64,
    pub routes_failed: AtomicU64,
}

/// How accepted TCP connections are served.
#[derive(Clone)]
enum Mode {
    Http,
    Https(TlsAcceptor),
    TlsPassthrough,
    TlsTerminate(TlsAcceptor),
    Tcp,
}

impl Mode {
    fn for_spec(spec: &ListenerSpec) -> Result<Self, BuildError> {
        let tls_mode = spec.tls.as_ref().map(|tls| tls.mode).unwrap_or_default();
        match (spec.protocol, tls_mode) {
            (ListenerProtocol::Http, _) => Ok(Mode::Http),
            (ListenerProtocol::Https, TlsMode::Passthrough) => Err(BuildError::Listener {
                listener: spec.name.clone(),
                reason: "HTTPS listeners must terminate TLS".to_string(),
            }),
            (ListenerProtocol::Https, TlsMode::Terminate) => {
                let config = tls::server_config(first_certificate(spec)?)?;
                Ok(Mode::Https(TlsAcceptor::from(config)))
            }
            (ListenerProtocol::Tls, TlsMode::Passthrough) => Ok(Mode::TlsPassthrough),
            (ListenerProtocol::Tls, TlsMode::Terminate) => {
                let mut config = (*tls::server_config(first_certificate(spec)?)?).clone();
                // opaque stream: no ALPN
                config.alpn_protocols.clear();
                Ok(Mode::TlsTerminate(TlsAcceptor::from(Arc::new(config))))
            }
            (ListenerProtocol::Tcp, _) => Ok(Mode::Tcp),
            (ListenerProtocol::Udp, _) => Err(BuildError::Listener {
                listener: spec.name.clone(),
                reason: "UDP listeners have no stream mode".to_string(),
            }),
        }
    }
}

fn first_certificate(spec: &ListenerSpec) -> Result<&edgeway_resources::CertificateRef, BuildError> {
    spec.tls
        .as_ref()
        .and_then(|tls| tls.certificates.first())
        .ok_or_else(|| BuildError::Listener {
            listener: spec.name.clone(),
            reason: "TLS termination requires a certificate".to_string(),
        })
}

/// A bound listener and its running accept loop.
///
/// Dropping the handle stops accepting; connections already accepted run to
/// completion against the route table they started with.
pub struct ListenerHandle {
    key: ListenerKey,
    spec: ListenerSpec,
    local_addr: SocketAddr,
    routes: Arc<ArcSwap<RouteTable>>,
    stats: Arc<ListenerStats>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Bind the socket for `spec` and start serving `routes`.
    pub async fn bind(
        spec: &ListenerSpec,
        routes: RouteTable,
        ctx: Arc<ProxyContext>,
    ) -> Result<Self, BuildError> {
        let key = ListenerKey::for_spec(spec);
        let routes = Arc::new(ArcSwap::from_pointee(routes));
        let stats = Arc::new(ListenerStats::default());
        let name: Arc<str> = Arc::from(spec.name.as_str());
        let bind_error = |e: io::Error| BuildError::Listener {
            listener: spec.name.clone(),
            reason: format!("bind {}: {}", key, e),
        };

        let (local_addr, task) = match key.transport {
            Transport::Udp => {
                let socket = UdpSocket::bind((key.address.as_str(), key.port))
                    .await
                    .map_err(bind_error)?;
                let local_addr = socket.local_addr().map_err(bind_error)?;
                let task = tokio::spawn(
                    udp::serve(Arc::new(socket), Arc::clone(&name), Arc::clone(&routes), ctx)
                        .instrument(tracing::info_span!("listener", name = %name)),
                );
                (local_addr, task)
            }
            Transport::Tcp => {
                let mode = Mode::for_spec(spec)?;
                let listener = TcpListener::bind((key.address.as_str(), key.port))
                    .await
                    .map_err(bind_error)?;
                let local_addr = listener.local_addr().map_err(bind_error)?;
                let acceptor = Acceptor {
                    name: Arc::clone(&name),
                    mode,
                    routes: Arc::clone(&routes),
                    stats: Arc::clone(&stats),
                    http: Arc::new(HttpService::new(
                        spec.name.clone(),
                        Arc::clone(&routes),
                        Arc::clone(&ctx),
                    )),
                    semaphore: Arc::new(Semaphore::new(ctx.limits.max_connections)),
                    ctx,
                };
                let task = tokio::spawn(
                    acceptor
                        .run(listener)
                        .instrument(tracing::info_span!("listener", name = %name)),
                );
                (local_addr, task)
            }
        };

        info!(
            listener = %spec.name,
            bind_addr = %local_addr,
            protocol = ?spec.protocol,
            "Listener bound"
        );

        Ok(Self {
            key,
            spec: spec.clone(),
            local_addr,
            routes,
            stats,
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Replace the route table. In-flight lookups keep the old one.
    pub fn swap_routes(&self, routes: RouteTable) {
        self.routes.store(Arc::new(routes));
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        info!(listener = %self.spec.name, "Listener stopped");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("name", &self.spec.name)
            .field("key", &self.key)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Accept loop
// =============================================================================

struct Acceptor {
    name: Arc<str>,
    mode: Mode,
    routes: Arc<ArcSwap<RouteTable>>,
    stats: Arc<ListenerStats>,
    http: Arc<HttpService>,
    semaphore: Arc<Semaphore>,
    ctx: Arc<ProxyContext>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        let this = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match Arc::clone(&this.semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            this.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    this.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    this.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let acceptor = Arc::clone(&this);
                    tokio::spawn(
                        async move {
                            if let Err(e) = acceptor.handle_connection(stream, peer_addr).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            acceptor
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                            acceptor
                                .stats
                                .connections_closed
                                .fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let origin = StreamOrigin {
            listener: &self.name,
            peer,
        };

        match &self.mode {
            Mode::Http => {
                Arc::clone(&self.http).serve_connection(client, peer).await;
            }
            Mode::Https(acceptor) => {
                let tls = self.tls_accept(acceptor, client).await?;
                Arc::clone(&self.http).serve_connection(tls, peer).await;
            }
            Mode::Tcp => {
                let table = self.routes.load_full();
                let RouteTable::Stream(Some(rule)) = table.as_ref() else {
                    self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
                    debug!("No TCP route");
                    return Ok(());
                };
                self.stats.routes_matched.fetch_add(1, Ordering::Relaxed);
                proxy_stream(&self.ctx, origin, rule, client, &[]).await;
            }
            Mode::TlsPassthrough => {
                let mut sniffed = Vec::new();
                let result = self.ctx.limits.sni.inspect(&mut client, &mut sniffed).await;
                let sni = match result {
                    SniResult::Found(hostname) => {
                        self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
                        Some(hostname)
                    }
                    SniResult::IoError(e) => {
                        self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(io::Error::other(e));
                    }
                    other => {
                        self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                        debug!(result = ?other, "No SNI from client");
                        None
                    }
                };
                let table = self.routes.load_full();
                let Some(rule) = self.sni_rule(&table, sni.as_deref()) else {
                    return Ok(());
                };
                proxy_stream(&self.ctx, origin, &rule, client, &sniffed).await;
            }
            Mode::TlsTerminate(acceptor) => {
                let tls = self.tls_accept(acceptor, client).await?;
                let sni = tls
                    .get_ref()
                    .1
                    .server_name()
                    .map(|name| name.trim_end_matches('.').to_ascii_lowercase());
                if sni.is_some() {
                    self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                }
                let table = self.routes.load_full();
                let Some(rule) = self.sni_rule(&table, sni.as_deref()) else {
                    return Ok(());
                };
                proxy_stream(&self.ctx, origin, &rule, tls, &[]).await;
            }
        }
        Ok(())
    }

    async fn tls_accept(
        &self,
        acceptor: &TlsAcceptor,
        client: TcpStream,
    ) -> io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
        acceptor.accept(client).await.inspect_err(|e| {
            self.stats.tls_failed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "TLS handshake failed");
        })
    }

    fn sni_rule(
        &self,
        table: &RouteTable,
        sni: Option<&str>,
    ) -> Option<Arc<super::router::L4Rule>> {
        let rule = match table {
            RouteTable::Sni(matcher) => matcher.find(sni).cloned(),
            _ => None,
        };
        match &rule {
            Some(_) => self.stats.routes_matched.fetch_add(1, Ordering::Relaxed),
            None => {
                debug!(sni = sni.unwrap_or("-"), "No TLS route");
                self.stats.routes_failed.fetch_add(1, Ordering::Relaxed)
            }
        };
        rule
    }
}
