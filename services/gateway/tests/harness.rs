//! Test harness for gateway integration tests.
//!
//! Provides helpers to spawn HTTP, TCP, UDP and TLS backends, start a
//! gateway runtime over a YAML resource set, and talk to its listeners.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

use edgeway_gateway::{GatewayRuntime, NoopObserver, RuntimeOptions};
use edgeway_resources::{parse_resources, ResourceStore};

/// Gateway name used by every fixture.
pub const GATEWAY: &str = "edge";

/// A port nothing listens on.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// =============================================================================
// Backends
// =============================================================================

/// HTTP/1 backend answering every request with its name.
#[allow(dead_code)]
pub struct HttpBackend {
    pub addr: SocketAddr,
    pub name: String,
    pub requests: Arc<AtomicU64>,
    status: Arc<AtomicU16>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl HttpBackend {
    pub async fn spawn(name: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicU64::new(0));
        let status = Arc::new(AtomicU16::new(200));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let name_clone = name.to_string();
        let requests_clone = Arc::clone(&requests);
        let status_clone = Arc::clone(&status);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        let name = name_clone.clone();
                        let requests = Arc::clone(&requests_clone);
                        let status = Arc::clone(&status_clone);
                        tokio::spawn(async move {
                            let service = service_fn(move |request: Request<Incoming>| {
                                let name = name.clone();
                                let requests = Arc::clone(&requests);
                                let status = Arc::clone(&status);
                                async move {
                                    requests.fetch_add(1, Ordering::Relaxed);
                                    let path = request.uri().path().to_string();
                                    let code = StatusCode::from_u16(status.load(Ordering::Relaxed))
                                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                                    let response = Response::builder()
                                        .status(code)
                                        .header("x-backend", name.as_str())
                                        .header("x-path", path)
                                        .body(Full::new(Bytes::from(name)))
                                        .unwrap();
                                    Ok::<_, std::convert::Infallible>(response)
                                }
                            });
                            let _ = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            name: name.to_string(),
            requests,
            status,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Raw HTTP/1 backend that waits `head_delay` before the response head, then
/// streams an endless body in 1 KiB chunks until the peer goes away.
#[allow(dead_code)]
pub struct StreamingBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl StreamingBackend {
    pub async fn spawn(head_delay: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            let mut head = Vec::new();
                            let mut buf = [0u8; 1024];
                            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => return,
                                    Ok(n) => head.extend_from_slice(&buf[..n]),
                                }
                            }
                            tokio::time::sleep(head_delay).await;
                            let response_head =
                                b"HTTP/1.1 200 OK\r\ncontent-length: 104857600\r\n\r\n";
                            if stream.write_all(response_head).await.is_err() {
                                return;
                            }
                            let chunk = [b'x'; 1024];
                            while stream.write_all(&chunk).await.is_ok() {
                                tokio::time::sleep(Duration::from_millis(20)).await;
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for StreamingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Echoes datagrams, prefixed with `marker`.
#[allow(dead_code)]
pub struct UdpEchoBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl UdpEchoBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let marker = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let Ok((n, peer)) = received else { break };
                        let mut reply = marker.clone();
                        reply.extend_from_slice(&buf[..n]);
                        let _ = socket.send_to(&reply, peer).await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for UdpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// TLS server that answers the first read with `marker`.
#[allow(dead_code)]
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;
        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(cert_der.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
            )
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);
        let marker_bytes = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        let acceptor = acceptor.clone();
                        let response = marker_bytes.clone();
                        tokio::spawn(async move {
                            if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                let mut buf = vec![0u8; 1024];
                                if tls_stream.read(&mut buf).await.is_ok() {
                                    let _ = tls_stream.write_all(&response).await;
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[allow(dead_code)]
pub struct GatewayHandle {
    pub store: Arc<ResourceStore>,
    pub runtime: Arc<GatewayRuntime>,
}

#[allow(dead_code)]
impl GatewayHandle {
    /// Start a runtime over `yaml` with a short debounce window.
    pub async fn start(yaml: &str) -> Self {
        init_crypto_provider();
        let store = Arc::new(ResourceStore::new());
        store.replace_all(parse_resources(yaml).unwrap()).unwrap();

        let options = RuntimeOptions {
            debounce: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(500),
            ..RuntimeOptions::default()
        };
        let (runtime, errors) =
            GatewayRuntime::start(Arc::clone(&store), options, Arc::new(NoopObserver)).await;
        assert!(errors.is_empty(), "listeners failed: {:?}", errors);

        Self { store, runtime }
    }

    pub async fn addr(&self, listener: &str) -> SocketAddr {
        self.runtime
            .local_addr(GATEWAY, listener)
            .await
            .unwrap_or_else(|| panic!("listener {} not running", listener))
    }

    /// Publish a new resource set and wait for the runtime to apply it.
    pub async fn publish(&self, yaml: &str) {
        self.store.replace_all(parse_resources(yaml).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

/// Poll `condition` every 20ms until it holds or `limit` passes.
#[allow(dead_code)]
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// =============================================================================
// Clients
// =============================================================================

#[allow(dead_code)]
#[derive(Debug)]
pub struct HttpReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

#[allow(dead_code)]
impl HttpReply {
    pub fn backend(&self) -> Option<&str> {
        self.headers.get("x-backend").and_then(|v| v.to_str().ok())
    }
}

/// One request over a fresh HTTP/1 connection.
#[allow(dead_code)]
pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> io::Result<HttpReply> {
    http_request(addr, Request::get(path).header("host", host)).await
}

#[allow(dead_code)]
pub async fn http_request(addr: SocketAddr, builder: http::request::Builder) -> io::Result<HttpReply> {
    let stream = TcpStream::connect(addr).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(io::Error::other)?;
    tokio::spawn(conn);

    let request = builder
        .body(Empty::<Bytes>::new())
        .map_err(io::Error::other)?;
    let response = tokio::time::timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request timed out"))?
        .map_err(io::Error::other)?;

    let (parts, body) = response.into_parts();
    let body = body.collect().await.map_err(io::Error::other)?.to_bytes();
    Ok(HttpReply {
        status: parts.status,
        headers: parts.headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Write `payload`, read the first reply chunk.
#[allow(dead_code)]
pub async fn tcp_roundtrip(addr: SocketAddr, payload: &[u8]) -> io::Result<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        Ok(buf[..n].to_vec())
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "roundtrip timed out"))?
}
