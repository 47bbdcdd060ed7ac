//! SNI extraction from a TLS ClientHello.
//!
//! Passthrough and SNI-routed listeners peek at the first TLS record before
//! choosing a backend. Bytes read while sniffing are kept in the caller's
//! buffer and must be replayed to the upstream.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

/// Default time allowed for the ClientHello to arrive.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(200);

/// Default cap on sniffed bytes.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Hostname, lowercased with any trailing dot removed.
    Found(String),
    /// A ClientHello without a server_name extension.
    NoSni,
    NotTls,
    Timeout,
    IoError(String),
    Malformed,
}

impl SniResult {
    pub fn hostname(&self) -> Option<&str> {
        match self {
            SniResult::Found(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SniInspector {
    timeout: Duration,
    max_bytes: usize,
}

impl Default for SniInspector {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

impl SniInspector {
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        Self { timeout, max_bytes }
    }

    /// Read the first TLS record into `buffer` and parse it.
    ///
    /// On timeout `buffer` still holds whatever arrived so the connection can
    /// be handed on or dropped by the caller.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> SniResult {
        buffer.clear();
        match timeout(self.timeout, self.read_record(stream, buffer)).await {
            Ok(Ok(())) => parse_client_hello(buffer),
            Ok(Err(e)) => SniResult::IoError(e.to_string()),
            Err(_) => {
                debug!(bytes = buffer.len(), "SNI sniff timed out");
                SniResult::Timeout
            }
        }
    }

    async fn read_record<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<()> {
        let mut chunk = [0u8; 1024];
        loop {
            let wanted = match buffer.get(..5) {
                Some(header) if header[0] != RECORD_HANDSHAKE => return Ok(()),
                Some(header) => 5 + usize::from(u16::from_be_bytes([header[3], header[4]])),
                None => 5,
            };
            let wanted = wanted.min(self.max_bytes);
            if buffer.len() >= wanted {
                return Ok(());
            }

            let limit = (wanted - buffer.len()).min(chunk.len());
            let n = stream.read(&mut chunk[..limit]).await?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Bounds-checked big-endian reader.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn u8(&mut self) -> Option<u8> {
        let (first, rest) = self.data.split_first()?;
        self.data = rest;
        Some(*first)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.take(3)?;
        Some(usize::from(bytes[0]) << 16 | usize::from(bytes[1]) << 8 | usize::from(bytes[2]))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Some(head)
    }

    /// Take up to `len` bytes, tolerating a record cut short by the sniff cap.
    fn take_partial(&mut self, len: usize) -> &'a [u8] {
        let len = len.min(self.data.len());
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        head
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse a TLS record holding a ClientHello and return its server name.
pub fn parse_client_hello(record: &[u8]) -> SniResult {
    match record.first() {
        None => return SniResult::Malformed,
        Some(&RECORD_HANDSHAKE) => {}
        Some(_) => return SniResult::NotTls,
    }
    let mut cursor = Cursor::new(record);
    let header = cursor.take(5).and_then(|_| cursor.u8());
    match header {
        None => SniResult::Malformed,
        Some(HANDSHAKE_CLIENT_HELLO) => {
            let Some(len) = cursor.u24() else {
                return SniResult::Malformed;
            };
            let body = cursor.take_partial(len);
            parse_hello_body(body).unwrap_or(SniResult::Malformed)
        }
        Some(_) => SniResult::NotTls,
    }
}

fn parse_hello_body(body: &[u8]) -> Option<SniResult> {
    let mut hello = Cursor::new(body);
    // legacy_version + random
    hello.take(2 + 32)?;
    let session_id = usize::from(hello.u8()?);
    hello.take(session_id)?;
    let cipher_suites = usize::from(hello.u16()?);
    hello.take(cipher_suites)?;
    let compression = usize::from(hello.u8()?);
    hello.take(compression)?;

    if hello.is_empty() {
        return Some(SniResult::NoSni);
    }
    let extensions_len = usize::from(hello.u16()?);
    let mut extensions = Cursor::new(hello.take_partial(extensions_len));

    while let (Some(kind), Some(len)) = (extensions.u16(), extensions.u16()) {
        let data = extensions.take(usize::from(len))?;
        if kind == EXTENSION_SERVER_NAME {
            return parse_server_name(data);
        }
    }
    Some(SniResult::NoSni)
}

fn parse_server_name(data: &[u8]) -> Option<SniResult> {
    let mut ext = Cursor::new(data);
    let list_len = usize::from(ext.u16()?);
    let mut list = Cursor::new(ext.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let len = usize::from(list.u16()?);
        let name = list.take(len)?;
        if name_type == NAME_TYPE_HOST {
            let host = std::str::from_utf8(name).ok()?;
            return Some(SniResult::Found(
                host.trim_end_matches('.').to_ascii_lowercase(),
            ));
        }
    }
    Some(SniResult::NoSni)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// A real ClientHello produced by rustls.
    fn client_hello(server_name: &str) -> Vec<u8> {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string()).unwrap();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
        let mut out = Vec::new();
        conn.write_tls(&mut out).unwrap();
        out
    }

    #[test]
    fn test_parse_real_client_hello() {
        let hello = client_hello("API.Example.com");
        assert_eq!(
            parse_client_hello(&hello),
            SniResult::Found("api.example.com".to_string())
        );
    }

    #[test]
    fn test_ip_address_has_no_sni() {
        // rustls omits server_name for IP literals
        let hello = client_hello("127.0.0.1");
        assert_eq!(parse_client_hello(&hello), SniResult::NoSni);
    }

    #[test]
    fn test_not_tls_and_malformed() {
        assert_eq!(
            parse_client_hello(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            SniResult::NotTls
        );
        assert_eq!(parse_client_hello(&[0x16, 0x03, 0x01]), SniResult::Malformed);
        assert_eq!(parse_client_hello(&[]), SniResult::Malformed);

        let mut truncated = client_hello("example.com");
        truncated.truncate(60);
        assert_eq!(parse_client_hello(&truncated), SniResult::Malformed);
    }

    #[tokio::test]
    async fn test_inspect_keeps_sniffed_bytes() {
        let hello = client_hello("example.com");
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, &hello)
            .await
            .unwrap();

        let mut buffer = Vec::new();
        let result = SniInspector::default().inspect(&mut server, &mut buffer).await;

        assert_eq!(result.hostname(), Some("example.com"));
        assert_eq!(buffer, hello);
    }

    #[tokio::test]
    async fn test_inspect_times_out_on_silence() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let inspector = SniInspector::new(Duration::from_millis(20), DEFAULT_MAX_SNIFF_BYTES);
        let mut buffer = Vec::new();
        assert_eq!(inspector.inspect(&mut server, &mut buffer).await, SniResult::Timeout);
    }
}
