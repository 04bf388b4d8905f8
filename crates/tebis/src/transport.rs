//! Socket transport
//!
//! Every request opens its own TCP connection, writes the Latin-1 request,
//! reads a 16-byte status header and then exactly `size` payload bytes.
//!
//! Header format: `"<version> <error> <size>"`, ASCII, space separated,
//! NUL padded to 16 bytes. A non-zero `error` means the payload must not be
//! decoded.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use crate::config::ClientConfig;
use crate::request::{Request, encode_latin1};

pub const DEFAULT_PORT: u16 = 4712;
pub const HEADER_LEN: usize = 16;

const READ_CHUNK: usize = 4096;
/// Payload bytes reserved up front; larger payloads grow as they arrive.
const INITIAL_CAPACITY: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection broken: {0}")]
    ConnectionBroken(&'static str),
    #[error("Server reported error code {code}")]
    Server { code: i64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed response header: {0:?}")]
    MalformedHeader(String),
    #[error("Request is not Latin-1: {ch:?} at offset {offset}")]
    Encoding { ch: char, offset: usize },
    #[error("No server host configured")]
    NotConfigured,
}

/// Anything that can carry one request/response exchange.
pub trait Transport {
    fn send_request(&self, request: &str) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send_request(&self, request: &str) -> Result<Vec<u8>, TransportError> {
        (**self).send_request(request)
    }
}

/// Send `request`; data requests get one resend after a server error.
pub fn send<T: Transport + ?Sized>(
    transport: &T,
    request: &Request,
) -> Result<Vec<u8>, TransportError> {
    let text = request.to_string();
    if request.is_data() {
        send_with_retry(transport, &text)
    } else {
        transport.send_request(&text)
    }
}

/// Send a request, resending it once if the server reports an error.
pub fn send_with_retry<T: Transport + ?Sized>(
    transport: &T,
    request: &str,
) -> Result<Vec<u8>, TransportError> {
    match transport.send_request(request) {
        Err(TransportError::Server { code }) => {
            log::warn!("Server error {code}, resending request once");
            transport.send_request(request)
        }
        other => other,
    }
}

// ============ Frame header ============

/// The 16-byte status header preceding every response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: i32,
    pub error: i64,
    pub size: usize,
}

impl FrameHeader {
    pub fn ok(size: usize) -> Self {
        Self {
            version: 1,
            error: 0,
            size,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, TransportError> {
        let malformed = || TransportError::MalformedHeader(String::from_utf8_lossy(bytes).into_owned());
        let end = bytes
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        let text = std::str::from_utf8(&bytes[..end]).map_err(|_| malformed())?;
        let mut fields = text.split(' ').filter(|f| !f.is_empty());
        let mut next = || fields.next().ok_or_else(malformed);

        let version = next()?.parse().map_err(|_| malformed())?;
        let error = next()?.parse().map_err(|_| malformed())?;
        let size = next()?.parse().map_err(|_| malformed())?;
        Ok(Self {
            version,
            error,
            size,
        })
    }

    /// NUL-padded wire form; fails if the fields do not fit in 16 bytes.
    pub fn encode(&self) -> Result<[u8; HEADER_LEN], TransportError> {
        let text = format!("{} {} {}", self.version, self.error, self.size);
        if text.len() > HEADER_LEN {
            return Err(TransportError::MalformedHeader(text));
        }
        let mut out = [0u8; HEADER_LEN];
        out[..text.len()].copy_from_slice(text.as_bytes());
        Ok(out)
    }
}

// ============ TCP ============

/// Connection settings; no socket is held between requests.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    host: Option<String>,
    port: u16,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
            ..Self::default()
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: config.read_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn connect(&self) -> Result<Connection, TransportError> {
        let host = self.host.as_deref().ok_or(TransportError::NotConfigured)?;
        let stream = match self.connect_timeout {
            None => TcpStream::connect((host, self.port))?,
            Some(timeout) => {
                let mut last_err = None;
                let mut stream = None;
                for addr in (host, self.port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                match (stream, last_err) {
                    (Some(s), _) => s,
                    (None, Some(e)) => return Err(e.into()),
                    (None, None) => {
                        return Err(std::io::Error::new(
                            ErrorKind::AddrNotAvailable,
                            format!("{host} did not resolve"),
                        )
                        .into());
                    }
                }
            }
        };
        stream.set_read_timeout(self.read_timeout)?;
        stream.set_write_timeout(self.read_timeout)?;
        log::debug!("Connected to Tebis server {host}:{}", self.port);
        Ok(Connection { stream })
    }
}

impl Transport for TcpTransport {
    fn send_request(&self, request: &str) -> Result<Vec<u8>, TransportError> {
        let bytes = encode_latin1(request)?;
        let mut conn = self.connect()?;
        conn.write_all(&bytes)?;

        let mut header = [0u8; HEADER_LEN];
        conn.read_full(&mut header)?;
        let header = FrameHeader::parse(&header)?;
        if header.error != 0 {
            return Err(TransportError::Server { code: header.error });
        }

        // the announced size is only trusted as far as bytes actually arrive
        let mut payload = Vec::with_capacity(header.size.min(INITIAL_CAPACITY));
        let mut chunk = [0u8; READ_CHUNK];
        while payload.len() < header.size {
            let want = (header.size - payload.len()).min(READ_CHUNK);
            let n = conn.read_some(&mut chunk[..want])?;
            payload.extend_from_slice(&chunk[..n]);
        }
        log::debug!("Received {} payload bytes", payload.len());
        Ok(payload)
    }
}

/// Open stream; the write half is shut down when it goes out of scope.
struct Connection {
    stream: TcpStream,
}

impl Connection {
    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(TransportError::ConnectionBroken("write returned zero bytes")),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(TransportError::ConnectionBroken("peer closed the connection")),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_some(&mut buf[filled..])?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            log::debug!("Socket shutdown failed: {e}");
        }
    }
}
