//! Connection management.
//!
//! The relay serves exactly one request per TCP connection, so a
//! [`Connection`] is opened, used for a single exchange and closed.

use crate::error::ClientError;
use msgrelay_protocol::{Decoder, Encoder, Request, Response, CHUNK_SIZE, DEFAULT_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout for sending the request and receiving the full response.
    pub request_timeout: Duration,
    /// Extra attempts for read-only requests that failed in transit.
    pub max_retries: u32,
    /// Pause before the first retry; doubled for each further one.
    pub retry_backoff: Duration,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT))
    }
}

/// A single-use connection to a relay server.
pub struct Connection<S = TcpStream> {
    stream: S,
    request_timeout: Duration,
}

impl Connection<TcpStream> {
    /// Connects to the server.
    pub async fn open(config: &ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::debug!("Connection failed: {}", e);
                ClientError::Io(e)
            })?;

        stream.set_nodelay(true).ok();
        Ok(Self::with_stream(stream, config.request_timeout))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already established stream.
    pub fn with_stream(stream: S, request_timeout: Duration) -> Self {
        Self {
            stream,
            request_timeout,
        }
    }

    /// Sends `request` and waits for the complete response, consuming the
    /// connection.
    pub async fn exchange(mut self, request: &Request) -> Result<Response, ClientError> {
        let encoded = Encoder::encode_request(request)?;
        let timeout = self.request_timeout;

        tokio::time::timeout(timeout, self.send_and_receive(&encoded))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn send_and_receive(&mut self, encoded: &[u8]) -> Result<Response, ClientError> {
        tracing::debug!("Sending request ({} bytes)", encoded.len());
        self.stream.write_all(encoded).await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    /// Reads chunks until a full response has been decoded. Trailing chunk
    /// padding is ignored.
    async fn read_response(&mut self) -> Result<Response, ClientError> {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; CHUNK_SIZE];

        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);

            if let Some((header, response)) = decoder.decode_response()? {
                tracing::debug!(
                    "Received response {} ({} payload bytes)",
                    header.code,
                    header.payload_size
                );
                return Ok(response);
            }
        }
    }
}
