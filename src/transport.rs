// Stream transport used by the report uploader
//
// The uploader only needs connect / write / read / shutdown on a byte
// stream. Keeping that behind a trait lets tests script partial writes,
// stalls and refused connections without a real collector.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// A source of fresh connections to the spot collector
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection. Called once per report.
    async fn connect(&self) -> io::Result<Box<dyn Connection>>;

    /// Human-readable remote endpoint for logs
    fn endpoint(&self) -> String;
}

/// One open byte stream
#[async_trait]
pub trait Connection: Send {
    /// Write some prefix of `buf`, returning how many bytes were accepted
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Wait for the next bytes from the peer and read them into `buf`
    ///
    /// `Ok(0)` means the peer closed the stream. There is no timeout beyond
    /// whatever the OS applies to the socket.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the stream
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Plain TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
}

impl TcpTransport {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> io::Result<Box<dyn Connection>> {
        let server_address = format!("{}:{}", self.host, self.port);
        let all_addrs: Vec<_> = tokio::net::lookup_host(&server_address).await?.collect();
        if all_addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("DNS resolution returned no addresses for {server_address}"),
            ));
        }

        // Prefer IPv4, fall back to whatever resolved
        let (mut addrs, v6): (Vec<_>, Vec<_>) = all_addrs.into_iter().partition(|a| a.is_ipv4());
        if addrs.is_empty() {
            warn!(
                "No IPv4 addresses found for {}, falling back to IPv6",
                server_address
            );
        }
        addrs.extend(v6);

        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!("Connected to spot collector at {}", addr);
                    return Ok(Box::new(TcpConnection { stream }));
                }
                Err(e) => {
                    debug!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no address of {server_address} accepted a connection"),
            )
        }))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct TcpConnection {
    stream: TcpStream,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
