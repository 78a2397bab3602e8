use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::protocol::{ProtocolError, SpotRequest, StationInfo};
use crate::report::Report;
use crate::transport::{Connection, TcpTransport, Transport};
use crate::worker::WorkerHandle;

/// Retry limits for one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Whole-message send attempts before the report is abandoned
    pub send_attempts: u32,
    /// Pause between partial writes and between send attempts
    pub write_retry_delay: Duration,
    /// Reads attempted while waiting for a response
    pub read_attempts: u32,
    /// Pause between read attempts
    pub read_retry_delay: Duration,
    /// Size of the response read buffer
    pub read_buffer_size: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            send_attempts: 3,
            write_retry_delay: Duration::from_millis(100),
            read_attempts: 4,
            read_retry_delay: Duration::from_millis(333),
            read_buffer_size: 8192,
        }
    }
}

/// Configuration for the report uploader
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Spot collector hostname
    pub server: String,
    /// Spot collector port
    pub port: u16,
    /// `Host` header value (defaults to the server name)
    pub host_header: Option<String>,
    /// Receiving station grid locator
    pub reporter_grid: String,
    /// Client identifier sent with every spot
    pub client_version: String,
    pub retry: RetryPolicy,
    /// How often delivery counters are logged
    pub stats_interval: Duration,
    /// How long shutdown waits for an in-flight delivery
    pub shutdown_timeout: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            server: "wsprnet.org".to_string(),
            port: 80,
            host_header: None,
            reporter_grid: "AA00".to_string(),
            client_version: crate::default_client_version(),
            retry: RetryPolicy::default(),
            stats_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl UploaderConfig {
    pub fn station_info(&self) -> StationInfo {
        StationInfo {
            reporter_grid: self.reporter_grid.clone(),
            host_header: self
                .host_header
                .clone()
                .unwrap_or_else(|| self.server.clone()),
            client_version: self.client_version.clone(),
        }
    }
}

/// Where a delivery attempt was when it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    Idle,
    Connecting,
    Connected,
    Sending,
    AwaitingResponse,
    Closed,
}

impl std::fmt::Display for DeliveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryPhase::Idle => write!(f, "idle"),
            DeliveryPhase::Connecting => write!(f, "connecting"),
            DeliveryPhase::Connected => write!(f, "connected"),
            DeliveryPhase::Sending => write!(f, "sending"),
            DeliveryPhase::AwaitingResponse => write!(f, "awaiting_response"),
            DeliveryPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Why a report was dropped
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to encode report: {0}")]
    Encode(#[from] ProtocolError),
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),
    #[error("send failed after {sent} of {total} bytes: {source}")]
    SendFailed {
        sent: usize,
        total: usize,
        #[source]
        source: io::Error,
    },
    #[error("send stalled after {attempts} attempts ({sent} of {total} bytes written)")]
    SendExhausted {
        attempts: u32,
        sent: usize,
        total: usize,
    },
    #[error("no response after {attempts} read attempts")]
    NoResponse { attempts: u32 },
}

impl DeliveryError {
    pub fn phase(&self) -> DeliveryPhase {
        match self {
            DeliveryError::Encode(_) => DeliveryPhase::Idle,
            DeliveryError::Connect(_) => DeliveryPhase::Connecting,
            DeliveryError::SendFailed { .. } | DeliveryError::SendExhausted { .. } => {
                DeliveryPhase::Sending
            }
            DeliveryError::NoResponse { .. } => DeliveryPhase::AwaitingResponse,
        }
    }
}

/// Point-in-time copy of the delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub success_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    success: AtomicU64,
    errors: AtomicU64,
}

/// Uploads decode reports to a spot collector, one connection per report
///
/// Reports are queued by [`submit_report`](Self::submit_report) and sent in
/// submission order by a single worker task started with
/// [`spawn`](Self::spawn). A report whose delivery fails is dropped and
/// counted; it is never requeued.
pub struct ReportUploader {
    config: UploaderConfig,
    station: StationInfo,
    transport: Arc<dyn Transport>,
    reports_tx: flume::Sender<Report>,
    reports_rx: flume::Receiver<Report>,
    counters: DeliveryCounters,
}

impl ReportUploader {
    pub fn new(config: UploaderConfig, transport: Arc<dyn Transport>) -> Self {
        let (reports_tx, reports_rx) = flume::unbounded();
        let station = config.station_info();

        Self {
            config,
            station,
            transport,
            reports_tx,
            reports_rx,
            counters: DeliveryCounters::default(),
        }
    }

    /// Uploader talking TCP to the configured server and port
    pub fn with_tcp(config: UploaderConfig) -> Self {
        let transport = Arc::new(TcpTransport::new(config.server.clone(), config.port));
        Self::new(config, transport)
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Queue a report for upload. Never blocks.
    pub fn submit_report(&self, report: Report) {
        // The uploader holds its own receiver, so the channel never disconnects
        let _ = self.reports_tx.send(report);
        metrics::counter!("spotwire.uploader.submitted_total").increment(1);
    }

    /// Reports waiting to be sent
    pub fn queued(&self) -> usize {
        self.reports_rx.len()
    }

    pub fn counters(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            success_count: self.counters.success.load(Ordering::Relaxed),
            error_count: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Start the upload worker
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        info!(
            "Starting report uploader for {} (grid {})",
            self.transport.endpoint(),
            self.station.reporter_grid
        );
        let shutdown_timeout = self.config.shutdown_timeout;
        WorkerHandle::spawn("Report uploader", shutdown_timeout, move |cancel| async move {
            let period = self.config.stats_interval.max(Duration::from_millis(1));
            let mut stats_interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = stats_interval.tick() => self.log_stats(),
                    received = self.reports_rx.recv_async() => match received {
                        Ok(report) => self.deliver_and_count(report).await,
                        Err(_) => break,
                    },
                }
            }

            let unsent = self.queued();
            if unsent > 0 {
                warn!("Report uploader stopped with {} reports unsent", unsent);
            }
            self.log_stats();
        })
    }

    async fn deliver_and_count(&self, report: Report) {
        match self.deliver(&report).await {
            Ok(()) => {
                self.counters.success.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("spotwire.uploader.delivered_total").increment(1);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("spotwire.uploader.failed_total", "phase" => e.phase().to_string())
                    .increment(1);
                error!(
                    "Failed to send spot of {} to {} while {}: {}",
                    report.callsign,
                    self.transport.endpoint(),
                    e.phase(),
                    e
                );
            }
        }
        metrics::gauge!("spotwire.uploader.queue_depth").set(self.queued() as f64);
    }

    /// One connect, send, receive, close cycle for a single report
    ///
    /// The connection is shut down on every path once it has been opened.
    #[tracing::instrument(skip(self, report), fields(tcall = %report.callsign, rcall = %report.reporter_callsign))]
    pub async fn deliver(&self, report: &Report) -> Result<(), DeliveryError> {
        let request = SpotRequest::build(report, &self.station)?;
        debug!("Spot request content length: {}", request.content_length());

        trace!(phase = %DeliveryPhase::Connecting);
        let mut conn = self
            .transport
            .connect()
            .await
            .map_err(DeliveryError::Connect)?;
        debug!("Connection to {} established", self.transport.endpoint());
        trace!(phase = %DeliveryPhase::Connected);

        let result = exchange(conn.as_mut(), request.as_bytes(), &self.config.retry).await;

        if let Err(e) = conn.shutdown().await {
            warn!("Error closing connection: {}", e);
        }
        trace!(phase = %DeliveryPhase::Closed);

        let response = result?;
        debug!(
            "Collector response ({} bytes): {}",
            response.len(),
            String::from_utf8_lossy(&response)
        );
        Ok(())
    }

    fn log_stats(&self) {
        let snapshot = self.counters();
        info!(
            "Spot uploads: {} succeeded, {} failed, {} queued",
            snapshot.success_count,
            snapshot.error_count,
            self.queued()
        );
    }
}

async fn exchange(
    conn: &mut dyn Connection,
    message: &[u8],
    policy: &RetryPolicy,
) -> Result<Vec<u8>, DeliveryError> {
    trace!(phase = %DeliveryPhase::Sending);
    send_with_retry(conn, message, policy).await?;
    trace!(phase = %DeliveryPhase::AwaitingResponse);
    read_response(conn, policy).await
}

enum AttemptError {
    /// The peer stopped accepting bytes; worth another attempt
    Stalled(Option<io::Error>),
    /// The stream is broken
    Fatal(io::Error),
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

/// Write `message` in up to `policy.send_attempts` attempts
///
/// Each attempt resumes where the previous one stopped. A hard I/O error
/// abandons the send immediately.
async fn send_with_retry(
    conn: &mut dyn Connection,
    message: &[u8],
    policy: &RetryPolicy,
) -> Result<(), DeliveryError> {
    let total = message.len();
    let attempts = policy.send_attempts.max(1);
    let mut sent = 0usize;

    for attempt in 1..=attempts {
        debug!(
            "Send attempt {}/{}: {} of {} bytes remaining",
            attempt,
            attempts,
            total - sent,
            total
        );
        match write_attempt(conn, message, &mut sent, policy.write_retry_delay).await {
            Ok(()) => {
                debug!("Sent {} bytes", total);
                return Ok(());
            }
            Err(AttemptError::Stalled(cause)) => {
                match cause {
                    Some(e) => debug!("Send attempt {} stalled at {} bytes: {}", attempt, sent, e),
                    None => debug!("Send attempt {} stalled at {} bytes", attempt, sent),
                }
                if attempt < attempts {
                    tokio::time::sleep(policy.write_retry_delay).await;
                }
            }
            Err(AttemptError::Fatal(source)) => {
                return Err(DeliveryError::SendFailed {
                    sent,
                    total,
                    source,
                });
            }
        }
    }

    Err(DeliveryError::SendExhausted {
        attempts,
        sent,
        total,
    })
}

async fn write_attempt(
    conn: &mut dyn Connection,
    message: &[u8],
    sent: &mut usize,
    partial_delay: Duration,
) -> Result<(), AttemptError> {
    while *sent < message.len() {
        match conn.write(&message[*sent..]).await {
            Ok(0) => return Err(AttemptError::Stalled(None)),
            Ok(n) => {
                *sent += n;
                trace!("write() accepted {} bytes ({} total)", n, *sent);
                if *sent < message.len() {
                    tokio::time::sleep(partial_delay).await;
                }
            }
            Err(e) if is_transient(&e) => return Err(AttemptError::Stalled(Some(e))),
            Err(e) => return Err(AttemptError::Fatal(e)),
        }
    }
    Ok(())
}

/// Wait for the collector's response
///
/// Each attempt blocks until the collector sends something or closes the
/// stream. Only the bytes each read reports are kept. A read error counts as
/// an empty attempt and is retried after `read_retry_delay`; the collector
/// closing the stream ends the wait.
async fn read_response(
    conn: &mut dyn Connection,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, DeliveryError> {
    let attempts = policy.read_attempts.max(1);
    let mut buf = vec![0u8; policy.read_buffer_size.max(1)];

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.read_retry_delay).await;
        }
        match conn.read(&mut buf).await {
            Ok(0) => {
                debug!(
                    "Read attempt {}/{}: connection closed without a response",
                    attempt, attempts
                );
                return Err(DeliveryError::NoResponse { attempts: attempt });
            }
            Ok(n) => {
                debug!("Read attempt {}/{}: {} bytes", attempt, attempts, n);
                return Ok(buf[..n].to_vec());
            }
            Err(e) => debug!("Read attempt {}/{} failed: {}", attempt, attempts, e),
        }
    }

    Err(DeliveryError::NoResponse { attempts })
}

/// Builder pattern for creating uploader configurations
pub struct UploaderConfigBuilder {
    config: UploaderConfig,
}

impl UploaderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: UploaderConfig::default(),
        }
    }

    pub fn server<S: Into<String>>(mut self, server: S) -> Self {
        self.config.server = server.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn host_header<S: Into<String>>(mut self, host_header: Option<S>) -> Self {
        self.config.host_header = host_header.map(|h| h.into());
        self
    }

    pub fn reporter_grid<S: Into<String>>(mut self, grid: S) -> Self {
        self.config.reporter_grid = grid.into();
        self
    }

    pub fn client_version<S: Into<String>>(mut self, version: S) -> Self {
        self.config.client_version = version.into();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> UploaderConfig {
        self.config
    }
}

impl Default for UploaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
