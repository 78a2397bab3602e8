use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use spotwire::config::{MonitorSection, SpotwireConfig};
use spotwire::{ActivityTracker, Report, ReportUploader};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// One line of `run` input
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum InputRecord {
    /// A decode attributed to `source_id`; `timestamp_ms` defaults to now
    Event {
        source_id: usize,
        #[serde(default)]
        timestamp_ms: Option<u64>,
    },
    Report(Report),
}

fn parse_record(line: &str) -> Result<Option<InputRecord>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let record = serde_json::from_str(line).context("Invalid input record")?;
    Ok(Some(record))
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(err), _) | (_, Err(err)) => {
                error!("Failed to register signal handlers: {}", err);
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT (Ctrl+C), shutting down..."),
            Err(err) => {
                error!("Failed to listen for SIGINT signal: {}", err);
                std::future::pending::<()>().await
            }
        }
    }
}

fn log_activity(tracker: &ActivityTracker, window_seconds: u32) {
    let counts = tracker.counts(window_seconds);
    let total: usize = counts.iter().sum();
    info!(
        "Activity over last {}s: {} decodes across {} sources {:?}",
        window_seconds,
        total,
        counts.len(),
        counts
    );
}

/// Wait for queued reports to be delivered, bounded by `timeout`
async fn drain_uploader(uploader: &ReportUploader, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while uploader.queued() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "Giving up on {} undelivered reports after {:?}",
                uploader.queued(),
                timeout
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// How the input loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputEnd {
    Eof,
    Interrupted,
}

/// Feed input records to the tracker and uploader until EOF, a read error or
/// `signal` resolves
async fn pump_input<R, S>(
    input: R,
    signal: S,
    tracker: &ActivityTracker,
    uploader: &ReportUploader,
    monitor: &MonitorSection,
) -> Result<InputEnd>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut summary = tokio::time::interval(Duration::from_secs(monitor.interval_seconds.max(1)));
    summary.tick().await;
    tokio::pin!(signal);

    let mut line_number: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut signal => return Ok(InputEnd::Interrupted),
            _ = summary.tick() => log_activity(tracker, monitor.window_seconds),
            line = lines.next_line() => {
                let Some(line) = line
                    .with_context(|| format!("Failed to read input after line {}", line_number))?
                else {
                    info!("End of input after {} lines", line_number);
                    return Ok(InputEnd::Eof);
                };
                line_number += 1;
                match parse_record(&line) {
                    Ok(Some(InputRecord::Event { source_id, timestamp_ms })) => {
                        let timestamp_ms = timestamp_ms.unwrap_or_else(spotwire::activity_tracker::now_ms);
                        if let Err(e) = tracker.record_event(source_id, timestamp_ms) {
                            warn!("Line {}: {}", line_number, e);
                        }
                    }
                    Ok(Some(InputRecord::Report(report))) => {
                        debug!("Line {}: queueing report from {}", line_number, report.callsign);
                        uploader.submit_report(report);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Line {}: {:#}", line_number, e),
                }
            }
        }
    }
}

/// Start both workers, process `input`, then shut the workers down whatever
/// way the input ended
async fn run_pipeline<R, S>(config: &SpotwireConfig, input: R, signal: S) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let tracker = Arc::new(ActivityTracker::new(config.tracker.clone()));
    let tracker_worker = tracker.clone().spawn();

    let uploader_config = config.uploader.to_uploader_config();
    let drain_timeout = uploader_config.shutdown_timeout;
    info!(
        "Uploading reports to {}:{} as grid {}",
        uploader_config.server, uploader_config.port, uploader_config.reporter_grid
    );
    let uploader = Arc::new(ReportUploader::with_tcp(uploader_config));
    let uploader_worker = uploader.clone().spawn();

    let outcome = pump_input(input, signal, &tracker, &uploader, &config.monitor).await;
    match &outcome {
        Ok(InputEnd::Eof) => drain_uploader(&uploader, drain_timeout).await,
        Ok(InputEnd::Interrupted) => {}
        Err(e) => error!("Stopping on input error: {:#}", e),
    }

    // Give the tracker a final pass so the summary covers everything read
    tracker.drain_and_prune();
    log_activity(&tracker, config.monitor.window_seconds);

    let delivery = uploader.counters();
    info!(
        "Delivered {} reports, {} failed",
        delivery.success_count, delivery.error_count
    );

    let uploader_stopped = uploader_worker.shutdown().await;
    let tracker_stopped = tracker_worker.shutdown().await;
    outcome?;
    uploader_stopped?;
    tracker_stopped?;
    info!("Shutdown complete");
    Ok(())
}

pub async fn handle_run(config: SpotwireConfig) -> Result<()> {
    if let Some(port) = config.metrics_port {
        spotwire::metrics::start_metrics_server(port)?;
    }

    let input = BufReader::new(tokio::io::stdin());
    run_pipeline(&config, input, shutdown_signal()).await
}
