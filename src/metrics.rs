use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Install the Prometheus recorder, zero every metric, then serve `/metrics`
/// on `port`
///
/// Zeroing has to happen after the recorder is installed (earlier values go
/// to the no-op recorder) and before the listener starts, so the first
/// scrape already sees every series. Must be called from inside a tokio
/// runtime.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .context("Failed to build Prometheus exporter")?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow!("A metrics recorder is already installed"))?;

    initialize_metrics();

    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            error!("Metrics exporter stopped: {:?}", e);
        }
    });
    info!("Serving metrics on http://{}/metrics", addr);
    Ok(())
}

/// Initialize tracker and uploader metrics to zero/default values
/// This ensures metrics always appear in Prometheus queries even if no events have occurred
pub fn initialize_metrics() {
    // Activity tracker
    metrics::counter!("spotwire.tracker.events_recorded_total").absolute(0);
    metrics::counter!("spotwire.tracker.events_pruned_total").absolute(0);
    metrics::gauge!("spotwire.tracker.queue_depth").set(0.0);

    // Report uploader
    metrics::counter!("spotwire.uploader.submitted_total").absolute(0);
    metrics::counter!("spotwire.uploader.delivered_total").absolute(0);
    for phase in ["idle", "connecting", "sending", "awaiting_response"] {
        metrics::counter!("spotwire.uploader.failed_total", "phase" => phase).absolute(0);
    }
    metrics::gauge!("spotwire.uploader.queue_depth").set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn scrape(port: u16) -> String {
        for _ in 0..100 {
            if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
                stream
                    .write_all(
                        b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
                    )
                    .await
                    .unwrap();
                let mut response = Vec::new();
                stream.read_to_end(&mut response).await.unwrap();
                return String::from_utf8_lossy(&response).to_string();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("metrics listener never came up on port {port}");
    }

    // Only test in this binary that installs the global recorder
    #[tokio::test]
    async fn test_first_scrape_sees_zeroed_metrics() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        start_metrics_server(port).unwrap();

        let body = scrape(port).await;
        assert!(body.contains("spotwire_uploader_delivered_total"));
        assert!(body.contains("spotwire_tracker_events_recorded_total"));
        assert!(body.contains("spotwire_uploader_failed_total{phase=\"awaiting_response\"}"));
        assert!(body.contains("spotwire_uploader_queue_depth"));
    }
}
