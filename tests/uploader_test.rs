// End-to-end uploads against a loopback collector over real TCP

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeCollector, OK_REPLY, Reply, form_value, sample_report, split_request, wait_for};
use spotwire::{ReportUploader, RetryPolicy, UploaderConfig, UploaderConfigBuilder};

fn config_for(port: u16) -> UploaderConfig {
    UploaderConfigBuilder::new()
        .server("127.0.0.1")
        .port(port)
        .host_header(Some("wsprnet.org"))
        .reporter_grid("FN31pr")
        .client_version("spotwire 1.0")
        .shutdown_timeout(Duration::from_secs(2))
        .build()
}

#[tokio::test]
async fn test_sample_report_reaches_collector() {
    let collector = FakeCollector::start(Reply::Respond(OK_REPLY)).await;
    let uploader = Arc::new(ReportUploader::with_tcp(config_for(collector.port)));
    let worker = uploader.clone().spawn();

    uploader.submit_report(sample_report("K1ABC"));
    let request = collector.next_request().await;

    let (head, body) = split_request(&request);
    assert!(head.starts_with("POST /post? HTTP/1.1\r\n"));
    assert!(head.contains("\r\nHost: wsprnet.org\r\n"));
    assert_eq!(common::content_length(head), Some(body.len()));

    assert_eq!(form_value(body, "function"), Some("wspr"));
    assert_eq!(form_value(body, "rcall"), Some("W2XYZ"));
    assert_eq!(form_value(body, "rgrid"), Some("FN31pr"));
    assert_eq!(form_value(body, "rqrg"), Some("7.040125"));
    assert_eq!(form_value(body, "tqrg"), Some("7.040100"));
    assert_eq!(form_value(body, "date"), Some("231114"));
    assert_eq!(form_value(body, "time"), Some("2214"));
    assert_eq!(form_value(body, "sig"), Some("-12"));
    assert_eq!(form_value(body, "dt"), Some("0.30"));
    assert_eq!(form_value(body, "drift"), Some("0"));
    assert_eq!(form_value(body, "tcall"), Some("K1ABC"));
    assert_eq!(form_value(body, "tgrid"), Some("FN42"));
    assert_eq!(form_value(body, "dbm"), Some("23"));
    assert_eq!(form_value(body, "version"), Some("spotwire+1.0"));
    assert_eq!(form_value(body, "mode"), Some("2"));

    assert!(wait_for(|| uploader.counters().success_count == 1).await);
    assert_eq!(uploader.counters().error_count, 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reports_arrive_in_submission_order() {
    let collector = FakeCollector::start(Reply::Respond(OK_REPLY)).await;
    let uploader = Arc::new(ReportUploader::with_tcp(config_for(collector.port)));

    // Queue before the worker starts so ordering is down to the worker alone
    for call in ["K1AAA", "K1BBB", "K1CCC"] {
        uploader.submit_report(sample_report(call));
    }
    assert_eq!(uploader.queued(), 3);
    let worker = uploader.clone().spawn();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let request = collector.next_request().await;
        let (_, body) = split_request(&request);
        seen.push(form_value(body, "tcall").unwrap().to_string());
    }
    assert_eq!(seen, ["K1AAA", "K1BBB", "K1CCC"]);

    assert!(wait_for(|| uploader.counters().success_count == 3).await);
    assert_eq!(uploader.queued(), 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_collector_reply_is_awaited() {
    let collector =
        FakeCollector::start(Reply::RespondAfter(Duration::from_millis(1500), OK_REPLY)).await;
    let config = config_for(collector.port);
    assert_eq!(config.retry, RetryPolicy::default());
    let uploader = ReportUploader::with_tcp(config);
    let report = sample_report("K1ABC");

    let (delivered, request) =
        tokio::join!(uploader.deliver(&report), collector.next_request());
    delivered.unwrap();
    assert!(request.contains("&tcall=K1ABC&"));
}

#[tokio::test]
async fn test_collector_hanging_up_counts_an_error() {
    let collector = FakeCollector::start(Reply::HangUp).await;
    let uploader = Arc::new(ReportUploader::with_tcp(config_for(collector.port)));
    let worker = uploader.clone().spawn();

    uploader.submit_report(sample_report("K1ABC"));
    collector.next_request().await;

    assert!(wait_for(|| uploader.counters().error_count == 1).await);
    assert_eq!(uploader.counters().success_count, 0);
    assert_eq!(uploader.queued(), 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_collector_drops_reports() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let uploader = Arc::new(ReportUploader::with_tcp(config_for(port)));
    let worker = uploader.clone().spawn();

    uploader.submit_report(sample_report("K1AAA"));
    uploader.submit_report(sample_report("K1BBB"));

    assert!(wait_for(|| uploader.counters().error_count == 2).await);
    assert_eq!(uploader.counters().success_count, 0);
    assert_eq!(uploader.queued(), 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_report_does_not_block_the_next() {
    let collector = FakeCollector::start(Reply::Respond(OK_REPLY)).await;
    let uploader = Arc::new(ReportUploader::with_tcp(config_for(collector.port)));
    let worker = uploader.clone().spawn();

    // Epoch far outside chrono's range cannot be encoded
    let mut broken = sample_report("K1BAD");
    broken.epoch_time = u64::MAX;
    uploader.submit_report(broken);
    uploader.submit_report(sample_report("K1ABC"));

    let request = collector.next_request().await;
    let (_, body) = split_request(&request);
    assert_eq!(form_value(body, "tcall"), Some("K1ABC"));

    assert!(wait_for(|| uploader.counters().success_count == 1).await);
    assert_eq!(uploader.counters().error_count, 1);
    assert_eq!(collector.captured(), 0);

    worker.shutdown().await.unwrap();
}
