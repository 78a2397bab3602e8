//! Loopback spot collector for integration tests
//!
//! Listens on an ephemeral 127.0.0.1 port, reads each request up to its
//! `Content-Length`, hands the raw text to the test, then replies (now or
//! after a delay) or hangs up without replying.

#![allow(dead_code)]

use std::time::Duration;

use spotwire::Report;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const OK_REPLY: &str = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Respond(&'static str),
    RespondAfter(Duration, &'static str),
    /// Close the connection without a response
    HangUp,
}

pub struct FakeCollector {
    pub port: u16,
    requests: flume::Receiver<String>,
    task: JoinHandle<()>,
}

impl FakeCollector {
    pub async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        let port = listener.local_addr().expect("local addr").port();
        let (tx, requests) = flume::unbounded();

        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(serve_one(socket, reply, tx));
            }
        });

        Self {
            port,
            requests,
            task,
        }
    }

    /// Next captured request, failing the test after five seconds
    pub async fn next_request(&self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv_async())
            .await
            .expect("timed out waiting for a request")
            .expect("collector stopped")
    }

    pub fn captured(&self) -> usize {
        self.requests.len()
    }
}

impl Drop for FakeCollector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(mut socket: TcpStream, reply: Reply, tx: flume::Sender<String>) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    let _ = tx.send(request);

    match reply {
        Reply::Respond(text) => {
            let _ = socket.write_all(text.as_bytes()).await;
        }
        Reply::RespondAfter(delay, text) => {
            tokio::time::sleep(delay).await;
            let _ = socket.write_all(text.as_bytes()).await;
        }
        Reply::HangUp => return,
    }

    // Hold the connection until the client closes it
    let mut sink = [0u8; 256];
    while let Ok(n) = socket.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        if let Some(head_end) = find_head_end(&data) {
            let head = String::from_utf8_lossy(&data[..head_end]).to_string();
            let body_len = content_length(&head).unwrap_or(0);
            if data.len() >= head_end + body_len {
                return String::from_utf8(data).ok();
            }
        }
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

pub fn content_length(head: &str) -> Option<usize> {
    head.lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .and_then(|value| value.trim().parse().ok())
}

/// Split a captured request into head (including the blank line) and body
pub fn split_request(request: &str) -> (&str, &str) {
    let head_end = request.find("\r\n\r\n").expect("request has a header block") + 4;
    request.split_at(head_end)
}

/// Value of `key` in a form-encoded body
pub fn form_value<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// 40m WSPR decode at 2023-11-14 22:14:00 UTC
pub fn sample_report(callsign: &str) -> Report {
    Report {
        callsign: callsign.to_string(),
        reporter_callsign: "W2XYZ".to_string(),
        locator: "FN42".to_string(),
        freq: 7_040_100,
        recv_freq: 7_040_125,
        snr: -12,
        dt: 0.3,
        drift: 0,
        dbm: 23,
        mode: "WSPR".to_string(),
        epoch_time: 1_700_000_040,
    }
}

/// Poll `condition` every 10 ms for up to five seconds
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
