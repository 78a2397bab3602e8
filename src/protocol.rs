// Spot collector request codec
//
// Each report becomes one form POST. The collector parses the body by key
// and is strict about the formatting of each value, so field order and
// precision here are part of the wire contract.

use chrono::{DateTime, Utc};

use crate::report::Report;

/// Request line sent ahead of the headers
pub const REQUEST_LINE: &str = "POST /post? HTTP/1.1";

/// Mode code the collector expects for these spots
const MODE_CODE: &str = "2";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("epoch time {0} cannot be represented as a UTC date")]
    InvalidTimestamp(u64),
}

/// Station-level values that are the same for every report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationInfo {
    /// Receiving station grid locator (`rgrid`)
    pub reporter_grid: String,
    /// Value of the `Host` header
    pub host_header: String,
    /// Client identifier (`version`)
    pub client_version: String,
}

/// A fully rendered request ready to be written to the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotRequest {
    text: String,
    body_start: usize,
}

impl SpotRequest {
    /// Render `report` into request line, headers, blank line and body
    pub fn build(report: &Report, station: &StationInfo) -> Result<Self, ProtocolError> {
        let body = encode_body(report, station)?;

        // Content-Length is the byte length of the finished body
        let mut text = String::with_capacity(256 + body.len());
        text.push_str(REQUEST_LINE);
        text.push_str("\r\n");
        text.push_str("Connection: Keep-Alive\r\n");
        text.push_str(&format!("Host: {}\r\n", station.host_header));
        text.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
        text.push_str(&format!("Content-Length: {}\r\n", body.len()));
        text.push_str("Accept-Language: en-US,*\r\n");
        text.push_str("User-Agent: Mozilla/5.0\r\n");
        text.push_str("\r\n");
        let body_start = text.len();
        text.push_str(&body);

        Ok(Self { text, body_start })
    }

    pub fn body(&self) -> &str {
        &self.text[self.body_start..]
    }

    /// Request line and headers, including the terminating blank line
    pub fn head(&self) -> &str {
        &self.text[..self.body_start]
    }

    pub fn content_length(&self) -> usize {
        self.text.len() - self.body_start
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for SpotRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

fn encode_body(report: &Report, station: &StationInfo) -> Result<String, ProtocolError> {
    let decoded_at = i64::try_from(report.epoch_time)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or(ProtocolError::InvalidTimestamp(report.epoch_time))?;

    let body = form_urlencoded::Serializer::new(String::new())
        .append_pair("function", "wspr")
        .append_pair("rcall", &report.reporter_callsign)
        .append_pair("rgrid", &station.reporter_grid)
        .append_pair("rqrg", &format_mhz(report.recv_freq))
        .append_pair("date", &decoded_at.format("%y%m%d").to_string())
        .append_pair("time", &decoded_at.format("%H%M").to_string())
        .append_pair("sig", &report.snr.to_string())
        .append_pair("dt", &format!("{:.2}", report.dt))
        .append_pair("drift", &report.drift.to_string())
        .append_pair("tcall", &report.callsign)
        .append_pair("tgrid", &report.locator)
        .append_pair("tqrg", &format_mhz(report.freq))
        .append_pair("dbm", &report.dbm.to_string())
        .append_pair("version", &station.client_version)
        .append_pair("mode", MODE_CODE)
        .finish();

    Ok(body)
}

/// Hz to MHz with exactly six decimal places, without going through floats
fn format_mhz(hz: u32) -> String {
    format!("{}.{:06}", hz / 1_000_000, hz % 1_000_000)
}
