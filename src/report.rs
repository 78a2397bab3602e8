use serde::{Deserialize, Serialize};

/// A single decode observation destined for the spot collector
///
/// Frequencies are integer Hz, `epoch_time` is the UTC decode time in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Transmitting station callsign
    pub callsign: String,
    /// Receiving station callsign
    pub reporter_callsign: String,
    /// Transmitting station grid locator
    pub locator: String,
    /// Transmit frequency in Hz
    pub freq: u32,
    /// Receive (dial + offset) frequency in Hz
    pub recv_freq: u32,
    pub snr: i32,
    /// Time offset in seconds
    pub dt: f32,
    pub drift: i16,
    pub dbm: i16,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub epoch_time: u64,
}

fn default_mode() -> String {
    "WSPR".to_string()
}
