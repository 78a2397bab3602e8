//! spotwire - decoder activity tracking and spot report upload
//!
//! This library provides the two background services a multi-decoder
//! digital-mode receiver needs for monitoring and reporting:
//!
//! - [`ActivityTracker`] collects per-decoder decode events and answers
//!   "how many decodes in the last N seconds" for every decoder.
//! - [`ReportUploader`] queues decode reports and uploads each one to a
//!   remote spot collector over its own short-lived TCP connection.
//!
//! Both accept work from any thread without blocking and do their own
//! bookkeeping on a single tokio task.

pub mod activity_tracker;
pub mod config;
pub mod log_format;
pub mod metrics;
pub mod protocol;
pub mod report;
pub mod report_uploader;
pub mod transport;
pub mod worker;

pub use activity_tracker::{ActivityTracker, TrackerConfig, TrackerError};
pub use protocol::{ProtocolError, SpotRequest, StationInfo};
pub use report::Report;
pub use report_uploader::{
    DeliveryError, DeliveryPhase, DeliverySnapshot, ReportUploader, RetryPolicy, UploaderConfig,
    UploaderConfigBuilder,
};
pub use transport::{Connection, TcpTransport, Transport};
pub use worker::WorkerHandle;

/// Placeholder vergen writes when git metadata is unavailable
const VERGEN_PLACEHOLDER: &str = "VERGEN_IDEMPOTENT_OUTPUT";

/// Version string for this build
///
/// Uses `git describe` output captured at build time, falling back to the
/// Cargo package version outside a git checkout.
pub fn build_version() -> &'static str {
    match option_env!("VERGEN_GIT_DESCRIBE") {
        Some(describe) if !describe.is_empty() && describe != VERGEN_PLACEHOLDER => describe,
        _ => env!("CARGO_PKG_VERSION"),
    }
}

/// Default client identifier sent in the `version` field of every spot
pub fn default_client_version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), build_version())
}
