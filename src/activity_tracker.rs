//! Windowed decode activity per decoder
//!
//! Decoders call [`ActivityTracker::record_event`] once per decode. Events are
//! queued and only folded into the per-decoder histories by
//! [`ActivityTracker::drain_and_prune`], which the tracker's worker task runs
//! on a fixed interval. Histories older than the retention window are evicted
//! on every drain, so [`ActivityTracker::counts`] only ever sees recent data.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, trace};

use crate::worker::{DEFAULT_SHUTDOWN_TIMEOUT, WorkerHandle};

/// One decode occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub source_id: usize,
    pub timestamp_ms: u64,
}

/// Errors raised to callers of the tracker
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("source id {source_id} out of range (tracker has {source_count} sources)")]
    InvalidSource {
        source_id: usize,
        source_count: usize,
    },
}

/// Tracker configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Number of decoder slots; valid source ids are `0..source_count`
    pub source_count: usize,
    /// Events older than this are evicted on every drain
    pub retention_seconds: u32,
    /// How often the worker drains the queue and prunes
    pub prune_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            source_count: 1,
            retention_seconds: 3600,
            prune_interval_ms: 1000,
        }
    }
}

/// Ascending timestamps for one decoder
#[derive(Debug, Default, Clone)]
struct SourceHistory {
    timestamps: VecDeque<u64>,
}

impl SourceHistory {
    /// Insert keeping the history sorted. In-order arrivals are a plain push.
    fn insert(&mut self, ts: u64) {
        match self.timestamps.back() {
            Some(&last) if ts < last => {
                let idx = self.timestamps.partition_point(|&t| t <= ts);
                self.timestamps.insert(idx, ts);
            }
            _ => self.timestamps.push_back(ts),
        }
    }

    /// Drop everything strictly older than `cutoff_ms`, returning how many went
    ///
    /// A timestamp equal to `cutoff_ms` is kept until the next prune. An
    /// inclusive `<=` cutoff would drop it one prune earlier.
    fn evict_before(&mut self, cutoff_ms: u64) -> usize {
        let stale = self.timestamps.partition_point(|&t| t < cutoff_ms);
        self.timestamps.drain(..stale);
        stale
    }

    fn count_since(&self, since_ms: u64) -> usize {
        self.timestamps.iter().filter(|&&t| t >= since_ms).count()
    }
}

/// Per-decoder decode counts over sliding time windows
pub struct ActivityTracker {
    config: TrackerConfig,
    retention_ms: u64,
    events_tx: flume::Sender<Event>,
    events_rx: flume::Receiver<Event>,
    histories: RwLock<Vec<SourceHistory>>,
}

impl ActivityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let retention_ms = u64::from(config.retention_seconds) * 1000;
        let histories = RwLock::new(vec![SourceHistory::default(); config.source_count]);

        Self {
            config,
            retention_ms,
            events_tx,
            events_rx,
            histories,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn source_count(&self) -> usize {
        self.config.source_count
    }

    /// Queue a decode event for `source_id`
    ///
    /// Never blocks. The event becomes visible to [`counts`](Self::counts)
    /// after the next drain.
    pub fn record_event(&self, source_id: usize, timestamp_ms: u64) -> Result<(), TrackerError> {
        if source_id >= self.config.source_count {
            return Err(TrackerError::InvalidSource {
                source_id,
                source_count: self.config.source_count,
            });
        }

        // The tracker holds its own receiver, so the channel never disconnects
        let _ = self.events_tx.send(Event {
            source_id,
            timestamp_ms,
        });
        metrics::counter!("spotwire.tracker.events_recorded_total").increment(1);
        Ok(())
    }

    /// Events recorded but not yet drained
    pub fn queued(&self) -> usize {
        self.events_rx.len()
    }

    /// Drain the queue and prune against the current wall clock
    pub fn drain_and_prune(&self) {
        self.drain_and_prune_at(now_ms());
    }

    /// Move every queued event into its history, then evict everything
    /// older than the retention window measured back from `now_ms`
    pub fn drain_and_prune_at(&self, now_ms: u64) {
        let mut histories = self.histories.write();

        let mut drained = 0usize;
        while let Ok(event) = self.events_rx.try_recv() {
            histories[event.source_id].insert(event.timestamp_ms);
            drained += 1;
        }

        let cutoff = now_ms.saturating_sub(self.retention_ms);
        let pruned: usize = histories
            .iter_mut()
            .map(|history| history.evict_before(cutoff))
            .sum();

        if drained > 0 || pruned > 0 {
            trace!(drained, pruned, cutoff, "Tracker drain complete");
        }
        metrics::counter!("spotwire.tracker.events_pruned_total").increment(pruned as u64);
    }

    /// Decode counts per source over the last `window_sec` seconds
    pub fn counts(&self, window_sec: u32) -> Vec<usize> {
        self.counts_at(window_sec, now_ms())
    }

    /// Decode counts per source with timestamps `>= now_ms - window_sec * 1000`
    ///
    /// Windows longer than the retention window only see what has not been
    /// pruned yet.
    pub fn counts_at(&self, window_sec: u32, now_ms: u64) -> Vec<usize> {
        let since = now_ms.saturating_sub(u64::from(window_sec) * 1000);
        self.histories
            .read()
            .iter()
            .map(|history| history.count_since(since))
            .collect()
    }

    /// Start the worker that drains and prunes every `prune_interval_ms`
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let period = Duration::from_millis(self.config.prune_interval_ms.max(1));
        info!(
            sources = self.config.source_count,
            retention_seconds = self.config.retention_seconds,
            "Starting activity tracker"
        );

        WorkerHandle::spawn(
            "Activity tracker",
            DEFAULT_SHUTDOWN_TIMEOUT,
            move |cancel| async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("Activity tracker stopping");
                            break;
                        }
                        _ = interval.tick() => {
                            self.drain_and_prune();
                            metrics::gauge!("spotwire.tracker.queue_depth")
                                .set(self.queued() as f64);
                        }
                    }
                }
            },
        )
    }

    #[cfg(test)]
    fn history(&self, source_id: usize) -> Vec<u64> {
        self.histories.read()[source_id]
            .timestamps
            .iter()
            .copied()
            .collect()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
