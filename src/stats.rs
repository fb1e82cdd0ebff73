//! Process-wide pipeline counters.
//!
//! Counts what the pipeline did without retaining any frame or record
//! content. Shared by every connection through an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic counters updated by connection sessions.
#[derive(Debug)]
pub struct PipelineStats {
    /// Sessions that passed the handshake
    sessions_opened: AtomicU64,
    /// Sessions closed during the handshake
    sessions_rejected: AtomicU64,
    /// Frames run through the analyzer
    frames_analyzed: AtomicU64,
    /// Frames whose image bytes could not be decoded
    frames_undecodable: AtomicU64,
    /// Records written on stimulus transitions
    records_flushed: AtomicU64,
    /// Open buckets dropped when a session ended
    buckets_discarded: AtomicU64,
    started_at: DateTime<Utc>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            frames_analyzed: AtomicU64::new(0),
            frames_undecodable: AtomicU64::new(0),
            records_flushed: AtomicU64::new(0),
            buckets_discarded: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self, undecodable: bool) {
        self.frames_analyzed.fetch_add(1, Ordering::Relaxed);
        if undecodable {
            self.frames_undecodable.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_flush(&self) {
        self.records_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.buckets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            frames_undecodable: self.frames_undecodable.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            buckets_discarded: self.buckets_discarded.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary, printed on shutdown.
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Pipeline Statistics:\n\
             - Sessions opened: {}\n\
             - Sessions rejected: {}\n\
             - Frames analyzed: {} ({} undecodable)\n\
             - Records flushed: {}\n\
             - Buckets discarded at disconnect: {}\n\
             - Uptime: {} seconds",
            s.sessions_opened,
            s.sessions_rejected,
            s.frames_analyzed,
            s.frames_undecodable,
            s.records_flushed,
            s.buckets_discarded,
            s.uptime_secs
        )
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sessions_opened: u64,
    pub sessions_rejected: u64,
    pub frames_analyzed: u64,
    pub frames_undecodable: u64,
    pub records_flushed: u64,
    pub buckets_discarded: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Thread-safe handle to the counters.
pub type SharedPipelineStats = Arc<PipelineStats>;

pub fn create_shared_stats() -> SharedPipelineStats {
    Arc::new(PipelineStats::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PipelineStats::new();
        stats.record_session_opened();
        stats.record_frame(false);
        stats.record_frame(true);
        stats.record_flush();
        stats.record_discard();
        stats.record_session_rejected();

        let s = stats.snapshot();
        assert_eq!(s.sessions_opened, 1);
        assert_eq!(s.sessions_rejected, 1);
        assert_eq!(s.frames_analyzed, 2);
        assert_eq!(s.frames_undecodable, 1);
        assert_eq!(s.records_flushed, 1);
        assert_eq!(s.buckets_discarded, 1);
    }

    #[test]
    fn test_summary_mentions_counts() {
        let stats = PipelineStats::new();
        stats.record_frame(true);
        let summary = stats.summary();
        assert!(summary.contains("Frames analyzed: 1 (1 undecodable)"));
    }
}
