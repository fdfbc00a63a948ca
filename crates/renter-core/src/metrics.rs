//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident => $record:ident;)*) => {
        /// Renter engine metrics
        ///
        /// Shared by every component through an `Arc`; [`RenterMetrics::stats`]
        /// takes a consistent-enough snapshot for reporting.
        pub struct RenterMetrics {
            start_time: RwLock<Option<Instant>>,
            $($(#[$doc])* $name: AtomicU64,)*
        }

        impl RenterMetrics {
            /// Create new metrics
            pub fn new() -> Self {
                Self {
                    start_time: RwLock::new(None),
                    $($name: AtomicU64::new(0),)*
                }
            }

            $(
                $(#[$doc])*
                pub fn $record(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Snapshot of all counters
            pub fn stats(&self) -> RenterStats {
                RenterStats {
                    uptime: self.uptime(),
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }

        /// Point-in-time copy of [`RenterMetrics`]
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct RenterStats {
            /// Time since `Renter::start`
            pub uptime: Option<Duration>,
            $($(#[$doc])* pub $name: u64,)*
        }
    };
}

counters! {
    /// Chunks recovered and delivered to a caller
    chunks_downloaded => record_chunk_downloaded;
    /// Chunks that failed to download
    chunks_download_failed => record_chunk_download_failed;
    /// Pieces fetched from hosts
    pieces_fetched => record_piece_fetched;
    /// Piece fetches that failed
    pieces_fetch_failed => record_piece_fetch_failed;
    /// Standby workers recalled after a failed fetch or upload
    standby_recalls => record_standby_recall;
    /// Chunks uploaded with at least `k` durable pieces
    chunks_uploaded => record_chunk_uploaded;
    /// Chunks that ended below `k` durable pieces
    chunks_upload_failed => record_chunk_upload_failed;
    /// Pieces durably stored
    pieces_uploaded => record_piece_uploaded;
    /// Piece uploads that failed
    pieces_upload_failed => record_piece_upload_failed;
    /// Chunks pushed into the upload heap for repair
    repairs_queued => record_repair_queued;
    /// Repairs that reached full success
    repairs_succeeded => record_repair_succeeded;
    /// Repairs that failed
    repairs_failed => record_repair_failed;
    /// Chunks marked stuck
    chunks_marked_stuck => record_chunk_marked_stuck;
    /// Stuck chunks repaired
    stuck_chunks_repaired => record_stuck_chunk_repaired;
    /// Chunks found below 1x redundancy with no local source
    chunks_lost => record_chunk_lost;
    /// Directory bubbles completed
    bubbles => record_bubble;
    /// Health loop passes
    health_checks => record_health_check;
    /// Workers created by reconcile
    workers_created => record_worker_created;
    /// Workers killed by reconcile or shutdown
    workers_killed => record_worker_killed;
}

impl RenterMetrics {
    /// Record engine start
    pub fn record_start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Record engine stop
    pub fn record_stop(&self) {
        *self.start_time.write() = None;
    }

    /// Time since start, if running
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.read().map(|t| t.elapsed())
    }
}

impl Default for RenterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RenterStats {
    /// Fraction of piece fetches that failed
    pub fn piece_failure_rate(&self) -> f64 {
        let total = self.pieces_fetched + self.pieces_fetch_failed;
        if total == 0 {
            0.0
        } else {
            self.pieces_fetch_failed as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RenterMetrics::new();
        metrics.record_piece_fetched();
        metrics.record_piece_fetched();
        metrics.record_piece_fetched();
        metrics.record_piece_fetch_failed();
        metrics.record_bubble();

        let stats = metrics.stats();
        assert_eq!(stats.pieces_fetched, 3);
        assert_eq!(stats.bubbles, 1);
        assert_eq!(stats.chunks_lost, 0);
        assert!((stats.piece_failure_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_uptime() {
        let metrics = RenterMetrics::new();
        assert!(metrics.uptime().is_none());
        metrics.record_start();
        assert!(metrics.stats().uptime.is_some());
        metrics.record_stop();
        assert!(metrics.uptime().is_none());
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_string(&RenterMetrics::new().stats()).unwrap();
        assert!(json.contains("\"standby_recalls\":0"));
    }
}
