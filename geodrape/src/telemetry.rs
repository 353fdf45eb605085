//! Layer telemetry for observability.
//!
//! Lock-free atomic counters recording what the fetch machine and the
//! reprojection queue are doing, plus a point-in-time snapshot for display.
//! `init_tracing` wires up the `tracing` subscriber for binaries and
//! integration tests; library code only emits events.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

/// Atomic counters updated by the imagery layer.
#[derive(Debug, Default)]
pub struct LayerMetrics {
    requests_issued: AtomicU64,
    requests_throttled: AtomicU64,
    fetch_failures: AtomicU64,
    fetch_retries: AtomicU64,
    tiles_received: AtomicU64,
    tiles_discarded: AtomicU64,
    reprojections_queued: AtomicU64,
    reprojections_cancelled: AtomicU64,
}

impl LayerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request_issued(&self) {
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_throttled(&self) {
        self.requests_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fetch_failed(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fetch_retried(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tile_received(&self) {
        self.tiles_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tile_discarded(&self) {
        self.tiles_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reprojection_queued(&self) {
        self.reprojections_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reprojection_cancelled(&self) {
        self.reprojections_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a consistent-enough copy for display; counters keep moving.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            requests_throttled: self.requests_throttled.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            tiles_received: self.tiles_received.load(Ordering::Relaxed),
            tiles_discarded: self.tiles_discarded.load(Ordering::Relaxed),
            reprojections_queued: self.reprojections_queued.load(Ordering::Relaxed),
            reprojections_cancelled: self.reprojections_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LayerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_issued: u64,
    pub requests_throttled: u64,
    pub fetch_failures: u64,
    pub fetch_retries: u64,
    pub tiles_received: u64,
    pub tiles_discarded: u64,
    pub reprojections_queued: u64,
    pub reprojections_cancelled: u64,
}

/// Installs a global `tracing` subscriber reading `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
