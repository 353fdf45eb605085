//! Error taxonomy and the layer-scoped failure reporter.
//!
//! Transient throttling and request cancellation are not errors: both roll a
//! record back to `Unloaded` for an implicit retry. True fetch failures are
//! reported once per failing tile through a [`FetchErrorReporter`], which
//! decides whether the identical request should be retried. Repeated-failure
//! deduplication is the reporter's job, not this crate's.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

/// Errors surfaced by an imagery provider while fetching a tile.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The underlying transport failed.
    #[error("request failed: {0}")]
    Request(String),

    /// The response could not be decoded into pixel data.
    #[error("image decode failed: {0}")]
    Decode(String),

    /// The completion channel closed before an outcome was delivered.
    #[error("request channel closed before completion")]
    ChannelClosed,
}

/// Context handed to the failure reporter for one failing tile fetch.
///
/// Carries everything needed to retry the identical request: the tile
/// coordinates within the provider's pyramid and the originating error.
#[derive(Debug, Clone)]
pub struct TileFailure {
    /// Imagery tile x coordinate.
    pub x: u32,
    /// Imagery tile y coordinate.
    pub y: u32,
    /// Imagery pyramid level.
    pub level: u32,
    /// Human-readable description of the failure.
    pub message: String,
    /// The provider error, if one was delivered.
    pub error: Option<ProviderError>,
}

/// Whether a failed fetch should be re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-issue the identical request immediately.
    Retry,
    /// Leave the record in the failed state.
    GiveUp,
}

/// Layer-scoped handler for tile fetch failures.
///
/// One reporter serves every tile of a layer. The layer invokes
/// [`recovered`](FetchErrorReporter::recovered) at most once after a
/// previously reported failure, when any fetch next succeeds.
pub trait FetchErrorReporter: Send + Sync {
    /// Called when a tile fetch fails for a reason other than cancellation
    /// or throttling.
    fn tile_failed(&self, failure: &TileFailure) -> RetryDecision;

    /// Called once when fetches start succeeding again after a reported
    /// failure.
    fn recovered(&self);
}

/// Default reporter that logs through `tracing` and never retries.
#[derive(Debug, Default)]
pub struct LoggingErrorReporter;

impl FetchErrorReporter for LoggingErrorReporter {
    fn tile_failed(&self, failure: &TileFailure) -> RetryDecision {
        warn!(
            x = failure.x,
            y = failure.y,
            level = failure.level,
            error = ?failure.error,
            "{}",
            failure.message
        );
        RetryDecision::GiveUp
    }

    fn recovered(&self) {
        info!("imagery fetches recovered after failure");
    }
}

/// Convenience alias for a shared reporter.
pub type SharedErrorReporter = Arc<dyn FetchErrorReporter>;
