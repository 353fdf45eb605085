//! Imagery provider abstraction.
//!
//! A provider supplies raw pixel data for tiles of its own pyramid and
//! exposes the metadata the skeleton generator needs: tiling scheme,
//! availability rectangle, and level bounds. Fetches are asynchronous:
//! `request_image` hands back a oneshot receiver that the layer polls on the
//! next update pass, so no provider callback ever mutates core state from
//! another thread.
//!
//! Returning `None` from `request_image` means the request subsystem is
//! saturated; the layer treats that as "postpone", not as an error.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::geo::Rectangle;
use crate::projection::{MapProjection, TilingScheme};

/// Pixel layout of a decoded tile image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit RGB, tightly packed.
    Rgb8,
    /// 8-bit RGBA, tightly packed.
    Rgba8,
}

/// Decoded pixel payload for one tile (or one multi-source constituent).
#[derive(Debug, Clone)]
pub struct ImageData {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout of `pixels`.
    pub format: PixelFormat,
    /// Raw pixel bytes.
    pub pixels: Bytes,
}

/// Attribution record attached to a tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    /// Attribution text to surface alongside rendered imagery.
    pub text: String,
}

/// Outcome of a tile fetch, delivered through the request's oneshot channel.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The provider produced pixel data.
    Image(ImageData),
    /// The provider completed without data (treated as a failure unless the
    /// request was cancelled).
    Empty,
    /// The fetch failed.
    Failed(ProviderError),
}

/// Receiver for a fetch completion, polled once per frame by the layer.
pub type FetchFuture = oneshot::Receiver<FetchOutcome>;

/// Cancellable handle stored with an in-flight request.
///
/// Cancellation is cooperative: the provider observes the token and may
/// abandon the transfer; the layer checks it when a completion (or channel
/// closure) arrives to tell silent-retry apart from true failure.
#[derive(Debug, Clone, Default)]
pub struct RequestHandle {
    token: CancellationToken,
}

impl RequestHandle {
    /// Creates a fresh, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the fetch.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token for providers that want to await cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// One constituent source image of a multi-source tile.
#[derive(Debug, Clone)]
pub struct ProjectedSource {
    /// Source image x coordinate.
    pub x: u32,
    /// Source image y coordinate.
    pub y: u32,
    /// Bounds of the source image in source-projection units.
    pub rectangle: Rectangle,
}

/// Fetch plan for a tile stitched from several source-projection images.
///
/// Sub-fetches run sequentially in index order; only the final success moves
/// the record to `Received`.
#[derive(Debug, Clone)]
pub struct ProjectedSourcePlan {
    /// Level at which the source images are requested.
    pub level: u32,
    /// Constituent source images, in fetch order.
    pub sources: Vec<ProjectedSource>,
}

/// Content policy that can reject fetched images after the fact.
///
/// Some providers return a sentinel "missing" image instead of an HTTP
/// error; the policy recognizes those so the consumer can fall back to
/// ancestor imagery.
pub trait TileDiscardPolicy: Send + Sync {
    /// Returns false while the policy is still initializing. Records stay in
    /// the received state and are re-checked next frame.
    fn is_ready(&self) -> bool;

    /// Returns true if the image should be discarded (record becomes
    /// terminally invalid).
    fn should_discard(&self, image: &ImageData) -> bool;
}

/// Source of tiled imagery draped onto terrain by an imagery layer.
pub trait ImageryProvider: Send + Sync {
    /// Returns true once metadata (tiling scheme, rectangle, levels) is
    /// usable. Skeleton generation inserts placeholders until then.
    fn is_ready(&self) -> bool;

    /// The provider's tiling scheme.
    fn tiling_scheme(&self) -> &TilingScheme;

    /// Availability rectangle; tiles outside it are never requested.
    fn rectangle(&self) -> Rectangle;

    /// Tile width in pixels.
    fn tile_width(&self) -> u32;

    /// Tile height in pixels.
    fn tile_height(&self) -> u32;

    /// Lowest level that may be requested, if constrained.
    fn minimum_level(&self) -> Option<u32> {
        None
    }

    /// Highest level that may be requested.
    fn maximum_level(&self) -> u32;

    /// Whether tile pixels carry an alpha channel.
    fn has_alpha_channel(&self) -> bool {
        true
    }

    /// Attribution records for a tile.
    fn tile_credits(&self, _x: u32, _y: u32, _level: u32) -> Vec<Credit> {
        Vec::new()
    }

    /// Optional content-discard policy.
    fn discard_policy(&self) -> Option<&dyn TileDiscardPolicy> {
        None
    }

    /// Begins fetching a tile. Returns `None` when too many requests are
    /// already in flight; the caller retries on a later frame.
    fn request_image(
        &self,
        x: u32,
        y: u32,
        level: u32,
        request: &RequestHandle,
    ) -> Option<FetchFuture>;

    /// Multi-source fetch plan for a tile, if this provider stitches tiles
    /// from several source-projection images.
    fn projected_source_plan(&self, _x: u32, _y: u32, _level: u32) -> Option<ProjectedSourcePlan> {
        None
    }

    /// Source projection for multi-source imagery.
    fn source_projection(&self) -> Option<Arc<dyn MapProjection>> {
        None
    }
}
