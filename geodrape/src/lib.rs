//! Geodrape drapes tiled imagery from remote providers onto terrain
//! surfaces for a rendering engine.
//!
//! The crate covers the CPU side of an imagery layer:
//!
//! - **Skeleton generation** decides which imagery tiles cover a terrain
//!   tile, selecting a pyramid level matched to the terrain's geometric
//!   error and computing each tile's texture-coordinate rectangle.
//! - **Fetching** drives every imagery record through an explicit state
//!   machine, with per-frame polling of asynchronous requests, cooperative
//!   cancellation, throttling, and a pluggable failure/retry reporter.
//! - **Caching** shares one reference-counted record per imagery tile across
//!   all terrain tiles that drape it, deduplicating fetches and GPU uploads.
//! - **Reprojection** queues deferred GPU commands that correct web Mercator
//!   imagery into geographic texture space, or stitch imagery from an
//!   arbitrary source projection, before a texture is marked ready.
//!
//! The GPU itself stays behind the [`gpu::GraphicsDevice`] trait and the
//! terrain quad-tree behind [`terrain::TerrainGeometry`]; the renderer owns
//! both. A typical frame calls
//! [`ImageryLayer::process_tile_imagery`](layer::ImageryLayer::process_tile_imagery)
//! for each visible mapping, flushes the layer's queued reprojection
//! commands into a [`reproject::FrameState`], and executes them between
//! update and draw.

pub mod cache;
pub mod error;
pub mod geo;
pub mod gpu;
pub mod imagery;
pub mod layer;
pub mod projection;
pub mod provider;
pub mod reproject;
pub mod telemetry;
pub mod terrain;

pub use cache::ImageryCache;
pub use error::{
    FetchErrorReporter, LoggingErrorReporter, ProviderError, RetryDecision, SharedErrorReporter,
    TileFailure,
};
pub use geo::Rectangle;
pub use gpu::{GraphicsDevice, MagnificationFilter, MinificationFilter, Sampler, Texture};
pub use imagery::{ImageryRecord, ImageryState, TileImagery, TileKey};
pub use layer::{DynamicScalar, ImageryLayer, LayerOptions, SplitDirection};
pub use projection::{MapProjection, Projection, TilingScheme};
pub use provider::{
    Credit, FetchFuture, FetchOutcome, ImageData, ImageryProvider, PixelFormat, ProjectedSource,
    ProjectedSourcePlan, RequestHandle, TileDiscardPolicy,
};
pub use reproject::{FrameState, ReprojectCommand};
pub use telemetry::{init_tracing, LayerMetrics, MetricsSnapshot};
pub use terrain::{TerrainGeometry, TerrainTile};
