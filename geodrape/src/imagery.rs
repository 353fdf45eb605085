//! Imagery records and per-terrain-tile mappings.
//!
//! An [`ImageryRecord`] is the unit of sharing: one record exists per
//! (x, y, level) key regardless of how many terrain tiles reference it, and
//! an explicit reference count arbitrates its lifetime. The record's mutable
//! interior is an [`ImageryState`] machine driven once per frame by the
//! owning layer; illegal combinations (a texture on an `Unloaded` record,
//! say) are prevented by routing every transition through the layer's
//! processing methods rather than ad hoc field pokes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::geo::Rectangle;
use crate::gpu::Texture;
use crate::provider::{
    Credit, FetchFuture, ImageData, ProjectedSourcePlan, RequestHandle,
};

/// Identifies a tile in the imagery provider's pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub x: u32,
    pub y: u32,
    pub level: u32,
}

impl TileKey {
    pub fn new(x: u32, y: u32, level: u32) -> Self {
        Self { x, y, level }
    }
}

/// Lifecycle state of an imagery record.
///
/// The happy path is `Unloaded -> Transitioning -> Received ->
/// Transitioning(texture upload) -> TextureLoaded -> Ready`. `Failed` is
/// re-enterable through the layer's error reporter; `Invalid` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageryState {
    /// Sentinel state of the shared placeholder record.
    Placeholder,
    /// No request outstanding; eligible for a new request.
    Unloaded,
    /// A request or texture upload is in flight.
    Transitioning,
    /// Pixel payload received, texture not yet created.
    Received,
    /// GPU texture created, reprojection pending.
    TextureLoaded,
    /// Reprojected, mipmapped, and usable for rendering.
    Ready,
    /// Fetch failed; the error reporter decides about retries.
    Failed,
    /// Rejected by the discard policy; consumers substitute ancestor
    /// imagery. Never retried.
    Invalid,
}

/// An in-flight fetch: the cancellable handle plus the completion channel
/// polled on each update pass.
#[derive(Debug)]
pub struct InFlightRequest {
    pub(crate) handle: RequestHandle,
    pub(crate) future: FetchFuture,
    /// Index of the sub-fetch for multi-source records; 0 otherwise.
    pub(crate) source_index: usize,
}

/// Mutable interior of an imagery record.
#[derive(Debug, Default)]
pub struct ImageryInner {
    pub(crate) state_value: StateCell,
    pub(crate) image: Option<ImageData>,
    pub(crate) projected_images: Vec<ImageData>,
    pub(crate) texture: Option<Texture>,
    pub(crate) texture_web_mercator: Option<Texture>,
    pub(crate) projected_textures: Vec<Texture>,
    pub(crate) credits: Vec<Credit>,
    pub(crate) request: Option<InFlightRequest>,
    pub(crate) source_plan: Option<Arc<ProjectedSourcePlan>>,
}

/// Newtype so `Default` can pick `Unloaded`.
#[derive(Debug)]
pub(crate) struct StateCell(pub ImageryState);

impl Default for StateCell {
    fn default() -> Self {
        StateCell(ImageryState::Unloaded)
    }
}

/// One shared imagery tile: key, coverage, reference count, and the fetch
/// state machine interior.
#[derive(Debug)]
pub struct ImageryRecord {
    key: Option<TileKey>,
    rectangle: Rectangle,
    reference_count: AtomicUsize,
    pub(crate) inner: Mutex<ImageryInner>,
}

impl ImageryRecord {
    /// Creates a record for a real tile. The caller (the cache) owns the
    /// initial reference bookkeeping.
    pub(crate) fn new(key: TileKey, rectangle: Rectangle) -> Self {
        Self {
            key: Some(key),
            rectangle,
            reference_count: AtomicUsize::new(0),
            inner: Mutex::new(ImageryInner::default()),
        }
    }

    /// Creates the keyless sentinel used while the provider is not ready.
    pub(crate) fn placeholder() -> Self {
        let record = Self {
            key: None,
            rectangle: Rectangle::MAX_VALUE,
            reference_count: AtomicUsize::new(0),
            inner: Mutex::new(ImageryInner::default()),
        };
        record.inner.lock().state_value = StateCell(ImageryState::Placeholder);
        record
    }

    /// Tile key; `None` for the placeholder sentinel.
    pub fn key(&self) -> Option<TileKey> {
        self.key
    }

    /// Geographic coverage of this tile.
    pub fn rectangle(&self) -> Rectangle {
        self.rectangle
    }

    /// True for the shared provider-not-ready sentinel.
    pub fn is_placeholder(&self) -> bool {
        self.key.is_none()
    }

    /// Current state.
    pub fn state(&self) -> ImageryState {
        self.inner.lock().state_value.0
    }

    /// Current consumer count.
    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::SeqCst)
    }

    /// The final geographic texture, once ready.
    pub fn texture(&self) -> Option<Texture> {
        self.inner.lock().texture.clone()
    }

    /// The uncorrected web-Mercator texture, if the source tiles that way.
    pub fn texture_web_mercator(&self) -> Option<Texture> {
        self.inner.lock().texture_web_mercator.clone()
    }

    /// Attribution captured when the tile was requested.
    pub fn credits(&self) -> Vec<Credit> {
        self.inner.lock().credits.clone()
    }

    pub(crate) fn add_reference(&self) -> usize {
        self.reference_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn release_reference(&self) -> usize {
        let previous = self.reference_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "released an imagery record with no references");
        previous - 1
    }

    pub(crate) fn set_state(&self, state: ImageryState) {
        self.inner.lock().state_value = StateCell(state);
    }
}

/// Associates an imagery record with its placement on one terrain tile.
///
/// Owned by the terrain tile, not by this crate. `texture_coordinate_rectangle`
/// is (min_u, min_v, max_u, max_v) within the terrain tile's unit square.
#[derive(Debug, Clone)]
pub struct TileImagery {
    /// Record still being loaded, if any.
    pub loading_imagery: Option<Arc<ImageryRecord>>,
    /// Record whose texture is usable for rendering.
    pub ready_imagery: Option<Arc<ImageryRecord>>,
    /// Placement within the terrain tile: (min_u, min_v, max_u, max_v).
    pub texture_coordinate_rectangle: Option<[f64; 4]>,
    /// Translation (x, y) and scale (z, w) mapping terrain-tile texture
    /// coordinates into this imagery tile.
    pub texture_translation_and_scale: Option<[f64; 4]>,
    /// True when the shader must apply the web Mercator V correction.
    pub use_web_mercator_t: bool,
}

impl TileImagery {
    /// Mapping for a real skeleton.
    pub fn new(
        imagery: Arc<ImageryRecord>,
        texture_coordinate_rectangle: [f64; 4],
        use_web_mercator_t: bool,
    ) -> Self {
        debug_assert!(
            texture_coordinate_rectangle[0] <= texture_coordinate_rectangle[2]
                && texture_coordinate_rectangle[1] <= texture_coordinate_rectangle[3],
            "texture coordinate rectangle must be ordered"
        );
        Self {
            loading_imagery: Some(imagery),
            ready_imagery: None,
            texture_coordinate_rectangle: Some(texture_coordinate_rectangle),
            texture_translation_and_scale: None,
            use_web_mercator_t,
        }
    }

    /// Mapping referencing the provider-not-ready sentinel.
    pub fn placeholder(imagery: Arc<ImageryRecord>) -> Self {
        Self {
            loading_imagery: Some(imagery),
            ready_imagery: None,
            texture_coordinate_rectangle: None,
            texture_translation_and_scale: None,
            use_web_mercator_t: false,
        }
    }
}
