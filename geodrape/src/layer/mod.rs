//! The imagery layer: configuration, the per-record state machine driver,
//! and the reprojection command queue.
//!
//! A layer owns its imagery cache and its placeholder sentinel; everything
//! shared across terrain tiles flows through those. Per-frame work is driven
//! by the render loop calling [`ImageryLayer::process_tile_imagery`] for each
//! mapping, then [`ImageryLayer::queue_reprojection_commands`] to flush
//! deferred GPU work into the frame.

mod fetch;
mod skeleton;
mod texture;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::cache::ImageryCache;
use crate::error::SharedErrorReporter;
use crate::geo::Rectangle;
use crate::gpu::{GraphicsDevice, MagnificationFilter, MinificationFilter};
use crate::imagery::{ImageryRecord, ImageryState, TileImagery};
use crate::provider::ImageryProvider;
use crate::reproject::{FrameState, ReprojectCommand};
use crate::telemetry::LayerMetrics;

/// Default appearance values applied when neither the options nor the
/// provider supply one.
pub const DEFAULT_BRIGHTNESS: f64 = 1.0;
pub const DEFAULT_CONTRAST: f64 = 1.0;
pub const DEFAULT_HUE: f64 = 0.0;
pub const DEFAULT_SATURATION: f64 = 1.0;
pub const DEFAULT_GAMMA: f64 = 1.0;
/// Default grid width for arbitrary-projection reprojection.
pub const DEFAULT_PROJECTED_REPROJECTION_WIDTH: u32 = 128;

/// A layer appearance value: either a constant or a per-tile function of
/// (frame number, tile x, tile y, level). Per-tile functions run every frame
/// for every tile and must be fast.
#[derive(Clone)]
pub enum DynamicScalar {
    Constant(f64),
    PerTile(Arc<dyn Fn(u64, u32, u32, u32) -> f64 + Send + Sync>),
}

impl DynamicScalar {
    pub fn evaluate(&self, frame_number: u64, x: u32, y: u32, level: u32) -> f64 {
        match self {
            DynamicScalar::Constant(value) => *value,
            DynamicScalar::PerTile(function) => function(frame_number, x, y, level),
        }
    }
}

impl std::fmt::Debug for DynamicScalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DynamicScalar::Constant(value) => write!(f, "Constant({})", value),
            DynamicScalar::PerTile(_) => write!(f, "PerTile(..)"),
        }
    }
}

impl From<f64> for DynamicScalar {
    fn from(value: f64) -> Self {
        DynamicScalar::Constant(value)
    }
}

/// Split-screen side this layer renders on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitDirection {
    #[default]
    None,
    Left,
    Right,
}

/// Construction-time layer configuration. All fields have sensible
/// defaults; `rectangle` further clips the provider's availability bounds.
#[derive(Clone)]
pub struct LayerOptions {
    pub rectangle: Rectangle,
    pub alpha: DynamicScalar,
    pub brightness: DynamicScalar,
    pub contrast: DynamicScalar,
    pub hue: DynamicScalar,
    pub saturation: DynamicScalar,
    pub gamma: DynamicScalar,
    pub split_direction: SplitDirection,
    pub minification_filter: MinificationFilter,
    pub magnification_filter: MagnificationFilter,
    pub show: bool,
    pub minimum_terrain_level: Option<u32>,
    pub maximum_terrain_level: Option<u32>,
    pub cutout_rectangle: Option<Rectangle>,
    pub maximum_anisotropy: Option<f64>,
    /// Grid width for the arbitrary-projection path; clamped to [2, 255].
    pub projected_reprojection_width: u32,
    pub error_reporter: Option<SharedErrorReporter>,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            rectangle: Rectangle::MAX_VALUE,
            alpha: DynamicScalar::Constant(1.0),
            brightness: DynamicScalar::Constant(DEFAULT_BRIGHTNESS),
            contrast: DynamicScalar::Constant(DEFAULT_CONTRAST),
            hue: DynamicScalar::Constant(DEFAULT_HUE),
            saturation: DynamicScalar::Constant(DEFAULT_SATURATION),
            gamma: DynamicScalar::Constant(DEFAULT_GAMMA),
            split_direction: SplitDirection::None,
            minification_filter: MinificationFilter::Linear,
            magnification_filter: MagnificationFilter::Linear,
            show: true,
            minimum_terrain_level: None,
            maximum_terrain_level: None,
            cutout_rectangle: None,
            maximum_anisotropy: None,
            projected_reprojection_width: DEFAULT_PROJECTED_REPROJECTION_WIDTH,
            error_reporter: None,
        }
    }
}

/// A single layer of tiled imagery draped onto the terrain surface.
pub struct ImageryLayer {
    provider: Arc<dyn ImageryProvider>,

    /// Appearance knobs, read by the renderer each frame.
    pub alpha: DynamicScalar,
    pub brightness: DynamicScalar,
    pub contrast: DynamicScalar,
    pub hue: DynamicScalar,
    pub saturation: DynamicScalar,
    pub gamma: DynamicScalar,
    pub split_direction: SplitDirection,
    pub minification_filter: MinificationFilter,
    pub magnification_filter: MagnificationFilter,
    pub show: bool,
    pub cutout_rectangle: Option<Rectangle>,

    rectangle: Rectangle,
    minimum_terrain_level: Option<u32>,
    maximum_terrain_level: Option<u32>,
    maximum_anisotropy: Option<f64>,
    arbitrary_reprojection_width: u32,
    is_base_layer: bool,

    cache: Arc<ImageryCache>,
    skeleton_placeholder: Arc<ImageryRecord>,

    error_reporter: Option<SharedErrorReporter>,
    error_reported: AtomicBool,

    reproject_commands: Vec<ReprojectCommand>,
    metrics: Arc<LayerMetrics>,
}

impl ImageryLayer {
    pub fn new(provider: Arc<dyn ImageryProvider>, options: LayerOptions) -> Self {
        Self {
            provider,
            alpha: options.alpha,
            brightness: options.brightness,
            contrast: options.contrast,
            hue: options.hue,
            saturation: options.saturation,
            gamma: options.gamma,
            split_direction: options.split_direction,
            minification_filter: options.minification_filter,
            magnification_filter: options.magnification_filter,
            show: options.show,
            cutout_rectangle: options.cutout_rectangle,
            rectangle: options.rectangle,
            minimum_terrain_level: options.minimum_terrain_level,
            maximum_terrain_level: options.maximum_terrain_level,
            maximum_anisotropy: options.maximum_anisotropy,
            arbitrary_reprojection_width: options.projected_reprojection_width.clamp(2, 255),
            is_base_layer: false,
            cache: Arc::new(ImageryCache::new()),
            skeleton_placeholder: Arc::new(ImageryRecord::placeholder()),
            error_reporter: options.error_reporter,
            error_reported: AtomicBool::new(false),
            reproject_commands: Vec::new(),
            metrics: Arc::new(LayerMetrics::new()),
        }
    }

    /// The imagery provider backing this layer.
    pub fn provider(&self) -> &Arc<dyn ImageryProvider> {
        &self.provider
    }

    /// The layer rectangle. When smaller than the provider's rectangle,
    /// only that portion of the provider is shown.
    pub fn rectangle(&self) -> Rectangle {
        self.rectangle
    }

    /// This layer's record cache.
    pub fn cache(&self) -> &Arc<ImageryCache> {
        &self.cache
    }

    /// Telemetry counters for this layer.
    pub fn metrics(&self) -> &Arc<LayerMetrics> {
        &self.metrics
    }

    /// The shared provider-not-ready sentinel record.
    pub fn skeleton_placeholder(&self) -> &Arc<ImageryRecord> {
        &self.skeleton_placeholder
    }

    /// True if this is the base (lowest shown) layer. The base layer is
    /// treated as if it had global coverage by stretching edge texels over
    /// the whole globe.
    pub fn is_base_layer(&self) -> bool {
        self.is_base_layer
    }

    /// Marks this layer as the base layer; called by the layer collection.
    pub fn set_base_layer(&mut self, is_base_layer: bool) {
        self.is_base_layer = is_base_layer;
    }

    pub(crate) fn maximum_anisotropy(&self) -> Option<f64> {
        self.maximum_anisotropy
    }

    pub(crate) fn arbitrary_reprojection_width(&self) -> u32 {
        self.arbitrary_reprojection_width
    }

    pub(crate) fn minimum_terrain_level(&self) -> Option<u32> {
        self.minimum_terrain_level
    }

    pub(crate) fn maximum_terrain_level(&self) -> Option<u32> {
        self.maximum_terrain_level
    }

    pub(crate) fn error_reporter(&self) -> Option<&SharedErrorReporter> {
        self.error_reporter.as_ref()
    }

    pub(crate) fn error_reported(&self) -> &AtomicBool {
        &self.error_reported
    }

    pub(crate) fn push_reproject_command(&mut self, command: ReprojectCommand) {
        self.metrics.reprojection_queued();
        self.reproject_commands.push(command);
    }

    /// Overall bounds of imagery this layer can produce: the intersection of
    /// the provider's availability rectangle with the layer rectangle.
    /// `None` until the provider is ready.
    pub fn viewable_rectangle(&self) -> Option<Rectangle> {
        if !self.provider.is_ready() {
            return None;
        }
        self.provider.rectangle().intersection(&self.rectangle)
    }

    /// Drives one record through its state machine for this frame.
    ///
    /// `need_geographic` is false when the consumer can render the
    /// uncorrected web Mercator texture directly (it applies the V
    /// correction in its shader instead).
    pub fn process_imagery_state_machine(
        &mut self,
        record: &Arc<ImageryRecord>,
        device: &mut dyn GraphicsDevice,
        need_geographic: bool,
    ) {
        match record.state() {
            ImageryState::Unloaded => self.begin_fetch(record),
            ImageryState::Transitioning => self.poll_request(record),
            ImageryState::Received => self.create_textures(record, device),
            ImageryState::TextureLoaded => self.reproject_texture(record, device, need_geographic),
            ImageryState::Placeholder
            | ImageryState::Ready
            | ImageryState::Failed
            | ImageryState::Invalid => {}
        }
    }

    /// Advances one terrain-tile mapping. Returns true once the mapping is
    /// done loading (ready, failed, or invalid); failed/invalid mappings are
    /// the consumer's cue to substitute ancestor imagery.
    pub fn process_tile_imagery(
        &mut self,
        tile_imagery: &mut TileImagery,
        terrain_rectangle: Rectangle,
        device: &mut dyn GraphicsDevice,
    ) -> bool {
        let loading = match &tile_imagery.loading_imagery {
            Some(loading) => loading.clone(),
            None => return true,
        };

        if loading.is_placeholder() {
            // Waiting for the provider; the skeleton must be regenerated
            // once it becomes ready.
            return false;
        }

        let need_geographic = !tile_imagery.use_web_mercator_t;
        self.process_imagery_state_machine(&loading, device, need_geographic);

        match loading.state() {
            ImageryState::Ready => {
                if let Some(previous) = tile_imagery.ready_imagery.take() {
                    self.cache.release(&previous, device);
                }
                tile_imagery.ready_imagery = Some(loading);
                tile_imagery.loading_imagery = None;
                let translation_and_scale =
                    self.calculate_texture_translation_and_scale(terrain_rectangle, tile_imagery);
                tile_imagery.texture_translation_and_scale = Some(translation_and_scale);
                true
            }
            ImageryState::Failed | ImageryState::Invalid => true,
            _ => false,
        }
    }

    /// Flushes queued reprojection commands into the frame's command list,
    /// preserving enqueue order.
    pub fn queue_reprojection_commands(&mut self, frame: &mut FrameState) {
        frame.commands.append(&mut self.reproject_commands);
    }

    /// Cancels reprojection commands queued for the next frame, running
    /// each command's deferred release so no references or GPU resources
    /// leak.
    pub fn cancel_reprojection_commands(&mut self, device: &mut dyn GraphicsDevice) {
        for command in self.reproject_commands.drain(..) {
            self.metrics.reprojection_cancelled();
            command.abandon(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::MockProvider;

    #[test]
    fn test_defaults_match_documented_values() {
        let options = LayerOptions::default();
        assert!(matches!(options.brightness, DynamicScalar::Constant(v) if v == 1.0));
        assert!(matches!(options.hue, DynamicScalar::Constant(v) if v == 0.0));
        assert_eq!(options.split_direction, SplitDirection::None);
        assert_eq!(options.minification_filter, MinificationFilter::Linear);
        assert_eq!(options.projected_reprojection_width, 128);
        assert!(options.show);
    }

    #[test]
    fn test_reprojection_width_is_clamped() {
        let provider = Arc::new(MockProvider::geographic());
        let layer = ImageryLayer::new(
            provider.clone(),
            LayerOptions {
                projected_reprojection_width: 1,
                ..LayerOptions::default()
            },
        );
        assert_eq!(layer.arbitrary_reprojection_width(), 2);

        let layer = ImageryLayer::new(
            provider,
            LayerOptions {
                projected_reprojection_width: 4096,
                ..LayerOptions::default()
            },
        );
        assert_eq!(layer.arbitrary_reprojection_width(), 255);
    }

    #[test]
    fn test_dynamic_scalar_per_tile() {
        let scalar = DynamicScalar::PerTile(Arc::new(|frame, x, _y, _level| {
            if frame > 100 {
                0.5
            } else {
                x as f64
            }
        }));
        assert_eq!(scalar.evaluate(0, 3, 0, 0), 3.0);
        assert_eq!(scalar.evaluate(101, 3, 0, 0), 0.5);
    }

    #[test]
    fn test_viewable_rectangle_clips_provider() {
        let provider = Arc::new(MockProvider::geographic());
        let layer_rect = Rectangle::from_degrees(-10.0, -10.0, 10.0, 10.0);
        let layer = ImageryLayer::new(
            provider,
            LayerOptions {
                rectangle: layer_rect,
                ..LayerOptions::default()
            },
        );

        let viewable = layer.viewable_rectangle().expect("provider ready");
        assert_eq!(viewable, layer_rect);
    }

    #[test]
    fn test_viewable_rectangle_none_until_ready() {
        let mut provider = MockProvider::geographic();
        provider.ready = false;
        let layer = ImageryLayer::new(Arc::new(provider), LayerOptions::default());
        assert!(layer.viewable_rectangle().is_none());
    }
}
