//! Deferred GPU reprojection and texture finalization.
//!
//! Reprojection work is never executed inline: the layer queues
//! [`ReprojectCommand`]s while processing records, the renderer flushes them
//! into a [`FrameState`], and the frame executor runs them in enqueue order.
//! Each queued command holds a cache reference to its record, released when
//! the command executes or is abandoned, so records can never evict while
//! GPU work is pending on them.
//!
//! Two pipelines exist. Web Mercator imagery runs a single correction pass
//! over a 2-column, 64-row grid whose per-row target V coordinates are
//! computed on the host. Imagery in an arbitrary source projection runs one
//! stitch pass per constituent source texture over a dense forward-projected
//! grid, compositing into a shared output texture.

use std::sync::Arc;

use tracing::trace;

use crate::cache::ImageryCache;
use crate::geo::Rectangle;
use crate::gpu::{
    GraphicsDevice, MagnificationFilter, MinificationFilter, ProjectedGrid, Sampler, Texture,
    TextureDescriptor,
};
use crate::imagery::{ImageryRecord, ImageryState};
use crate::layer::ImageryLayer;
use crate::projection::{web_mercator, MapProjection, Projection};

/// Number of grid rows in the web Mercator correction pass.
pub const WEB_MERCATOR_T_ROWS: usize = 64;

/// A single tile's reprojection rectangle is skipped entirely when its
/// angular width per texel drops below this threshold; the Mercator
/// distortion is subpixel there.
const RADIANS_PER_TEXEL_SKIP_THRESHOLD: f64 = 1e-5;

/// Sampler configuration applied when a texture becomes ready.
#[derive(Debug, Clone, Copy)]
pub struct FinalizeParams {
    pub minification_filter: MinificationFilter,
    pub magnification_filter: MagnificationFilter,
    /// Layer override; the device maximum applies when `None`.
    pub maximum_anisotropy: Option<f64>,
}

/// One deferred GPU reprojection pass.
pub enum ReprojectCommand {
    /// Web Mercator to geographic correction for one record.
    WebMercator {
        record: Arc<ImageryRecord>,
        cache: Arc<ImageryCache>,
        input: Texture,
        rectangle: Rectangle,
        finalize: FinalizeParams,
    },
    /// One stitch pass of an arbitrary-projection record. Passes composite
    /// into `output` in enqueue order; the final pass finalizes the record.
    ProjectedGridPass {
        record: Arc<ImageryRecord>,
        cache: Arc<ImageryCache>,
        source: Texture,
        /// Bounds of the source texture in source-projection units.
        source_rectangle: Rectangle,
        grid: Arc<ProjectedGrid>,
        output: Texture,
        final_pass: bool,
        finalize: FinalizeParams,
    },
}

impl ReprojectCommand {
    /// Runs the pass and releases the command's cache reference.
    pub fn execute(self, device: &mut dyn GraphicsDevice) {
        match self {
            ReprojectCommand::WebMercator {
                record,
                cache,
                input,
                rectangle,
                finalize,
            } => {
                let t = compute_web_mercator_t(&rectangle);
                let output = device.create_texture(&TextureDescriptor {
                    width: input.width(),
                    height: input.height(),
                    format: input.format(),
                });
                device.reproject_web_mercator(&input, &output, &t);

                record.inner.lock().texture = Some(output.clone());
                finalize_reproject_texture(device, &record, &output, finalize);
                cache.release(&record, device);
            }
            ReprojectCommand::ProjectedGridPass {
                record,
                cache,
                source,
                source_rectangle,
                grid,
                output,
                final_pass,
                finalize,
            } => {
                device.reproject_projected_grid(
                    &source,
                    &output,
                    &grid,
                    source_rectangle.west,
                    source_rectangle.south,
                    1.0 / source_rectangle.width(),
                    1.0 / source_rectangle.height(),
                );

                if final_pass {
                    let sources: Vec<Texture> =
                        record.inner.lock().projected_textures.drain(..).collect();
                    for texture in sources {
                        device.destroy_texture(&texture);
                    }
                    finalize_reproject_texture(device, &record, &output, finalize);
                }
                cache.release(&record, device);
            }
        }
    }

    /// Releases the command's cache reference without running the pass and
    /// rolls the record back so a later frame can re-queue it.
    pub fn abandon(self, device: &mut dyn GraphicsDevice) {
        let (record, cache) = match self {
            ReprojectCommand::WebMercator { record, cache, .. } => (record, cache),
            ReprojectCommand::ProjectedGridPass { record, cache, .. } => (record, cache),
        };
        if record.state() == ImageryState::Transitioning {
            record.set_state(ImageryState::TextureLoaded);
        }
        cache.release(&record, device);
    }

    /// The record this command operates on.
    pub fn record(&self) -> &Arc<ImageryRecord> {
        match self {
            ReprojectCommand::WebMercator { record, .. } => record,
            ReprojectCommand::ProjectedGridPass { record, .. } => record,
        }
    }
}

/// Per-frame command list the renderer drains between update and draw.
#[derive(Default)]
pub struct FrameState {
    pub frame_number: u64,
    pub commands: Vec<ReprojectCommand>,
}

impl FrameState {
    pub fn new(frame_number: u64) -> Self {
        Self {
            frame_number,
            commands: Vec::new(),
        }
    }

    /// Executes queued commands in enqueue order.
    pub fn execute_commands(&mut self, device: &mut dyn GraphicsDevice) {
        for command in self.commands.drain(..) {
            command.execute(device);
        }
    }
}

/// Host-computed target V coordinates for the Mercator correction grid: one
/// value per row, south to north, giving the Mercator fraction of each
/// linearly spaced geodetic latitude.
pub fn compute_web_mercator_t(rectangle: &Rectangle) -> [f32; WEB_MERCATOR_T_ROWS] {
    let south_mercator_y = web_mercator::mercator_angle(rectangle.south);
    let north_mercator_y = web_mercator::mercator_angle(rectangle.north);
    let one_over_mercator_height = 1.0 / (north_mercator_y - south_mercator_y);

    let mut t = [0.0f32; WEB_MERCATOR_T_ROWS];
    for (index, value) in t.iter_mut().enumerate() {
        let fraction = index as f64 / (WEB_MERCATOR_T_ROWS - 1) as f64;
        let latitude = rectangle.south + fraction * rectangle.height();
        let mercator_y = web_mercator::mercator_angle(latitude);
        *value = ((mercator_y - south_mercator_y) * one_over_mercator_height) as f32;
    }
    t
}

/// Forward-projects a `width` x `width` grid of points spanning the
/// destination rectangle into source-projection space, row-major from the
/// southwest corner.
pub fn compute_projected_grid(
    destination: &Rectangle,
    width: u32,
    projection: &dyn MapProjection,
) -> ProjectedGrid {
    let step = 1.0 / (width - 1) as f64;
    let mut coordinates = Vec::with_capacity((width * width * 2) as usize);

    for row in 0..width {
        let latitude = destination.south + row as f64 * step * destination.height();
        for column in 0..width {
            let longitude = destination.west + column as f64 * step * destination.width();
            let (x, y) = projection.project(longitude, latitude);
            coordinates.push(x as f32);
            coordinates.push(y as f32);
        }
    }

    ProjectedGrid { width, coordinates }
}

/// Applies the final sampler to a reprojected texture and marks the record
/// ready. Mipmaps are generated only when both filters are linear and the
/// texture dimensions are powers of two; anisotropy is then the device
/// maximum unless the layer configured a lower value.
pub(crate) fn finalize_reproject_texture(
    device: &mut dyn GraphicsDevice,
    record: &Arc<ImageryRecord>,
    texture: &Texture,
    params: FinalizeParams,
) {
    let linear = params.minification_filter == MinificationFilter::Linear
        && params.magnification_filter == MagnificationFilter::Linear;

    if linear && texture.width().is_power_of_two() && texture.height().is_power_of_two() {
        let supported = device.maximum_anisotropy();
        let maximum_anisotropy = params
            .maximum_anisotropy
            .unwrap_or(supported)
            .min(supported);
        device.generate_mipmaps(texture);
        device.set_sampler(
            texture,
            Sampler {
                minification_filter: MinificationFilter::LinearMipmapLinear,
                magnification_filter: MagnificationFilter::Linear,
                maximum_anisotropy,
            },
        );
    } else {
        device.set_sampler(
            texture,
            Sampler {
                minification_filter: params.minification_filter,
                magnification_filter: params.magnification_filter,
                maximum_anisotropy: 1.0,
            },
        );
    }

    record.set_state(ImageryState::Ready);
}

impl ImageryLayer {
    fn finalize_params(&self) -> FinalizeParams {
        FinalizeParams {
            minification_filter: self.minification_filter,
            magnification_filter: self.magnification_filter,
            maximum_anisotropy: self.maximum_anisotropy(),
        }
    }

    /// Routes a texture-loaded record into the right reprojection pipeline,
    /// or finalizes it directly when no GPU pass is needed.
    pub(crate) fn reproject_texture(
        &mut self,
        record: &Arc<ImageryRecord>,
        device: &mut dyn GraphicsDevice,
        need_geographic: bool,
    ) {
        record.set_state(ImageryState::Transitioning);

        if !record.inner.lock().projected_textures.is_empty() {
            self.multisource_reproject_texture(record, device);
            return;
        }

        let texture = match record.texture_web_mercator().or_else(|| record.texture()) {
            Some(texture) => texture,
            None => return,
        };
        let rectangle = record.rectangle();

        // The correction pass runs only when the consumer needs geographic
        // coordinates, the imagery is not already geographic, and the tile
        // is wide enough for the distortion to be visible.
        let needs_pass = need_geographic
            && self.provider().tiling_scheme().projection() != Projection::Geographic
            && rectangle.width() / texture.width() as f64 > RADIANS_PER_TEXEL_SKIP_THRESHOLD;

        if needs_pass {
            self.cache().add_reference(record);
            let finalize = self.finalize_params();
            self.push_reproject_command(ReprojectCommand::WebMercator {
                record: record.clone(),
                cache: self.cache().clone(),
                input: texture,
                rectangle,
                finalize,
            });
        } else {
            if need_geographic {
                // The uncorrected texture doubles as the geographic one.
                record.inner.lock().texture = Some(texture.clone());
            }
            finalize_reproject_texture(device, record, &texture, self.finalize_params());
        }
    }

    /// Queues the stitch passes for an arbitrary-projection record: one pass
    /// per source texture, all compositing into a freshly allocated output.
    fn multisource_reproject_texture(
        &mut self,
        record: &Arc<ImageryRecord>,
        device: &mut dyn GraphicsDevice,
    ) {
        let plan = match record.inner.lock().source_plan.clone() {
            Some(plan) => plan,
            None => return,
        };
        let projection = match self.provider().source_projection() {
            Some(projection) => projection,
            None => return,
        };

        let output = device.create_texture(&TextureDescriptor {
            width: self.provider().tile_width(),
            height: self.provider().tile_height(),
            format: crate::provider::PixelFormat::Rgba8,
        });
        {
            let mut inner = record.inner.lock();
            // A previous queue attempt may have been cancelled after
            // allocating its output; that surface is orphaned now.
            if let Some(previous) = inner.texture.take() {
                device.destroy_texture(&previous);
            }
            inner.texture = Some(output.clone());
        }

        let grid = Arc::new(compute_projected_grid(
            &record.rectangle(),
            self.arbitrary_reprojection_width(),
            projection.as_ref(),
        ));

        let sources: Vec<Texture> = record.inner.lock().projected_textures.clone();
        let finalize = self.finalize_params();
        let pass_count = sources.len();

        trace!(key = ?record.key(), passes = pass_count, "queueing stitch passes");

        for (index, source) in sources.into_iter().enumerate() {
            self.cache().add_reference(record);
            self.push_reproject_command(ReprojectCommand::ProjectedGridPass {
                record: record.clone(),
                cache: self.cache().clone(),
                source,
                source_rectangle: plan.sources[index].rectangle,
                grid: grid.clone(),
                output: output.clone(),
                final_pass: index + 1 == pass_count,
                finalize,
            });
        }
    }
}
