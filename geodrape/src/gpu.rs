//! Graphics device seam.
//!
//! The core never talks to a GPU API directly; it issues commands against
//! [`GraphicsDevice`], which the renderer implements on top of its texture,
//! buffer, and shader abstractions. Textures are opaque shared handles so
//! that tests can assert "same surface propagated" with pointer identity.
//!
//! Devices are expected to cache the one-time resources behind the two
//! reprojection passes (the 2x64 web Mercator grid, the dense projected
//! grid geometry, shader programs, and samplers keyed by value) so that all
//! layers share them.

use std::sync::Arc;

use crate::provider::{ImageData, PixelFormat};

/// Texture minification filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MinificationFilter {
    Nearest,
    Linear,
    /// Trilinear; selected only by the finalize step, never configurable.
    LinearMipmapLinear,
}

/// Texture magnification filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MagnificationFilter {
    Nearest,
    Linear,
}

/// Sampler description. Wrap mode is always clamp-to-edge for imagery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    pub minification_filter: MinificationFilter,
    pub magnification_filter: MagnificationFilter,
    pub maximum_anisotropy: f64,
}

/// Parameters for an empty render-target texture.
#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

#[derive(Debug)]
struct TextureInner {
    id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Opaque handle to a GPU-resident image surface.
///
/// Clones share the same surface; [`Texture::same_surface`] compares
/// identity, not contents.
#[derive(Debug, Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

impl Texture {
    /// Builds a handle; only devices should call this.
    pub fn new(id: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                id,
                width,
                height,
                format,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    /// True if both handles refer to the same surface.
    pub fn same_surface(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Host-computed vertex grid of source-projection coordinates for the
/// arbitrary-projection reprojection pass.
///
/// `coordinates` holds `width * width` (x, y) pairs in row-major order,
/// matching the shared grid geometry the device keeps per width.
#[derive(Debug)]
pub struct ProjectedGrid {
    pub width: u32,
    pub coordinates: Vec<f32>,
}

/// Renderer-side GPU abstraction the imagery core issues commands against.
pub trait GraphicsDevice {
    /// Allocates an empty render-target texture.
    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Texture;

    /// Uploads decoded pixels into a new texture with the given sampler.
    fn create_texture_from_image(&mut self, image: &ImageData, sampler: Sampler) -> Texture;

    /// Releases a surface. Handles may outlive this call; using one
    /// afterwards is a renderer-side error.
    fn destroy_texture(&mut self, texture: &Texture);

    /// Generates a full mipmap chain for the texture.
    fn generate_mipmaps(&mut self, texture: &Texture);

    /// Rebinds the texture's sampler.
    fn set_sampler(&mut self, texture: &Texture, sampler: Sampler);

    /// Maximum anisotropy supported by the device.
    fn maximum_anisotropy(&self) -> f64;

    /// Runs the web Mercator correction pass: a 2-column, 64-row grid where
    /// each row's output V coordinate comes from `web_mercator_t`.
    fn reproject_web_mercator(&mut self, input: &Texture, output: &Texture, web_mercator_t: &[f32]);

    /// Runs one arbitrary-projection stitch pass: samples `source` at the
    /// grid's projected coordinates (normalized by `source_west`/`south`
    /// and the inverse extents) and composites into `output`.
    fn reproject_projected_grid(
        &mut self,
        source: &Texture,
        output: &Texture,
        grid: &ProjectedGrid,
        source_west: f64,
        source_south: f64,
        inverse_width: f64,
        inverse_height: f64,
    );
}
