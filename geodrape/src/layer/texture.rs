//! Texture upload: turning received pixel payloads into GPU textures.
//!
//! Runs the provider's discard policy first, so sentinel "missing" images
//! never reach the GPU. Web Mercator imagery lands in the record's
//! web-Mercator texture slot and still needs the reprojection pass;
//! geographic imagery is renderer-native and goes straight into the final
//! slot. Multi-source records upload one texture per constituent image for
//! the stitch passes.

use std::sync::Arc;

use crate::gpu::{GraphicsDevice, MinificationFilter, Sampler};
use crate::imagery::{ImageryRecord, ImageryState};
use crate::layer::ImageryLayer;
use crate::projection::Projection;

impl ImageryLayer {
    /// Uploads a received record's payload. The record moves to
    /// `TextureLoaded` on success, stays `Received` while the discard policy
    /// initializes, and becomes terminally `Invalid` when discarded.
    pub(crate) fn create_textures(
        &self,
        record: &Arc<ImageryRecord>,
        device: &mut dyn GraphicsDevice,
    ) {
        if let Some(policy) = self.provider().discard_policy() {
            if !policy.is_ready() {
                // Re-checked next frame.
                return;
            }

            let mut inner = record.inner.lock();
            let discard = inner
                .image
                .iter()
                .chain(inner.projected_images.iter())
                .any(|image| policy.should_discard(image));
            if discard {
                inner.image = None;
                inner.projected_images.clear();
                drop(inner);
                record.set_state(ImageryState::Invalid);
                self.metrics().tile_discarded();
                return;
            }
        }

        // Trilinear is selected by the finalize step once mipmaps exist;
        // configuring it here is a caller bug.
        assert!(
            matches!(
                self.minification_filter,
                MinificationFilter::Nearest | MinificationFilter::Linear
            ),
            "the minification filter must be nearest or linear before mipmap generation"
        );

        let sampler = Sampler {
            minification_filter: self.minification_filter,
            magnification_filter: self.magnification_filter,
            maximum_anisotropy: 1.0,
        };

        let mut inner = record.inner.lock();
        if !inner.projected_images.is_empty() {
            let textures = inner
                .projected_images
                .iter()
                .map(|image| device.create_texture_from_image(image, sampler))
                .collect();
            inner.projected_textures = textures;
            inner.projected_images.clear();
        } else if let Some(image) = inner.image.take() {
            let texture = device.create_texture_from_image(&image, sampler);
            if self.provider().tiling_scheme().projection() == Projection::WebMercator {
                inner.texture_web_mercator = Some(texture);
            } else {
                inner.texture = Some(texture);
            }
        } else {
            return;
        }
        drop(inner);

        record.set_state(ImageryState::TextureLoaded);
    }
}
