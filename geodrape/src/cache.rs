//! Reference-counted imagery record cache.
//!
//! One cache exists per layer (no process-wide state) and guarantees at most
//! one record per tile key. `acquire` is the only way consumers obtain a
//! record; `release` is the only way they let go. When the last reference is
//! released the record leaves the table, its in-flight request is cancelled,
//! and its GPU textures are destroyed through the device seam. The count,
//! not scope, is the sole arbiter of lifetime because records are shared
//! across arbitrarily many terrain-tile mappings.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::geo::Rectangle;
use crate::gpu::GraphicsDevice;
use crate::imagery::{ImageryRecord, TileKey};

/// Key -> record table with explicit acquire/release semantics.
#[derive(Debug, Default)]
pub struct ImageryCache {
    table: Mutex<HashMap<TileKey, Arc<ImageryRecord>>>,
}

impl ImageryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates-or-finds the record for `key`, increments its reference
    /// count, and returns it. Concurrent acquisitions of one key always
    /// observe the same record instance, which is what deduplicates fetches
    /// for imagery visible under multiple terrain tiles.
    pub fn acquire(&self, key: TileKey, rectangle: Rectangle) -> Arc<ImageryRecord> {
        let mut table = self.table.lock();
        let record = table
            .entry(key)
            .or_insert_with(|| {
                trace!(x = key.x, y = key.y, level = key.level, "imagery cache miss");
                Arc::new(ImageryRecord::new(key, rectangle))
            })
            .clone();
        record.add_reference();
        record
    }

    /// Adds a reference to an already-held record (used when cloning a
    /// mapping, and for the placeholder sentinel, which lives outside the
    /// table).
    pub fn add_reference(&self, record: &Arc<ImageryRecord>) {
        record.add_reference();
    }

    /// Releases one reference. At zero the record is removed from the table,
    /// any in-flight request is cancelled, and GPU surfaces are destroyed.
    /// Returns the remaining reference count.
    pub fn release(&self, record: &Arc<ImageryRecord>, device: &mut dyn GraphicsDevice) -> usize {
        let remaining = record.release_reference();
        if remaining > 0 {
            return remaining;
        }

        if let Some(key) = record.key() {
            self.table.lock().remove(&key);
            trace!(x = key.x, y = key.y, level = key.level, "imagery record evicted");
        }

        let mut inner = record.inner.lock();
        if let Some(request) = inner.request.take() {
            request.handle.cancel();
        }
        if let Some(texture) = inner.texture.take() {
            device.destroy_texture(&texture);
        }
        if let Some(texture) = inner.texture_web_mercator.take() {
            device.destroy_texture(&texture);
        }
        for texture in inner.projected_textures.drain(..) {
            device.destroy_texture(&texture);
        }
        inner.image = None;
        inner.projected_images.clear();

        0
    }

    /// Number of records currently cached.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Whether a record exists for `key` (does not touch the count).
    pub fn contains(&self, key: TileKey) -> bool {
        self.table.lock().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::tests::MockDevice;
    use crate::imagery::ImageryState;
    use crate::provider::ImageryProvider;

    fn key(x: u32, y: u32, level: u32) -> TileKey {
        TileKey::new(x, y, level)
    }

    #[test]
    fn test_acquire_twice_returns_same_record_with_count_two() {
        let cache = ImageryCache::new();
        let a = cache.acquire(key(1, 2, 3), Rectangle::MAX_VALUE);
        let b = cache.acquire(key(1, 2, 3), Rectangle::MAX_VALUE);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.reference_count(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_keys_get_distinct_records() {
        let cache = ImageryCache::new();
        let a = cache.acquire(key(0, 0, 1), Rectangle::MAX_VALUE);
        let b = cache.acquire(key(0, 1, 1), Rectangle::MAX_VALUE);

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_release_to_zero_evicts_and_destroys_textures() {
        let cache = ImageryCache::new();
        let mut device = MockDevice::new();
        let record = cache.acquire(key(4, 5, 6), Rectangle::MAX_VALUE);

        // Pretend the record reached the texture-loaded state.
        let texture = device.create_texture(&crate::gpu::TextureDescriptor {
            width: 4,
            height: 4,
            format: crate::provider::PixelFormat::Rgba8,
        });
        record.inner.lock().texture = Some(texture.clone());

        assert_eq!(cache.release(&record, &mut device), 0);
        assert!(cache.is_empty());
        assert!(!device.live_textures.contains(&texture.id()));
    }

    #[test]
    fn test_release_with_remaining_references_keeps_record() {
        let cache = ImageryCache::new();
        let mut device = MockDevice::new();
        let record = cache.acquire(key(7, 7, 7), Rectangle::MAX_VALUE);
        cache.add_reference(&record);

        assert_eq!(cache.release(&record, &mut device), 1);
        assert!(cache.contains(key(7, 7, 7)));

        assert_eq!(cache.release(&record, &mut device), 0);
        assert!(!cache.contains(key(7, 7, 7)));
    }

    #[test]
    fn test_reacquire_after_eviction_creates_fresh_record() {
        let cache = ImageryCache::new();
        let mut device = MockDevice::new();

        let first = cache.acquire(key(9, 9, 9), Rectangle::MAX_VALUE);
        first.set_state(ImageryState::Failed);
        cache.release(&first, &mut device);

        let second = cache.acquire(key(9, 9, 9), Rectangle::MAX_VALUE);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), ImageryState::Unloaded);
    }

    #[test]
    fn test_release_cancels_in_flight_request() {
        let cache = ImageryCache::new();
        let mut device = MockDevice::new();
        let provider = crate::provider::tests::MockProvider::geographic();

        let record = cache.acquire(key(2, 2, 2), Rectangle::MAX_VALUE);
        let handle = crate::provider::RequestHandle::new();
        let future = provider.request_image(2, 2, 2, &handle).expect("accepted");
        record.inner.lock().request = Some(crate::imagery::InFlightRequest {
            handle: handle.clone(),
            future,
            source_index: 0,
        });

        cache.release(&record, &mut device);
        assert!(handle.is_cancelled());
    }
}
