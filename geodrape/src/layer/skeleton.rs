//! Skeleton generation: deciding which imagery tiles drape a terrain tile.
//!
//! For each terrain tile the generator selects an imagery pyramid level whose
//! texel spacing best matches the terrain's geometric error, walks the
//! covered imagery tile range northwest to southeast, and appends one
//! [`TileImagery`] mapping per imagery tile with its texture-coordinate
//! rectangle inside the terrain tile's unit square. All rectangle math for
//! web Mercator imagery happens in native projected coordinates so the
//! nonlinear latitude mapping cannot skew the V range.

use tracing::trace;

use crate::geo::{Rectangle, ELLIPSOID_MAXIMUM_RADIUS};
use crate::imagery::{TileImagery, TileKey};
use crate::layer::ImageryLayer;
use crate::projection::{web_mercator, Projection};
use crate::terrain::{TerrainGeometry, TerrainTile};

impl ImageryLayer {
    /// Creates the imagery skeletons for a terrain tile and splices them into
    /// the tile's imagery list at `insertion_point` (append when `None`).
    ///
    /// Returns true if any mapping (or the not-ready placeholder) was added.
    /// Returns false when the tile is outside this layer's terrain level
    /// bounds or, for non-base layers, outside its coverage.
    pub fn create_tile_imagery_skeletons(
        &self,
        tile: &mut TerrainTile,
        terrain: &dyn TerrainGeometry,
        insertion_point: Option<usize>,
    ) -> bool {
        if let Some(minimum) = self.minimum_terrain_level() {
            if tile.level < minimum {
                return false;
            }
        }
        if let Some(maximum) = self.maximum_terrain_level() {
            if tile.level > maximum {
                return false;
            }
        }

        let mut insertion_point = insertion_point.unwrap_or(tile.imagery.len());

        if !self.provider().is_ready() {
            // The provider is not ready, so we can't compute the imagery
            // level. Insert the shared placeholder; the skeletons must be
            // regenerated once the provider becomes ready.
            self.cache().add_reference(self.skeleton_placeholder());
            tile.imagery.insert(
                insertion_point,
                TileImagery::placeholder(self.skeleton_placeholder().clone()),
            );
            return true;
        }

        let provider = self.provider().clone();
        let scheme = provider.tiling_scheme().clone();

        // Native-coordinate texture math is only valid while the tile stays
        // inside the Mercator latitude bounds.
        let use_web_mercator_t = scheme.projection() == Projection::WebMercator
            && tile.rectangle.north < web_mercator::MAXIMUM_LATITUDE
            && tile.rectangle.south > -web_mercator::MAXIMUM_LATITUDE;

        // Compute the rectangle of the imagery from this provider that
        // overlaps the terrain tile.
        let imagery_bounds = match provider.rectangle().intersection(&self.rectangle()) {
            Some(bounds) => bounds,
            None => return false,
        };

        let rectangle = match tile.rectangle.intersection(&imagery_bounds) {
            Some(rectangle) => rectangle,
            None => {
                if !self.is_base_layer() {
                    return false;
                }
                // The base layer is opaque everywhere, so the skeleton is
                // clamped to the nearest edge of the imagery bounds; the
                // edge texels get stretched across the uncovered area.
                clamp_to_bounds(&tile.rectangle, &imagery_bounds)
            }
        };

        let latitude_closest_to_equator = if rectangle.south > 0.0 {
            rectangle.south
        } else if rectangle.north < 0.0 {
            rectangle.north
        } else {
            0.0
        };

        let target_geometric_error = terrain.level_maximum_geometric_error(tile.level);
        let mut imagery_level =
            self.level_with_maximum_texel_spacing(target_geometric_error, latitude_closest_to_equator);
        imagery_level = imagery_level.min(provider.maximum_level());
        if let Some(minimum) = provider.minimum_level() {
            imagery_level = imagery_level.max(minimum);
        }

        let (nw_longitude, nw_latitude) = rectangle.northwest();
        let (se_longitude, se_latitude) = rectangle.southeast();
        let (mut northwest_x, mut northwest_y) =
            scheme.position_to_tile_xy(nw_longitude, nw_latitude, imagery_level);
        let (mut southeast_x, mut southeast_y) =
            scheme.position_to_tile_xy(se_longitude, se_latitude, imagery_level);

        // If a boundary imagery tile only barely grazes the terrain tile
        // (within 1/512 of the terrain tile's extent), drop it. Loading it
        // would waste a request on imperceptible texels.
        let mut very_close_x = tile.rectangle.width() / 512.0;
        let mut very_close_y = tile.rectangle.height() / 512.0;

        let northwest_rectangle = scheme.tile_xy_to_rectangle(northwest_x, northwest_y, imagery_level);
        if (northwest_rectangle.south - tile.rectangle.north).abs() < very_close_y
            && northwest_y < southeast_y
        {
            northwest_y += 1;
        }
        if (northwest_rectangle.east - tile.rectangle.west).abs() < very_close_x
            && northwest_x < southeast_x
        {
            northwest_x += 1;
        }

        let southeast_rectangle = scheme.tile_xy_to_rectangle(southeast_x, southeast_y, imagery_level);
        if (southeast_rectangle.north - tile.rectangle.south).abs() < very_close_y
            && southeast_y > northwest_y
        {
            southeast_y -= 1;
        }
        if (southeast_rectangle.west - tile.rectangle.east).abs() < very_close_x
            && southeast_x > northwest_x
        {
            southeast_x -= 1;
        }

        // Texture coordinates are computed in native coordinates when the
        // renderer will apply the Mercator V correction itself.
        let (terrain_rectangle, imagery_bounds, tile_rect_at): (
            Rectangle,
            Rectangle,
            Box<dyn Fn(u32, u32) -> Rectangle + '_>,
        ) = if use_web_mercator_t {
            very_close_x = scheme.rectangle_to_native(&tile.rectangle).width() / 512.0;
            very_close_y = scheme.rectangle_to_native(&tile.rectangle).height() / 512.0;
            (
                scheme.rectangle_to_native(&tile.rectangle),
                scheme.rectangle_to_native(&imagery_bounds),
                Box::new(|x, y| scheme.tile_xy_to_native_rectangle(x, y, imagery_level)),
            )
        } else {
            (
                tile.rectangle,
                imagery_bounds,
                Box::new(|x, y| scheme.tile_xy_to_rectangle(x, y, imagery_level)),
            )
        };

        let mut max_u = 0.0f64;
        let mut min_v = 1.0f64;

        // The northwestern imagery tile may not reach the terrain tile's
        // west/north edge; non-base layers leave that strip uncovered.
        let northwest_clipped = tile_rect_at(northwest_x, northwest_y).intersection(&imagery_bounds);
        if let Some(clipped) = northwest_clipped {
            if !self.is_base_layer()
                && (clipped.west - terrain_rectangle.west).abs() >= very_close_x
            {
                max_u = ((clipped.west - terrain_rectangle.west) / terrain_rectangle.width())
                    .min(1.0);
            }
            if !self.is_base_layer()
                && (clipped.north - terrain_rectangle.north).abs() >= very_close_y
            {
                min_v = ((clipped.north - terrain_rectangle.south) / terrain_rectangle.height())
                    .max(0.0);
            }
        }

        let initial_min_v = min_v;
        let mut inserted = false;

        for i in northwest_x..=southeast_x {
            let min_u = max_u;

            let column_rectangle = tile_rect_at(i, northwest_y);
            let clipped = match column_rectangle.simple_intersection(&imagery_bounds) {
                Some(clipped) => clipped,
                None => continue,
            };

            max_u = ((clipped.east - terrain_rectangle.west) / terrain_rectangle.width()).min(1.0);

            // Force the easternmost column flush with the terrain tile edge
            // so rounding never leaves a seam. Non-base layers only do this
            // when the imagery actually reaches the edge.
            if i == southeast_x
                && (self.is_base_layer()
                    || (clipped.east - terrain_rectangle.east).abs() < very_close_x)
            {
                max_u = 1.0;
            }

            min_v = initial_min_v;

            for j in northwest_y..=southeast_y {
                let max_v = min_v;

                let imagery_rectangle = tile_rect_at(i, j);
                let clipped = match imagery_rectangle.simple_intersection(&imagery_bounds) {
                    Some(clipped) => clipped,
                    None => continue,
                };

                min_v = ((clipped.south - terrain_rectangle.south) / terrain_rectangle.height())
                    .max(0.0);

                if j == southeast_y
                    && (self.is_base_layer()
                        || (clipped.south - terrain_rectangle.south).abs() < very_close_y)
                {
                    min_v = 0.0;
                }

                let texture_coordinates = [min_u, min_v, max_u, max_v];
                let record = self.cache().acquire(
                    TileKey::new(i, j, imagery_level),
                    scheme.tile_xy_to_rectangle(i, j, imagery_level),
                );
                tile.imagery.insert(
                    insertion_point,
                    TileImagery::new(record, texture_coordinates, use_web_mercator_t),
                );
                insertion_point += 1;
                inserted = true;
            }
        }

        trace!(
            terrain_level = tile.level,
            imagery_level,
            columns = southeast_x - northwest_x + 1,
            rows = southeast_y - northwest_y + 1,
            "generated imagery skeletons"
        );

        inserted
    }

    /// Translation (x, y) and scale (z, w) mapping terrain-tile texture
    /// coordinates into the ready imagery tile's texture space.
    pub(crate) fn calculate_texture_translation_and_scale(
        &self,
        terrain_rectangle: Rectangle,
        tile_imagery: &TileImagery,
    ) -> [f64; 4] {
        let ready = tile_imagery
            .ready_imagery
            .as_ref()
            .map(|record| record.rectangle())
            .unwrap_or(Rectangle::MAX_VALUE);

        let (imagery_rectangle, terrain_rectangle) = if tile_imagery.use_web_mercator_t {
            let scheme = self.provider().tiling_scheme();
            (
                scheme.rectangle_to_native(&ready),
                scheme.rectangle_to_native(&terrain_rectangle),
            )
        } else {
            (ready, terrain_rectangle)
        };

        let terrain_width = terrain_rectangle.width();
        let terrain_height = terrain_rectangle.height();
        let scale_x = terrain_width / imagery_rectangle.width();
        let scale_y = terrain_height / imagery_rectangle.height();

        [
            scale_x * (terrain_rectangle.west - imagery_rectangle.west) / terrain_width,
            scale_y * (terrain_rectangle.south - imagery_rectangle.south) / terrain_height,
            scale_x,
            scale_y,
        ]
    }

    /// Finds the imagery level whose texel spacing is closest to (rounding
    /// to the nearest level) the given spacing in meters.
    fn level_with_maximum_texel_spacing(&self, texel_spacing: f64, latitude: f64) -> u32 {
        let scheme = self.provider().tiling_scheme();

        // Mercator texels shrink with latitude; geographic texels do not.
        let latitude_factor = if scheme.projection() != Projection::Geographic {
            latitude.cos()
        } else {
            1.0
        };

        let level_zero_texel_spacing = ELLIPSOID_MAXIMUM_RADIUS
            * scheme.rectangle().width()
            * latitude_factor
            / (self.provider().tile_width() as f64 * scheme.tiles_x_at_level(0) as f64);

        let level = (level_zero_texel_spacing / texel_spacing).log2().round();
        if level < 0.0 {
            0
        } else {
            level as u32
        }
    }
}

/// Clamps a terrain rectangle to the nearest edge or corner of the imagery
/// bounds, producing a degenerate rectangle when they do not overlap.
fn clamp_to_bounds(terrain: &Rectangle, bounds: &Rectangle) -> Rectangle {
    let (south, north) = if terrain.south >= bounds.north {
        (bounds.north, bounds.north)
    } else if terrain.north <= bounds.south {
        (bounds.south, bounds.south)
    } else {
        (
            terrain.south.max(bounds.south),
            terrain.north.min(bounds.north),
        )
    };

    let (west, east) = if terrain.west >= bounds.east {
        (bounds.east, bounds.east)
    } else if terrain.east <= bounds.west {
        (bounds.west, bounds.west)
    } else {
        (terrain.west.max(bounds.west), terrain.east.min(bounds.east))
    };

    Rectangle::new(west, south, east, north)
}
