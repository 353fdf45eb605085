//! Map projections and imagery tiling schemes.
//!
//! Providers tile the globe either in the geographic (equirectangular)
//! projection or in web Mercator. Multi-source providers additionally carry
//! an arbitrary source projection implementing [`MapProjection`], used by the
//! reprojection pipeline to forward-project destination pixels into source
//! image space.

use std::f64::consts::PI;

use crate::geo::{Rectangle, ELLIPSOID_MAXIMUM_RADIUS};

/// Projection used by a tiling scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Equirectangular longitude/latitude. Renderer-native; no reprojection
    /// pass is required for imagery tiled this way.
    Geographic,
    /// Web Mercator (EPSG:3857).
    WebMercator,
}

/// Forward projection from geographic coordinates into an arbitrary
/// source-projection plane.
///
/// Implementations must be cheap; the multi-source reprojection path calls
/// `project` once per vertex of a grid of up to 255x255 points per tile.
pub trait MapProjection: Send + Sync {
    /// Projects (longitude, latitude) radians into projected (x, y).
    fn project(&self, longitude: f64, latitude: f64) -> (f64, f64);
}

/// Web Mercator helpers shared by the tiling scheme and the reprojection
/// pipeline.
pub mod web_mercator {
    /// Latitude bound of the web Mercator projection, in radians
    /// (about 85.05113 degrees).
    pub const MAXIMUM_LATITUDE: f64 = 1.484_422_229_745_332_4;

    /// Mercator angle for a geodetic latitude: atanh(sin(latitude)).
    pub fn mercator_angle(latitude: f64) -> f64 {
        let sin_latitude = latitude.sin();
        0.5 * ((1.0 + sin_latitude) / (1.0 - sin_latitude)).ln()
    }

    /// Geodetic latitude for a mercator angle.
    pub fn geodetic_latitude(mercator_angle: f64) -> f64 {
        mercator_angle.sinh().atan()
    }
}

/// The pyramid layout of an imagery provider.
///
/// A scheme pairs a [`Projection`] with the number of tiles at level zero;
/// every deeper level doubles both axes. Texture-coordinate computations for
/// web Mercator imagery happen in native (projected meter) space so that the
/// nonlinear latitude mapping does not skew the U/V rectangles.
#[derive(Debug, Clone)]
pub struct TilingScheme {
    projection: Projection,
    rectangle: Rectangle,
    tiles_x_at_level_zero: u32,
    tiles_y_at_level_zero: u32,
}

impl TilingScheme {
    /// Geographic scheme: two level-zero tiles across the full globe.
    pub fn geographic() -> Self {
        Self {
            projection: Projection::Geographic,
            rectangle: Rectangle::MAX_VALUE,
            tiles_x_at_level_zero: 2,
            tiles_y_at_level_zero: 1,
        }
    }

    /// Web Mercator scheme: one square level-zero tile over the valid
    /// Mercator latitude range.
    pub fn web_mercator() -> Self {
        Self {
            projection: Projection::WebMercator,
            rectangle: Rectangle::new(
                -PI,
                -web_mercator::MAXIMUM_LATITUDE,
                PI,
                web_mercator::MAXIMUM_LATITUDE,
            ),
            tiles_x_at_level_zero: 1,
            tiles_y_at_level_zero: 1,
        }
    }

    /// The projection tiles are laid out in.
    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// The geographic rectangle covered by the scheme.
    pub fn rectangle(&self) -> Rectangle {
        self.rectangle
    }

    /// Number of tile columns at the given level.
    pub fn tiles_x_at_level(&self, level: u32) -> u32 {
        self.tiles_x_at_level_zero << level
    }

    /// Number of tile rows at the given level.
    pub fn tiles_y_at_level(&self, level: u32) -> u32 {
        self.tiles_y_at_level_zero << level
    }

    fn to_native(&self, longitude: f64, latitude: f64) -> (f64, f64) {
        match self.projection {
            Projection::Geographic => (longitude, latitude),
            Projection::WebMercator => (
                ELLIPSOID_MAXIMUM_RADIUS * longitude,
                ELLIPSOID_MAXIMUM_RADIUS * web_mercator::mercator_angle(latitude),
            ),
        }
    }

    fn from_native(&self, x: f64, y: f64) -> (f64, f64) {
        match self.projection {
            Projection::Geographic => (x, y),
            Projection::WebMercator => (
                x / ELLIPSOID_MAXIMUM_RADIUS,
                web_mercator::geodetic_latitude(y / ELLIPSOID_MAXIMUM_RADIUS),
            ),
        }
    }

    /// Converts a geographic rectangle to the scheme's native coordinates.
    pub fn rectangle_to_native(&self, rectangle: &Rectangle) -> Rectangle {
        let (west, south) = self.to_native(rectangle.west, rectangle.south);
        let (east, north) = self.to_native(rectangle.east, rectangle.north);
        Rectangle::new(west, south, east, north)
    }

    /// Tile coordinates containing a geographic position at the given level.
    ///
    /// Positions on the east/south boundary clamp into the last row/column.
    pub fn position_to_tile_xy(&self, longitude: f64, latitude: f64, level: u32) -> (u32, u32) {
        let tiles_x = self.tiles_x_at_level(level);
        let tiles_y = self.tiles_y_at_level(level);

        let native = self.rectangle_to_native(&self.rectangle);
        let (px, py) = self.to_native(longitude, latitude);

        let x_fraction = (px - native.west) / native.width();
        let y_fraction = (native.north - py) / native.height();

        let x = ((x_fraction * tiles_x as f64) as i64).clamp(0, tiles_x as i64 - 1) as u32;
        let y = ((y_fraction * tiles_y as f64) as i64).clamp(0, tiles_y as i64 - 1) as u32;
        (x, y)
    }

    /// Native-space rectangle of a tile.
    pub fn tile_xy_to_native_rectangle(&self, x: u32, y: u32, level: u32) -> Rectangle {
        let tiles_x = self.tiles_x_at_level(level) as f64;
        let tiles_y = self.tiles_y_at_level(level) as f64;

        let native = self.rectangle_to_native(&self.rectangle);
        let tile_width = native.width() / tiles_x;
        let tile_height = native.height() / tiles_y;

        let west = native.west + x as f64 * tile_width;
        let north = native.north - y as f64 * tile_height;
        Rectangle::new(west, north - tile_height, west + tile_width, north)
    }

    /// Geographic rectangle of a tile.
    pub fn tile_xy_to_rectangle(&self, x: u32, y: u32, level: u32) -> Rectangle {
        let native = self.tile_xy_to_native_rectangle(x, y, level);
        let (west, south) = self.from_native(native.west, native.south);
        let (east, north) = self.from_native(native.east, native.north);
        Rectangle::new(west, south, east, north)
    }
}
