//! Geographic rectangle math.
//!
//! Rectangles are expressed in radians as (west, south, east, north) and are
//! the common currency between terrain tiles, imagery tiles, and provider
//! availability bounds. All overlap computations in the skeleton generator go
//! through [`Rectangle::intersection`] and [`Rectangle::simple_intersection`].

use std::f64::consts::{FRAC_PI_2, PI};

/// Maximum radius of the WGS84 ellipsoid in meters.
///
/// Used to convert angular tile extents into texel spacing on the globe
/// surface when selecting an imagery pyramid level.
pub const ELLIPSOID_MAXIMUM_RADIUS: f64 = 6_378_137.0;

/// A geographic rectangle in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectangle {
    /// Westernmost longitude, in radians.
    pub west: f64,
    /// Southernmost latitude, in radians.
    pub south: f64,
    /// Easternmost longitude, in radians.
    pub east: f64,
    /// Northernmost latitude, in radians.
    pub north: f64,
}

impl Rectangle {
    /// The rectangle covering the full longitude/latitude range.
    pub const MAX_VALUE: Rectangle = Rectangle {
        west: -PI,
        south: -FRAC_PI_2,
        east: PI,
        north: FRAC_PI_2,
    };

    /// Creates a rectangle from radian bounds.
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Creates a rectangle from degree bounds.
    pub fn from_degrees(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west: west.to_radians(),
            south: south.to_radians(),
            east: east.to_radians(),
            north: north.to_radians(),
        }
    }

    /// Angular width in radians.
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    /// Angular height in radians.
    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// Returns true if the rectangle has zero (or negative) area.
    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    /// The (longitude, latitude) of the northwest corner.
    pub fn northwest(&self) -> (f64, f64) {
        (self.west, self.north)
    }

    /// The (longitude, latitude) of the southeast corner.
    pub fn southeast(&self) -> (f64, f64) {
        (self.east, self.south)
    }

    /// Returns true if the point lies inside or on the boundary.
    pub fn contains(&self, longitude: f64, latitude: f64) -> bool {
        longitude >= self.west
            && longitude <= self.east
            && latitude >= self.south
            && latitude <= self.north
    }

    /// Intersection of two rectangles.
    ///
    /// Returns `None` when the rectangles do not overlap at all. A
    /// shared-edge overlap yields a degenerate rectangle with zero width or
    /// height, which the base-layer stretching rule relies on.
    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        let west = self.west.max(other.west);
        let east = self.east.min(other.east);
        let south = self.south.max(other.south);
        let north = self.north.min(other.north);

        if west > east || south > north {
            return None;
        }

        Some(Rectangle {
            west,
            south,
            east,
            north,
        })
    }

    /// Intersection without antimeridian handling.
    ///
    /// The skeleton generator clips individual imagery tiles with this
    /// variant; tiles are already confined to one side of the antimeridian
    /// by the tiling scheme.
    pub fn simple_intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        self.intersection(other)
    }
}
