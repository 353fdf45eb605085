//! Terrain collaborator interface.
//!
//! The terrain quad-tree lives outside this crate; skeleton generation only
//! needs a tile's rectangle and level, its imagery mapping list, and the
//! terrain provider's per-level error metric.

use crate::geo::Rectangle;
use crate::imagery::TileImagery;

/// The slice of a terrain tile this crate reads and appends to.
#[derive(Debug)]
pub struct TerrainTile {
    /// Geographic rectangle of the tile, in radians.
    pub rectangle: Rectangle,
    /// Level in the terrain pyramid (zero is least detailed).
    pub level: u32,
    /// Imagery mappings draped onto this tile, ordered by layer then by
    /// skeleton insertion order.
    pub imagery: Vec<TileImagery>,
}

impl TerrainTile {
    pub fn new(rectangle: Rectangle, level: u32) -> Self {
        Self {
            rectangle,
            level,
            imagery: Vec::new(),
        }
    }
}

/// Per-level geometric error metric exposed by the terrain provider.
pub trait TerrainGeometry {
    /// Maximum geometric error, in meters, of terrain geometry at `level`.
    fn level_maximum_geometric_error(&self, level: u32) -> f64;
}

/// Error metric of a regular geographic terrain grid: halves each level.
#[derive(Debug, Clone, Copy)]
pub struct HalvingErrorModel {
    /// Error at level zero, in meters.
    pub level_zero_error: f64,
}

impl TerrainGeometry for HalvingErrorModel {
    fn level_maximum_geometric_error(&self, level: u32) -> f64 {
        self.level_zero_error / (1u64 << level) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halving_error_model() {
        let model = HalvingErrorModel {
            level_zero_error: 1024.0,
        };
        assert_eq!(model.level_maximum_geometric_error(0), 1024.0);
        assert_eq!(model.level_maximum_geometric_error(1), 512.0);
        assert_eq!(model.level_maximum_geometric_error(10), 1.0);
    }
}
