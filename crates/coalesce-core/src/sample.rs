//! Sample mask: which cells, and what fraction of each cell, seed the
//! initial lineage set.

use crate::config::SimParameters;
use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::location::MapLocation;
use serde::{Deserialize, Serialize};

/// Mask over the sample grid. Without a mask every cell is sampled in
/// full. With `uses_spatial_sampling` the mask carries exact per-cell
/// fractions on [0, 1]; otherwise any value above 0.5 counts as sampled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMask {
    mask: Option<Grid<f64>>,
    exact: bool,
    sample_x_size: usize,
    sample_y_size: usize,
    sample_x_offset: i64,
    sample_y_offset: i64,
    grid_x_size: i64,
    grid_y_size: i64,
}

impl SampleMask {
    pub fn new(params: &SimParameters, mask: Option<Grid<f64>>) -> Result<Self> {
        if let Some(grid) = &mask {
            if grid.rows() != params.sample_y_size || grid.cols() != params.sample_x_size {
                return Err(SimError::map(format!(
                    "sample mask is {}x{} but parameters declare {}x{}",
                    grid.rows(),
                    grid.cols(),
                    params.sample_y_size,
                    params.sample_x_size
                )));
            }
            if grid.iter().any(|v| !(0.0..=1.0).contains(v)) {
                return Err(SimError::map("sample mask values must lie in [0, 1]"));
            }
        }
        Ok(Self {
            mask,
            exact: params.uses_spatial_sampling,
            sample_x_size: params.sample_x_size,
            sample_y_size: params.sample_y_size,
            sample_x_offset: params.sample_x_offset,
            sample_y_offset: params.sample_y_offset,
            grid_x_size: params.grid_x_size as i64,
            grid_y_size: params.grid_y_size as i64,
        })
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.mask.is_none()
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.sample_x_size
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.sample_y_size
    }

    /// Translate a raw sample-map coordinate into a wrapped grid location.
    #[must_use]
    pub fn recalculate_coordinates(&self, x: usize, y: usize) -> MapLocation {
        let gx = x as i64 - self.sample_x_offset;
        let gy = y as i64 - self.sample_y_offset;
        let xwrap = gx.div_euclid(self.grid_x_size);
        let ywrap = gy.div_euclid(self.grid_y_size);
        MapLocation::new(
            gx - xwrap * self.grid_x_size,
            gy - ywrap * self.grid_y_size,
            xwrap,
            ywrap,
        )
    }

    /// Reverse of [`recalculate_coordinates`]: the raw mask cell for a
    /// wrapped grid location, when it lies inside the mask.
    fn mask_cell(&self, location: MapLocation) -> Option<(usize, usize)> {
        let x = location.x + location.xwrap * self.grid_x_size + self.sample_x_offset;
        let y = location.y + location.ywrap * self.grid_y_size + self.sample_y_offset;
        if x < 0 || y < 0 || x as usize >= self.sample_x_size || y as usize >= self.sample_y_size {
            return None;
        }
        Some((x as usize, y as usize))
    }

    /// The sampled fraction at a location: 1.0 under a null mask, the raw
    /// fraction under exact sampling, 0/1 under a boolean mask.
    #[must_use]
    pub fn exact_value(&self, location: MapLocation) -> f64 {
        let Some(mask) = &self.mask else {
            return 1.0;
        };
        let Some((x, y)) = self.mask_cell(location) else {
            return 0.0;
        };
        let value = *mask.get(y, x);
        if self.exact {
            value
        } else if value > 0.5 {
            1.0
        } else {
            0.0
        }
    }

    /// Whether the location is sampled at all.
    #[must_use]
    pub fn is_sampled(&self, location: MapLocation) -> bool {
        self.exact_value(location) > 0.0
    }
}
