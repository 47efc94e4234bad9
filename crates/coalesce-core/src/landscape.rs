//! Landscape addressing: stacked fine and coarse density maps with
//! temporal interpolation towards a historical state.
//!
//! All coordinates flow through [`MapLocation`]: `(x, y)` relative to the
//! sample grid, `(xwrap, ywrap)` counting tiles of the sample grid. The
//! landscape converts those into fine- or coarse-map cells and reports the
//! integer carrying capacity under the configured boundary policy.

use crate::config::{LandscapePolicy, SimParameters, StrictnessPolicy};
use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::location::{Cell, MapLocation};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Density grids handed to the engine. Raster decoding happens upstream;
/// values are relative densities that are scaled by `deme` and rounded on
/// import. `None` stands for a uniform map of 1.0.
#[derive(Debug, Clone, Default)]
pub struct LandscapeInputs {
    pub fine: Option<Grid<f64>>,
    pub coarse: Option<Grid<f64>>,
    pub historical_fine: Option<Grid<f64>>,
    pub historical_coarse: Option<Grid<f64>>,
}

fn import_scaled(
    source: Option<&Grid<f64>>,
    rows: usize,
    cols: usize,
    deme: u32,
    name: &str,
) -> Result<Grid<u32>> {
    let mut out = Grid::new(rows, cols, 0u32)?;
    match source {
        None => {
            out.fill(deme);
        }
        Some(raw) => {
            if raw.rows() != rows || raw.cols() != cols {
                return Err(SimError::map(format!(
                    "{name} map is {}x{} but parameters declare {rows}x{cols}",
                    raw.rows(),
                    raw.cols()
                )));
            }
            for (dst, src) in out.cells_mut().iter_mut().zip(raw.cells()) {
                *dst = (src * f64::from(deme)).round().max(0.0) as u32;
            }
        }
    }
    Ok(out)
}

/// Fine/coarse density maps in one coordinate system, with the epoch
/// schedule for the historical state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Landscape {
    fine: Grid<u32>,
    coarse: Option<Grid<u32>>,
    historical_fine: Option<Grid<u32>>,
    historical_coarse: Option<Grid<u32>>,
    policy: LandscapePolicy,
    strictness: StrictnessPolicy,
    deme: u32,
    // Sample-grid dimensions; wrap tiles are this large.
    x_dim: i64,
    y_dim: i64,
    // North-west corner offsets of each map from the sample grid.
    fine_x_offset: i64,
    fine_y_offset: i64,
    coarse_x_offset: i64,
    coarse_y_offset: i64,
    scale: i64,
    // Extents of each map in sample-grid coordinates.
    fine_x_min: i64,
    fine_x_max: i64,
    fine_y_min: i64,
    fine_y_max: i64,
    coarse_x_min: i64,
    coarse_x_max: i64,
    coarse_y_min: i64,
    coarse_y_max: i64,
    // Epoch state.
    is_historical: bool,
    current_map_time: f64,
    gen_since_historical: f64,
    habitat_change_rate: f64,
    habitat_max: u32,
}

impl Landscape {
    pub fn new(params: &SimParameters, inputs: &LandscapeInputs) -> Result<Self> {
        let deme = params.deme;
        let fine = import_scaled(
            inputs.fine.as_ref(),
            params.fine_map_y_size,
            params.fine_map_x_size,
            deme,
            "fine",
        )?;
        let coarse = match (&inputs.coarse, params.coarse_map_x_size) {
            (Some(raw), cols) if cols > 0 => Some(import_scaled(
                Some(raw),
                params.coarse_map_y_size,
                params.coarse_map_x_size,
                deme,
                "coarse",
            )?),
            (Some(_), _) => {
                return Err(SimError::map(
                    "coarse map supplied but coarse dimensions are zero",
                ));
            }
            (None, _) => None,
        };
        let historical_fine = inputs
            .historical_fine
            .as_ref()
            .map(|raw| {
                import_scaled(
                    Some(raw),
                    params.fine_map_y_size,
                    params.fine_map_x_size,
                    deme,
                    "historical fine",
                )
            })
            .transpose()?;
        let historical_coarse = inputs
            .historical_coarse
            .as_ref()
            .map(|raw| {
                import_scaled(
                    Some(raw),
                    params.coarse_map_y_size,
                    params.coarse_map_x_size,
                    deme,
                    "historical coarse",
                )
            })
            .transpose()?;
        if historical_coarse.is_some() && coarse.is_none() {
            return Err(SimError::map(
                "historical coarse map supplied without a coarse map",
            ));
        }

        let fine_x_offset = params.fine_map_x_offset + params.sample_x_offset;
        let fine_y_offset = params.fine_map_y_offset + params.sample_y_offset;
        let fine_x_min = -fine_x_offset;
        let fine_y_min = -fine_y_offset;
        let fine_x_max = fine_x_min + fine.cols() as i64;
        let fine_y_max = fine_y_min + fine.rows() as i64;
        let scale = i64::from(params.coarse_map_scale);
        let (coarse_x_min, coarse_y_min, coarse_x_max, coarse_y_max, scale) = match &coarse {
            Some(map) => {
                let x_min = -params.coarse_map_x_offset - fine_x_offset;
                let y_min = -params.coarse_map_y_offset - fine_y_offset;
                (
                    x_min,
                    y_min,
                    x_min + scale * map.cols() as i64,
                    y_min + scale * map.rows() as i64,
                    scale,
                )
            }
            None => (fine_x_min, fine_y_min, fine_x_max, fine_y_max, 1),
        };

        let x_dim = params.grid_x_size as i64;
        let y_dim = params.grid_y_size as i64;
        if fine_x_min < coarse_x_min
            || fine_x_max > coarse_x_max
            || fine_y_min < coarse_y_min
            || fine_y_max > coarse_y_max
        {
            return Err(SimError::map(
                "fine map extremes fall outside the coarse map",
            ));
        }
        if (fine_x_max - fine_x_min) < x_dim || (fine_y_max - fine_y_min) < y_dim {
            return Err(SimError::map("sample grid is larger than the fine map"));
        }

        let mut landscape = Self {
            fine,
            coarse,
            historical_fine,
            historical_coarse,
            policy: params.landscape_type,
            strictness: params.strictness,
            deme,
            x_dim,
            y_dim,
            fine_x_offset,
            fine_y_offset,
            coarse_x_offset: params.coarse_map_x_offset,
            coarse_y_offset: params.coarse_map_y_offset,
            scale,
            fine_x_min,
            fine_x_max,
            fine_y_min,
            fine_y_max,
            coarse_x_min,
            coarse_x_max,
            coarse_y_min,
            coarse_y_max,
            is_historical: false,
            current_map_time: 0.0,
            gen_since_historical: params.gen_since_historical.max(f64::MIN_POSITIVE),
            habitat_change_rate: params.habitat_change_rate,
            habitat_max: 0,
        };
        landscape.recalculate_habitat_max();
        Ok(landscape)
    }

    fn recalculate_habitat_max(&mut self) {
        let mut max = 0u32;
        for grid in [Some(&self.fine), self.coarse.as_ref()]
            .into_iter()
            .flatten()
        {
            max = max.max(grid.iter().copied().max().unwrap_or(0));
        }
        for grid in [self.historical_fine.as_ref(), self.historical_coarse.as_ref()]
            .into_iter()
            .flatten()
        {
            max = max.max(grid.iter().copied().max().unwrap_or(0));
        }
        self.habitat_max = max;
    }

    #[must_use]
    pub const fn habitat_max(&self) -> u32 {
        self.habitat_max
    }

    #[must_use]
    pub const fn deme(&self) -> u32 {
        self.deme
    }

    #[must_use]
    pub fn fine_cols(&self) -> usize {
        self.fine.cols()
    }

    #[must_use]
    pub fn fine_rows(&self) -> usize {
        self.fine.rows()
    }

    /// Whether a historical epoch boundary is still ahead, and when.
    #[must_use]
    pub fn next_map_update(&self) -> Option<f64> {
        if !self.is_historical && self.historical_fine.is_some() {
            Some(self.gen_since_historical)
        } else {
            None
        }
    }

    /// Fires when the generation passes the scheduled epoch boundary.
    /// Returns true iff a map changed; the dispersal coordinator and the
    /// Gillespie event queue must then be rebuilt.
    pub fn update(&mut self, generation: f64) -> bool {
        if self.is_historical || self.historical_fine.is_none() {
            return false;
        }
        if generation < self.gen_since_historical {
            return false;
        }
        info!(generation, "landscape reached its historical state");
        if let Some(historical) = self.historical_fine.take() {
            self.fine = historical;
        }
        if let Some(historical) = self.historical_coarse.take() {
            self.coarse = Some(historical);
        }
        self.is_historical = true;
        self.current_map_time = self.gen_since_historical;
        self.recalculate_habitat_max();
        true
    }

    /// Carrying capacity at a logical location under the boundary policy.
    pub fn capacity_at(&self, location: MapLocation, generation: f64) -> Result<u32> {
        self.capacity(
            location.x,
            location.y,
            location.xwrap,
            location.ywrap,
            generation,
        )
    }

    /// Carrying capacity with explicit coordinates.
    pub fn capacity(
        &self,
        x: i64,
        y: i64,
        xwrap: i64,
        ywrap: i64,
        generation: f64,
    ) -> Result<u32> {
        match self.policy {
            LandscapePolicy::Closed => self.value_finite(x, y, xwrap, ywrap, generation),
            LandscapePolicy::Infinite => self.value_infinite(x, y, xwrap, ywrap, generation),
            LandscapePolicy::TiledFine => self.value_fine_tiled(x, y, xwrap, ywrap, generation),
            LandscapePolicy::TiledCoarse => self.value_coarse_tiled(x, y, xwrap, ywrap, generation),
        }
    }

    fn value_finite(&self, x: i64, y: i64, xwrap: i64, ywrap: i64, generation: f64) -> Result<u32> {
        let xval = x + self.x_dim * xwrap;
        let yval = y + self.y_dim * ywrap;
        if xval < self.coarse_x_min
            || xval >= self.coarse_x_max
            || yval < self.coarse_y_min
            || yval >= self.coarse_y_max
        {
            return Ok(0);
        }
        if self.coarse.is_some()
            && (xval < self.fine_x_min
                || xval >= self.fine_x_max
                || yval < self.fine_y_min
                || yval >= self.fine_y_max)
        {
            let cx = (xval + self.fine_x_offset + self.coarse_x_offset).div_euclid(self.scale);
            let cy = (yval + self.fine_y_offset + self.coarse_y_offset).div_euclid(self.scale);
            return self.value_coarse(cx, cy, generation);
        }
        self.value_fine(xval + self.fine_x_offset, yval + self.fine_y_offset, generation)
    }

    fn value_infinite(
        &self,
        x: i64,
        y: i64,
        xwrap: i64,
        ywrap: i64,
        generation: f64,
    ) -> Result<u32> {
        let xval = x + self.x_dim * xwrap;
        let yval = y + self.y_dim * ywrap;
        if xval < self.coarse_x_min
            || xval >= self.coarse_x_max
            || yval < self.coarse_y_min
            || yval >= self.coarse_y_max
        {
            return Ok(self.deme);
        }
        self.value_finite(x, y, xwrap, ywrap, generation)
    }

    fn value_fine_tiled(
        &self,
        x: i64,
        y: i64,
        xwrap: i64,
        ywrap: i64,
        generation: f64,
    ) -> Result<u32> {
        let cols = self.fine.cols() as i64;
        let rows = self.fine.rows() as i64;
        let fx = (x + xwrap * self.x_dim + self.fine_x_offset).rem_euclid(cols);
        let fy = (y + ywrap * self.y_dim + self.fine_y_offset).rem_euclid(rows);
        self.value_fine(fx, fy, generation)
    }

    fn value_coarse_tiled(
        &self,
        x: i64,
        y: i64,
        xwrap: i64,
        ywrap: i64,
        generation: f64,
    ) -> Result<u32> {
        let Some(coarse) = &self.coarse else {
            // Without a coarse map the tiling degenerates to the fine tiling.
            return self.value_fine_tiled(x, y, xwrap, ywrap, generation);
        };
        let xval = x + self.x_dim * xwrap;
        let yval = y + self.y_dim * ywrap;
        if xval >= self.fine_x_min
            && xval < self.fine_x_max
            && yval >= self.fine_y_min
            && yval < self.fine_y_max
        {
            return self.value_fine(
                xval + self.fine_x_offset,
                yval + self.fine_y_offset,
                generation,
            );
        }
        let cols = coarse.cols() as i64;
        let rows = coarse.rows() as i64;
        let cx = (xval + self.fine_x_offset + self.coarse_x_offset)
            .div_euclid(self.scale)
            .rem_euclid(cols);
        let cy = (yval + self.fine_y_offset + self.coarse_y_offset)
            .div_euclid(self.scale)
            .rem_euclid(rows);
        self.value_coarse(cx, cy, generation)
    }

    /// Fine-map value with epoch interpolation, indexed in fine-map cells.
    pub fn value_fine(&self, x: i64, y: i64, generation: f64) -> Result<u32> {
        if x < 0 || y < 0 || x >= self.fine.cols() as i64 || y >= self.fine.rows() as i64 {
            return Err(SimError::invariant(format!(
                "fine map indexed out of range at ({x}, {y})"
            )));
        }
        let current = *self.fine.get(y as usize, x as usize);
        let Some(historical) = &self.historical_fine else {
            return Ok(current);
        };
        let target = *historical.get(y as usize, x as usize);
        self.interpolate(current, target, generation)
    }

    fn value_coarse(&self, x: i64, y: i64, generation: f64) -> Result<u32> {
        let Some(coarse) = &self.coarse else {
            return Err(SimError::invariant(
                "coarse lookup without a coarse map".to_string(),
            ));
        };
        if x < 0 || y < 0 || x >= coarse.cols() as i64 || y >= coarse.rows() as i64 {
            return Err(SimError::invariant(format!(
                "coarse map indexed out of range at ({x}, {y})"
            )));
        }
        let current = *coarse.get(y as usize, x as usize);
        let Some(historical) = &self.historical_coarse else {
            return Ok(current);
        };
        let target = *historical.get(y as usize, x as usize);
        self.interpolate(current, target, generation)
    }

    /// Linear interpolation between the current epoch and the historical
    /// one, evaluated at `generation`.
    fn interpolate(&self, current: u32, target: u32, generation: f64) -> Result<u32> {
        if current == target {
            return Ok(current);
        }
        let elapsed = generation - self.current_map_time;
        let slope = self.habitat_change_rate * (f64::from(target) - f64::from(current))
            / (self.gen_since_historical - self.current_map_time);
        let value = (f64::from(current) + slope * elapsed).floor().max(0.0) as u32;
        if self.strictness.historical_regression && value > current.max(target) {
            return Err(SimError::map(format!(
                "historical regression: interpolated value {value} exceeds both epochs ({current}, {target})"
            )));
        }
        Ok(value)
    }

    /// Convert a sample-grid coordinate into a fine-map cell column.
    #[must_use]
    pub fn sample_x_to_fine_x(&self, x: i64, xwrap: i64) -> i64 {
        x + self.fine_x_offset + xwrap * self.x_dim
    }

    /// Convert a sample-grid coordinate into a fine-map cell row.
    #[must_use]
    pub fn sample_y_to_fine_y(&self, y: i64, ywrap: i64) -> i64 {
        y + self.fine_y_offset + ywrap * self.y_dim
    }

    /// The fine-map cell a logical location lands in.
    pub fn cell_of(&self, location: MapLocation) -> Result<Cell> {
        let x = self.sample_x_to_fine_x(location.x, location.xwrap);
        let y = self.sample_y_to_fine_y(location.y, location.ywrap);
        if x < 0 || y < 0 || x >= self.fine.cols() as i64 || y >= self.fine.rows() as i64 {
            return Err(SimError::invariant(format!(
                "location {location} maps outside the fine map"
            )));
        }
        Ok(Cell::new(x as usize, y as usize))
    }

    /// Convert a fine-map cell back into a wrapped sample-grid location.
    #[must_use]
    pub fn fine_to_sample(&self, cell: Cell) -> MapLocation {
        let x = cell.x as i64 - self.fine_x_offset;
        let y = cell.y as i64 - self.fine_y_offset;
        self.wrap_coordinates(x, y)
    }

    /// Wrap absolute sample-space coordinates into `(x, y, xwrap, ywrap)`.
    #[must_use]
    pub fn wrap_coordinates(&self, x: i64, y: i64) -> MapLocation {
        let xwrap = x.div_euclid(self.x_dim);
        let ywrap = y.div_euclid(self.y_dim);
        MapLocation::new(x - xwrap * self.x_dim, y - ywrap * self.y_dim, xwrap, ywrap)
    }

    /// Whether absolute sample-space coordinates fall inside the fine map.
    #[must_use]
    pub fn is_in_fine(&self, x: f64, y: f64) -> bool {
        x >= self.fine_x_min as f64
            && x < self.fine_x_max as f64
            && y >= self.fine_y_min as f64
            && y < self.fine_y_max as f64
    }

    fn capacity_continuous(&self, x: f64, y: f64, generation: f64) -> Result<u32> {
        let location = self.wrap_coordinates(x.floor() as i64, y.floor() as i64);
        self.capacity_at(location, generation)
    }

    /// Walk a drawn `(distance, angle)` through the landscape, elongating
    /// traversal through zero-density cells by `dispersal_relative_cost`
    /// and jumping `deme` cells per step while outside the fine map.
    /// Returns the destination when it has non-zero capacity, `None` when
    /// the kernel must be re-sampled.
    pub fn run_dispersal(
        &self,
        distance: f64,
        angle: f64,
        start: MapLocation,
        relative_cost: f64,
        generation: f64,
    ) -> Result<Option<MapLocation>> {
        let start_x = start.x as f64 + (self.x_dim * start.xwrap) as f64 + 0.5;
        let start_y = start.y as f64 + (self.y_dim * start.ywrap) as f64 + 0.5;
        let (sin, cos) = angle.sin_cos();
        let (mut new_x, mut new_y);
        if (relative_cost - 1.0).abs() < f64::EPSILON {
            new_x = start_x + distance * cos;
            new_y = start_y + distance * sin;
        } else {
            // Cost walk: cells with zero density cost `relative_cost` units
            // of dispersal budget per cell traversed.
            let mut travelled = 0.0;
            let mut cost_spent = 0.0;
            new_x = start_x;
            new_y = start_y;
            let mut boost = 1.0;
            while cost_spent < distance {
                boost = if self.is_in_fine(new_x, new_y) {
                    1.0
                } else {
                    f64::from(self.deme)
                };
                new_x += boost * cos;
                new_y += boost * sin;
                let through = if self.capacity_continuous(new_x, new_y, generation)? > 0 {
                    1.0
                } else {
                    relative_cost
                };
                cost_spent += through * boost;
                travelled += boost;
            }
            if self.capacity_continuous(new_x, new_y, generation)? > 0 {
                travelled -= (cost_spent - distance).min(boost - 0.001);
            } else {
                return Ok(None);
            }
            new_x = start_x + travelled * cos;
            new_y = start_y + travelled * sin;
        }
        if self.capacity_continuous(new_x, new_y, generation)? == 0 {
            return Ok(None);
        }
        Ok(Some(
            self.wrap_coordinates(new_x.floor() as i64, new_y.floor() as i64),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_params(size: usize, deme: u32, policy: LandscapePolicy) -> SimParameters {
        let mut params = SimParameters {
            deme,
            fine_map_x_size: size,
            fine_map_y_size: size,
            landscape_type: policy,
            ..SimParameters::default()
        };
        params.validate().unwrap();
        params
    }

    #[test]
    fn closed_landscape_is_zero_outside() {
        let params = uniform_params(4, 5, LandscapePolicy::Closed);
        let landscape = Landscape::new(&params, &LandscapeInputs::default()).unwrap();
        assert_eq!(
            landscape
                .capacity_at(MapLocation::new(2, 2, 0, 0), 0.0)
                .unwrap(),
            5
        );
        assert_eq!(
            landscape
                .capacity_at(MapLocation::new(2, 2, 3, 0), 0.0)
                .unwrap(),
            0
        );
    }

    #[test]
    fn infinite_landscape_falls_back_to_deme() {
        let params = uniform_params(4, 7, LandscapePolicy::Infinite);
        let landscape = Landscape::new(&params, &LandscapeInputs::default()).unwrap();
        assert_eq!(
            landscape
                .capacity_at(MapLocation::new(1, 1, -9, 4), 0.0)
                .unwrap(),
            7
        );
    }

    #[test]
    fn tiled_fine_wraps_into_the_fine_map() {
        let size = 3;
        let mut density = Grid::new(size, size, 1.0).unwrap();
        *density.get_mut(1, 2) = 4.0;
        let params = uniform_params(size, 1, LandscapePolicy::TiledFine);
        let inputs = LandscapeInputs {
            fine: Some(density),
            ..LandscapeInputs::default()
        };
        let landscape = Landscape::new(&params, &inputs).unwrap();
        // One tile to the right lands on the same cell.
        assert_eq!(
            landscape
                .capacity_at(MapLocation::new(2, 1, 1, 0), 0.0)
                .unwrap(),
            4
        );
        assert_eq!(
            landscape
                .capacity_at(MapLocation::new(2, 1, -2, 5), 0.0)
                .unwrap(),
            4
        );
    }

    #[test]
    fn interpolation_moves_towards_historical_value() {
        let mut params = uniform_params(2, 1, LandscapePolicy::Closed);
        params.gen_since_historical = 100.0;
        params.habitat_change_rate = 1.0;
        let fine = Grid::new(2, 2, 10.0).unwrap();
        let historical = Grid::new(2, 2, 20.0).unwrap();
        let inputs = LandscapeInputs {
            fine: Some(fine),
            historical_fine: Some(historical),
            ..LandscapeInputs::default()
        };
        let landscape = Landscape::new(&params, &inputs).unwrap();
        let at = |t| {
            landscape
                .capacity_at(MapLocation::new(0, 0, 0, 0), t)
                .unwrap()
        };
        assert_eq!(at(0.0), 10);
        assert_eq!(at(50.0), 15);
        assert!(at(99.0) <= 20);
    }

    #[test]
    fn update_switches_to_historical_once() {
        let mut params = uniform_params(2, 1, LandscapePolicy::Closed);
        params.gen_since_historical = 10.0;
        let fine = Grid::new(2, 2, 1.0).unwrap();
        let historical = Grid::new(2, 2, 3.0).unwrap();
        let inputs = LandscapeInputs {
            fine: Some(fine),
            historical_fine: Some(historical),
            ..LandscapeInputs::default()
        };
        let mut landscape = Landscape::new(&params, &inputs).unwrap();
        assert_eq!(landscape.next_map_update(), Some(10.0));
        assert!(!landscape.update(5.0));
        assert!(landscape.update(11.0));
        assert!(!landscape.update(12.0));
        assert_eq!(landscape.next_map_update(), None);
        assert_eq!(
            landscape
                .capacity_at(MapLocation::new(0, 0, 0, 0), 12.0)
                .unwrap(),
            3
        );
    }

    #[test]
    fn coordinate_round_trip() {
        let params = uniform_params(6, 1, LandscapePolicy::Closed);
        let landscape = Landscape::new(&params, &LandscapeInputs::default()).unwrap();
        for (x, y, xw, yw) in [(0, 0, 0, 0), (5, 3, 0, 0), (2, 2, 1, -1)] {
            let loc = MapLocation::new(x, y, xw, yw);
            let wrapped = landscape
                .wrap_coordinates(x + 6 * xw, y + 6 * yw);
            assert_eq!(wrapped, loc);
        }
        let cell = landscape.cell_of(MapLocation::new(4, 1, 0, 0)).unwrap();
        assert_eq!(cell, Cell::new(4, 1));
        assert_eq!(landscape.fine_to_sample(cell), MapLocation::new(4, 1, 0, 0));
    }
}
