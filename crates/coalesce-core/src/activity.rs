//! Per-cell death and reproduction weight lookups.

use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::landscape::Landscape;
use crate::location::Cell;
use crate::rng::RandomSource;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A relative activity weight over the fine map. A null map weights every
/// cell equally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityMap {
    map: Option<Grid<f64>>,
    max_value: f64,
    total: f64,
}

impl ActivityMap {
    /// A null map: every action is accepted.
    #[must_use]
    pub fn null() -> Self {
        Self {
            map: None,
            max_value: 1.0,
            total: 0.0,
        }
    }

    /// Import a weight grid matching the fine map dimensions.
    pub fn from_grid(map: Grid<f64>, landscape: &Landscape) -> Result<Self> {
        if map.rows() != landscape.fine_rows() || map.cols() != landscape.fine_cols() {
            return Err(SimError::map(format!(
                "activity map is {}x{} but the fine map is {}x{}",
                map.rows(),
                map.cols(),
                landscape.fine_rows(),
                landscape.fine_cols()
            )));
        }
        if map.iter().any(|v| *v < 0.0 || !v.is_finite()) {
            return Err(SimError::map("activity weights must be finite and non-negative"));
        }
        let max_value = map.iter().copied().fold(0.0f64, f64::max);
        if max_value == 0.0 {
            return Err(SimError::map("activity map is zero everywhere"));
        }
        let total = map.iter().sum();
        Ok(Self {
            map: Some(map),
            max_value,
            total,
        })
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.map.is_none()
    }

    /// Relative weight at a fine-map cell; 1.0 for a null map.
    #[must_use]
    pub fn get(&self, cell: Cell) -> f64 {
        match &self.map {
            None => 1.0,
            Some(map) => *map.get(cell.y, cell.x),
        }
    }

    #[must_use]
    pub const fn total(&self) -> f64 {
        self.total
    }

    /// Rejection test used by the per-event engine: accept the chosen cell
    /// with probability weight / max_weight.
    pub fn action_occurs(&self, rng: &mut RandomSource, cell: Cell) -> bool {
        match &self.map {
            None => true,
            Some(map) => rng.uniform01() < *map.get(cell.y, cell.x) / self.max_value,
        }
    }

    /// A zero weight on a cell with non-zero density makes that cell
    /// unleavable, so the combination is refused.
    pub fn verify_against(&self, landscape: &Landscape, name: &str) -> Result<()> {
        let Some(map) = &self.map else {
            return Ok(());
        };
        let mut reported_dead_habitat = false;
        for y in 0..map.rows() {
            for x in 0..map.cols() {
                let density = landscape.value_fine(x as i64, y as i64, 0.0)?;
                let weight = *map.get(y, x);
                if weight == 0.0 && density > 0 {
                    return Err(SimError::map(format!(
                        "{name} map is zero at ({x}, {y}) where density is {density}; \
                         this would make the cell unleavable"
                    )));
                }
                if !reported_dead_habitat && density == 0 && weight != 0.0 {
                    reported_dead_habitat = true;
                    warn!(x, y, weight, "{name} map is non-zero where density is zero");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimParameters;
    use crate::landscape::LandscapeInputs;

    fn landscape(size: usize) -> Landscape {
        let mut params = SimParameters {
            fine_map_x_size: size,
            fine_map_y_size: size,
            ..SimParameters::default()
        };
        params.validate().unwrap();
        Landscape::new(&params, &LandscapeInputs::default()).unwrap()
    }

    #[test]
    fn null_map_accepts_everything() {
        let map = ActivityMap::null();
        let mut rng = RandomSource::with_seed(1);
        assert!(map.action_occurs(&mut rng, Cell::new(0, 0)));
        assert_eq!(map.get(Cell::new(3, 3)), 1.0);
    }

    #[test]
    fn zero_weight_on_habitat_is_refused() {
        let landscape = landscape(2);
        let mut weights = Grid::new(2, 2, 1.0).unwrap();
        *weights.get_mut(0, 1) = 0.0;
        let map = ActivityMap::from_grid(weights, &landscape).unwrap();
        assert!(map.verify_against(&landscape, "death").is_err());
    }

    #[test]
    fn rejection_follows_relative_weight() {
        let landscape = landscape(2);
        let mut weights = Grid::new(2, 2, 1.0).unwrap();
        *weights.get_mut(0, 0) = 0.25;
        let map = ActivityMap::from_grid(weights, &landscape).unwrap();
        let mut rng = RandomSource::with_seed(99);
        let accepted = (0..10_000)
            .filter(|_| map.action_occurs(&mut rng, Cell::new(0, 0)))
            .count();
        assert!((2_000..3_000).contains(&accepted), "accepted={accepted}");
    }
}
