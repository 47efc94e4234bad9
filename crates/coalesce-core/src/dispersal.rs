//! Dispersal coordination: parametric kernels and empirical dispersal
//! matrices.
//!
//! Parametric kernels draw a `(distance, angle)` pair and walk the
//! landscape; a destination with zero capacity rejects the draw and the
//! kernel is re-sampled. Empirical dispersal keeps one cumulative row per
//! source fine cell and draws a destination by binary search. When the
//! Gillespie engine is active the coordinator additionally exposes, per
//! source cell, the self-dispersal probability and a renormalised row
//! excluding self-dispersal, so staying put becomes a cell-local
//! coalescence opportunity instead of a movement.

use crate::config::{DispersalMethod, SimParameters};
use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::landscape::Landscape;
use crate::location::{Cell, MapLocation};
use crate::rng::RandomSource;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bail out rather than spin forever when every draw keeps being rejected.
const MAX_KERNEL_REJECTIONS: usize = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispersalCoordinator {
    method: DispersalMethod,
    sigma: f64,
    tau: f64,
    m_probability: f64,
    cutoff: f64,
    restrict_self: bool,
    relative_cost: f64,
    fine_rows: usize,
    fine_cols: usize,
    /// Raw probability matrix, one row per source cell; retained so the
    /// cumulative rows can be rebuilt after a map epoch.
    raw: Option<Grid<f64>>,
    /// Per-row cumulative mass, masked by destination capacity.
    cumulative: Option<Grid<f64>>,
    /// Cumulative rows with the self-dispersal mass removed.
    no_self: Option<Grid<f64>>,
    /// Per-cell probability of staying put.
    self_probability: Option<Vec<f64>>,
}

impl DispersalCoordinator {
    pub fn new(
        params: &SimParameters,
        dispersal_matrix: Option<Grid<f64>>,
        landscape: &Landscape,
    ) -> Result<Self> {
        let fine_rows = landscape.fine_rows();
        let fine_cols = landscape.fine_cols();
        let mut coordinator = Self {
            method: params.dispersal_method,
            sigma: params.sigma,
            tau: params.tau,
            m_probability: params.m_probability,
            cutoff: params.cutoff,
            restrict_self: params.restrict_self,
            relative_cost: params.dispersal_relative_cost,
            fine_rows,
            fine_cols,
            raw: None,
            cumulative: None,
            no_self: None,
            self_probability: None,
        };
        if params.dispersal_method == DispersalMethod::Empirical {
            let matrix = dispersal_matrix.ok_or_else(|| {
                SimError::config("empirical dispersal selected without a dispersal matrix")
            })?;
            let cells = fine_rows * fine_cols;
            if matrix.rows() != cells || matrix.cols() != cells {
                return Err(SimError::config(format!(
                    "dispersal matrix is {}x{} but the fine map has {cells} cells",
                    matrix.rows(),
                    matrix.cols()
                )));
            }
            if matrix.iter().any(|v| *v < 0.0 || !v.is_finite()) {
                return Err(SimError::config(
                    "dispersal matrix entries must be finite and non-negative",
                ));
            }
            coordinator.raw = Some(matrix);
            coordinator.rebuild_rows(landscape)?;
        } else if dispersal_matrix.is_some() {
            return Err(SimError::config(
                "a dispersal matrix was supplied but the dispersal method is parametric",
            ));
        }
        Ok(coordinator)
    }

    #[must_use]
    pub fn is_empirical(&self) -> bool {
        self.raw.is_some()
    }

    #[inline]
    fn cell_index(&self, cell: Cell) -> usize {
        cell.y * self.fine_cols + cell.x
    }

    #[inline]
    fn cell_from_index(&self, index: usize) -> Cell {
        Cell::new(index % self.fine_cols, index / self.fine_cols)
    }

    /// Rebuild cumulative rows against the landscape's current densities.
    /// Called at construction and whenever a map epoch changes the
    /// landscape.
    pub fn rebuild_rows(&mut self, landscape: &Landscape) -> Result<()> {
        let Some(raw) = &self.raw else {
            return Ok(());
        };
        let cells = self.fine_rows * self.fine_cols;
        let mut cumulative = Grid::new(cells, cells, 0.0)?;
        for source in 0..cells {
            let mut running = 0.0;
            for destination in 0..cells {
                let cell = self.cell_from_index(destination);
                let capacity =
                    landscape.value_fine(cell.x as i64, cell.y as i64, 0.0)?;
                if capacity > 0 {
                    running += *raw.get(source, destination);
                }
                *cumulative.get_mut(source, destination) = running;
            }
            let source_cell = self.cell_from_index(source);
            let source_capacity =
                landscape.value_fine(source_cell.x as i64, source_cell.y as i64, 0.0)?;
            if running <= 0.0 && source_capacity > 0 {
                return Err(SimError::config(format!(
                    "dispersal row for habitable cell {source_cell} has zero total mass"
                )));
            }
        }
        self.cumulative = Some(cumulative);
        // Any previously-finalised Gillespie rows are stale now.
        self.no_self = None;
        self.self_probability = None;
        Ok(())
    }

    /// Finalise the Gillespie view: per-cell self-dispersal probability
    /// and cumulative rows excluding the self-dispersal mass.
    pub fn finalise_self_dispersal(&mut self, landscape: &Landscape) -> Result<()> {
        if self.cumulative.is_none() {
            self.rebuild_rows(landscape)?;
        }
        if self.raw.is_none() {
            return Err(SimError::config(
                "Gillespie requires an empirical dispersal map",
            ));
        }
        let cumulative = self.cumulative.as_ref().expect("rows rebuilt above");
        let cells = self.fine_rows * self.fine_cols;
        let mut no_self = Grid::new(cells, cells, 0.0)?;
        let mut self_probability = vec![0.0; cells];
        for source in 0..cells {
            let total = *cumulative.get(source, cells - 1);
            if total <= 0.0 {
                continue;
            }
            let mut running = 0.0;
            for destination in 0..cells {
                let step =
                    *cumulative.get(source, destination) - if destination == 0 {
                        0.0
                    } else {
                        *cumulative.get(source, destination - 1)
                    };
                if destination != source {
                    running += step;
                }
                *no_self.get_mut(source, destination) = running;
            }
            let self_mass = *cumulative.get(source, source)
                - if source == 0 {
                    0.0
                } else {
                    *cumulative.get(source, source - 1)
                };
            self_probability[source] = self_mass / total;
        }
        self.no_self = Some(no_self);
        self.self_probability = Some(self_probability);
        debug!("finalised cumulative dispersal rows excluding self-dispersal");
        Ok(())
    }

    /// Probability of a dispersal event staying in its source cell.
    pub fn self_dispersal_probability(&self, cell: Cell) -> Result<f64> {
        let probabilities = self.self_probability.as_ref().ok_or_else(|| {
            SimError::invariant("self-dispersal probabilities not finalised".to_string())
        })?;
        Ok(probabilities[self.cell_index(cell)])
    }

    fn draw_distance(&self, rng: &mut RandomSource) -> f64 {
        match self.method {
            DispersalMethod::Normal => rng.normal_distance(self.sigma),
            DispersalMethod::FatTail => rng.fat_tail_distance(self.sigma, self.tau),
            DispersalMethod::NormalUniform => {
                rng.norm_uniform_distance(self.sigma, self.m_probability, self.cutoff)
            }
            DispersalMethod::Empirical => unreachable!("empirical draws use the matrix"),
        }
    }

    /// First destination whose cumulative mass strictly exceeds `target`;
    /// zero-mass destinations can never be selected.
    fn search_row(row_cumulative: impl Fn(usize) -> f64, cells: usize, target: f64) -> usize {
        let mut low = 0;
        let mut high = cells;
        while low < high {
            let mid = (low + high) / 2;
            if row_cumulative(mid) <= target {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low.min(cells - 1)
    }

    fn draw_empirical(
        &self,
        rng: &mut RandomSource,
        rows: &Grid<f64>,
        source: Cell,
    ) -> Result<Cell> {
        let cells = self.fine_rows * self.fine_cols;
        let source_index = self.cell_index(source);
        let total = *rows.get(source_index, cells - 1);
        if total <= 0.0 {
            return Err(SimError::invariant(format!(
                "dispersal attempted from cell {source} with zero outgoing mass"
            )));
        }
        for _ in 0..MAX_KERNEL_REJECTIONS {
            let target = rng.uniform01() * total;
            let destination =
                Self::search_row(|i| *rows.get(source_index, i), cells, target);
            if self.restrict_self && destination == source_index {
                continue;
            }
            return Ok(self.cell_from_index(destination));
        }
        Err(SimError::invariant(format!(
            "empirical dispersal from {source} rejected {MAX_KERNEL_REJECTIONS} draws"
        )))
    }

    /// Move a lineage to a freshly drawn destination, in place.
    pub fn disperse(
        &self,
        rng: &mut RandomSource,
        landscape: &Landscape,
        location: &mut MapLocation,
        generation: f64,
    ) -> Result<()> {
        if let Some(rows) = &self.cumulative {
            let source = landscape.cell_of(*location)?;
            let destination = self.draw_empirical(rng, rows, source)?;
            *location = landscape.fine_to_sample(destination);
            return Ok(());
        }
        let origin = *location;
        for _ in 0..MAX_KERNEL_REJECTIONS {
            let distance = self.draw_distance(rng);
            let angle = rng.direction();
            let Some(destination) =
                landscape.run_dispersal(distance, angle, origin, self.relative_cost, generation)?
            else {
                continue;
            };
            if self.restrict_self && destination == origin {
                continue;
            }
            *location = destination;
            return Ok(());
        }
        Err(SimError::invariant(format!(
            "dispersal from {origin} rejected {MAX_KERNEL_REJECTIONS} kernel draws"
        )))
    }

    /// Gillespie dispersal: as [`disperse`] but self-dispersal is excluded
    /// by construction.
    pub fn disperse_excluding_self(
        &self,
        rng: &mut RandomSource,
        landscape: &Landscape,
        location: &mut MapLocation,
    ) -> Result<()> {
        let rows = self.no_self.as_ref().ok_or_else(|| {
            SimError::invariant("no-self dispersal rows not finalised".to_string())
        })?;
        let source = landscape.cell_of(*location)?;
        let destination = self.draw_empirical(rng, rows, source)?;
        *location = landscape.fine_to_sample(destination);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LandscapePolicy;
    use crate::landscape::LandscapeInputs;

    fn setup(size: usize, method: DispersalMethod) -> (SimParameters, Landscape) {
        let mut params = SimParameters {
            fine_map_x_size: size,
            fine_map_y_size: size,
            dispersal_method: method,
            sigma: 1.0,
            landscape_type: LandscapePolicy::TiledFine,
            ..SimParameters::default()
        };
        if method == DispersalMethod::Empirical {
            params.dispersal_file = Some("matrix.csv".into());
        }
        params.validate().unwrap();
        let landscape = Landscape::new(&params, &LandscapeInputs::default()).unwrap();
        (params, landscape)
    }

    fn identity_plus_right(size: usize) -> Grid<f64> {
        // Each cell: 0.5 stay, 0.5 move one column right (wrapping).
        let cells = size * size;
        let mut matrix = Grid::new(cells, cells, 0.0).unwrap();
        for y in 0..size {
            for x in 0..size {
                let source = y * size + x;
                let right = y * size + (x + 1) % size;
                *matrix.get_mut(source, source) = 0.5;
                *matrix.get_mut(source, right) = 0.5;
            }
        }
        matrix
    }

    #[test]
    fn empirical_draws_follow_the_matrix() {
        let (params, landscape) = setup(3, DispersalMethod::Empirical);
        let coordinator =
            DispersalCoordinator::new(&params, Some(identity_plus_right(3)), &landscape).unwrap();
        let mut rng = RandomSource::with_seed(17);
        let mut stayed = 0;
        let mut moved = 0;
        for _ in 0..2000 {
            let mut location = MapLocation::new(1, 1, 0, 0);
            coordinator
                .disperse(&mut rng, &landscape, &mut location, 0.0)
                .unwrap();
            match (location.x, location.y) {
                (1, 1) => stayed += 1,
                (2, 1) => moved += 1,
                other => panic!("unexpected destination {other:?}"),
            }
        }
        assert!(stayed > 800 && moved > 800, "stayed={stayed} moved={moved}");
    }

    #[test]
    fn no_self_rows_never_stay_put() {
        let (params, landscape) = setup(3, DispersalMethod::Empirical);
        let mut coordinator =
            DispersalCoordinator::new(&params, Some(identity_plus_right(3)), &landscape).unwrap();
        coordinator.finalise_self_dispersal(&landscape).unwrap();
        assert!(
            (coordinator
                .self_dispersal_probability(Cell::new(1, 1))
                .unwrap()
                - 0.5)
                .abs()
                < 1e-12
        );
        let mut rng = RandomSource::with_seed(23);
        for _ in 0..500 {
            let mut location = MapLocation::new(1, 1, 0, 0);
            coordinator
                .disperse_excluding_self(&mut rng, &landscape, &mut location)
                .unwrap();
            assert_eq!((location.x, location.y), (2, 1));
        }
    }

    #[test]
    fn parametric_dispersal_stays_on_habitat() {
        let (params, landscape) = setup(5, DispersalMethod::Normal);
        let coordinator = DispersalCoordinator::new(&params, None, &landscape).unwrap();
        let mut rng = RandomSource::with_seed(3);
        for _ in 0..500 {
            let mut location = MapLocation::new(2, 2, 0, 0);
            coordinator
                .disperse(&mut rng, &landscape, &mut location, 0.0)
                .unwrap();
            assert!(
                landscape.capacity_at(location, 0.0).unwrap() > 0,
                "dispersed to empty cell {location}"
            );
        }
    }

    #[test]
    fn restrict_self_rejects_the_source_cell() {
        let (mut params, landscape) = setup(3, DispersalMethod::Empirical);
        params.restrict_self = true;
        let coordinator =
            DispersalCoordinator::new(&params, Some(identity_plus_right(3)), &landscape).unwrap();
        let mut rng = RandomSource::with_seed(29);
        for _ in 0..200 {
            let mut location = MapLocation::new(0, 0, 0, 0);
            coordinator
                .disperse(&mut rng, &landscape, &mut location, 0.0)
                .unwrap();
            assert_eq!((location.x, location.y), (1, 0));
        }
    }
}
