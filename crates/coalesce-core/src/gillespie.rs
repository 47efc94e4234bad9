//! Gillespie event scheduling.
//!
//! When few lineages remain, most per-event steps touch empty cells; the
//! Gillespie algorithm schedules, per inhabited fine cell, the time of the
//! next event there and processes cells in time order from a heap. Event
//! times are exponential with rate `λ = P_in_cell · d_local / d_total · n`,
//! drawn from the uniform cached on the cell so a re-queued event keeps
//! its clock until it fires.

use crate::engine::{RunOutcome, Simulation};
use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::heap::{EventHeap, EventNode, EventType};
use crate::location::{Cell, MapLocation};
use crate::rng::RandomSource;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// Slot-table sentinel for cells with no scheduled event.
pub const UNUSED: usize = usize::MAX;

/// What happens inside a cell when its event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellEventType {
    Speciation,
    Dispersal,
    Coalescence,
}

/// Aggregated per-cell rates plus the cached uniform driving the cell's
/// event clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GillespieProbability {
    pub location: MapLocation,
    pub speciation_probability: f64,
    pub coalescence_probability: f64,
    pub dispersal_outside_cell_probability: f64,
    pub random_number: f64,
}

impl GillespieProbability {
    #[must_use]
    pub fn new(location: MapLocation) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    /// Probability that a birth-death event in this cell affects the
    /// coalescence process at all.
    #[must_use]
    pub fn in_cell_probability(&self) -> f64 {
        let spec = self.speciation_probability;
        let out = self.dispersal_outside_cell_probability;
        spec + (1.0 - spec) * ((1.0 - out) * self.coalescence_probability + out)
    }

    /// Rate of the exponential clock, per birth-death event on the whole
    /// landscape.
    #[must_use]
    pub fn lambda(&self, local_death_rate: f64, summed_death_rate: f64, n: u64) -> f64 {
        self.in_cell_probability() * local_death_rate * n as f64 / summed_death_rate
    }

    /// Time from now until this cell's next event, using the cached
    /// uniform.
    #[must_use]
    pub fn time_to_next_event(
        &self,
        local_death_rate: f64,
        summed_death_rate: f64,
        n: u64,
    ) -> f64 {
        RandomSource::exponential(
            self.lambda(local_death_rate, summed_death_rate, n),
            self.random_number,
        )
    }

    /// Categorical draw over the three cell events, rescaled by the
    /// in-cell probability.
    #[must_use]
    pub fn generate_event(&self, uniform: f64) -> CellEventType {
        let p = uniform * self.in_cell_probability();
        let spec = self.speciation_probability;
        if p < spec {
            CellEventType::Speciation
        } else if p < spec + (1.0 - spec) * self.dispersal_outside_cell_probability {
            CellEventType::Dispersal
        } else {
            CellEventType::Coalescence
        }
    }
}

/// All Gillespie runtime state; rebuilt from scratch after map and sample
/// events.
#[derive(Debug, Clone)]
pub struct GillespieState {
    pub(crate) probabilities: Grid<GillespieProbability>,
    pub(crate) heap: EventHeap,
    pub(crate) heap_index: Grid<usize>,
    pub(crate) summed_death_rate: f64,
}

impl GillespieState {
    #[must_use]
    pub fn heap(&self) -> &EventHeap {
        &self.heap
    }

    #[must_use]
    pub fn heap_index(&self) -> &Grid<usize> {
        &self.heap_index
    }

    #[must_use]
    pub fn probabilities(&self) -> &Grid<GillespieProbability> {
        &self.probabilities
    }
}

fn writeback(heap_index: &mut Grid<usize>) -> impl FnMut(&EventNode, usize) + '_ {
    move |node, index| {
        if node.event == EventType::Cell {
            *heap_index.get_mut(node.cell.y, node.cell.x) = index;
        }
    }
}

impl Simulation {
    /// Per-event until the live count drops below `threshold`, then
    /// Gillespie to the end.
    pub(crate) fn run_with_gillespie(
        &mut self,
        threshold: usize,
        started: Instant,
    ) -> Result<RunOutcome> {
        let mut steps_this_run = 0u64;
        while self.store.endactive > 1
            && self.continue_sim
            && self.store.endactive >= threshold
        {
            self.single_step()?;
            steps_this_run += 1;
            if self.out_of_budget(&started, steps_this_run) {
                return self.stop_simulation();
            }
        }
        if self.store.endactive <= 1 || !self.continue_sim {
            return self.stop_simulation();
        }
        info!(
            lineages = self.store.endactive,
            generation = self.generation,
            "switching to the Gillespie algorithm"
        );
        self.setup_gillespie()?;
        while self.store.endactive > 1 {
            self.gillespie_step()?;
        }
        self.gillespie = None;
        self.stop_simulation()
    }

    /// Build the probability grid and the event heap from the current
    /// lineage distribution.
    pub fn setup_gillespie(&mut self) -> Result<()> {
        self.dispersal.finalise_self_dispersal(&self.landscape)?;
        let rows = self.landscape.fine_rows();
        let cols = self.landscape.fine_cols();
        let mut state = GillespieState {
            probabilities: Grid::new(rows, cols, GillespieProbability::default())?,
            heap: EventHeap::new(),
            heap_index: Grid::new(rows, cols, UNUSED)?,
            summed_death_rate: 0.0,
        };
        self.populate_gillespie(&mut state)?;
        self.gillespie = Some(state);
        self.validate_gillespie()?;
        Ok(())
    }

    /// Total death-weighted density over the fine map; the denominator of
    /// every cell's event rate.
    fn summed_death_rate(&self) -> Result<f64> {
        let mut total = 0.0;
        for y in 0..self.landscape.fine_rows() {
            for x in 0..self.landscape.fine_cols() {
                let density =
                    self.landscape.value_fine(x as i64, y as i64, self.generation)?;
                total += self.death.get(Cell::new(x, y)) * f64::from(density);
            }
        }
        if total <= 0.0 {
            return Err(SimError::invariant(
                "summed death rate is zero; no habitable cells remain".to_string(),
            ));
        }
        Ok(total)
    }

    fn coalescence_probability(&self, location: MapLocation) -> Result<f64> {
        let lineages = self.lineages_at(location);
        if lineages <= 1 {
            return Ok(0.0);
        }
        let capacity = self.landscape.capacity_at(location, self.generation)?;
        if capacity == 0 {
            return Ok(0.0);
        }
        Ok(((lineages as f64 - 1.0) / f64::from(capacity)).min(1.0))
    }

    /// (Re)compute every cell's probabilities and rebuild the event list,
    /// including the scheduled map and sample events.
    fn populate_gillespie(&mut self, state: &mut GillespieState) -> Result<()> {
        let rows = state.probabilities.rows();
        let cols = state.probabilities.cols();
        state.heap.clear();
        state.heap_index.fill(UNUSED);
        state.summed_death_rate = self.summed_death_rate()?;
        debug!(summed_death_rate = state.summed_death_rate, "building event list");
        for y in 0..rows {
            for x in 0..cols {
                let cell = Cell::new(x, y);
                let location = self.landscape.fine_to_sample(cell);
                let mut probability = GillespieProbability::new(location);
                probability.dispersal_outside_cell_probability =
                    1.0 - self.dispersal.self_dispersal_probability(cell)?;
                probability.coalescence_probability = self.coalescence_probability(location)?;
                probability.speciation_probability = self.params.min_speciation_rate;
                probability.random_number = self.rng.uniform01();
                *state.probabilities.get_mut(y, x) = probability;
            }
        }
        let mut on_move = writeback(&mut state.heap_index);
        for y in 0..rows {
            for x in 0..cols {
                let cell = Cell::new(x, y);
                let probability = state.probabilities.get(y, x);
                let location = probability.location;
                if self.lineages_at(location) == 0 {
                    continue;
                }
                let n = self.landscape.capacity_at(location, self.generation)?;
                let dt = probability.time_to_next_event(
                    self.death.get(cell),
                    state.summed_death_rate,
                    u64::from(n),
                );
                state
                    .heap
                    .push(cell, self.generation + dt, EventType::Cell, &mut on_move);
            }
        }
        if let Some(update_at) = self.landscape.next_map_update() {
            if update_at > self.generation {
                state.heap.push(
                    Cell::default(),
                    update_at,
                    EventType::MapUpdate,
                    &mut on_move,
                );
            }
        }
        for index in self.time_reference..self.reference_times.len() {
            let sample_at = self.reference_times[index];
            if sample_at > self.generation {
                state
                    .heap
                    .push(Cell::default(), sample_at, EventType::Sample, &mut on_move);
            }
        }
        Ok(())
    }

    /// Pop-free dispatch of the soonest event.
    pub fn gillespie_step(&mut self) -> Result<()> {
        let mut state = self
            .gillespie
            .take()
            .ok_or_else(|| SimError::invariant("Gillespie state not initialised".to_string()))?;
        let result = self.gillespie_step_inner(&mut state);
        self.gillespie = Some(state);
        result?;
        self.validate_gillespie()
    }

    fn gillespie_step_inner(&mut self, state: &mut GillespieState) -> Result<()> {
        let top = *state.heap.peek().ok_or_else(|| {
            SimError::invariant(format!(
                "event heap is empty with {} lineages remaining",
                self.store.endactive
            ))
        })?;
        self.steps += (top.time - self.generation) * self.store.endactive as f64;
        self.generation = top.time;
        match top.event {
            EventType::Cell => self.gillespie_cell_event(state, top.cell),
            EventType::MapUpdate => {
                state.heap.pop(&mut writeback(&mut state.heap_index));
                if !self.landscape.update(self.generation) {
                    return Err(SimError::invariant(format!(
                        "map event fired at generation {} but no map changed",
                        self.generation
                    )));
                }
                self.dispersal.rebuild_rows(&self.landscape)?;
                self.dispersal.finalise_self_dispersal(&self.landscape)?;
                self.populate_gillespie(state)
            }
            EventType::Sample => {
                state.heap.pop(&mut writeback(&mut state.heap_index));
                self.check_time_update()?;
                self.populate_gillespie(state)
            }
        }
    }

    fn gillespie_cell_event(&mut self, state: &mut GillespieState, cell: Cell) -> Result<()> {
        let probability = state.probabilities.get(cell.y, cell.x);
        let location = probability.location;
        let event = probability.generate_event(self.rng.uniform01());
        state.probabilities.get_mut(cell.y, cell.x).random_number = self.rng.uniform01();
        match event {
            CellEventType::Speciation => {
                let chosen = self.select_random_lineage(location)?;
                self.age_lineage(chosen);
                let reference = self.store.lineage(chosen).reference;
                if self.store.node(reference).speciated {
                    return Err(SimError::invariant(format!(
                        "Gillespie speciation chose an already-speciated node {reference}"
                    )));
                }
                self.store.node_mut(reference).speciated = true;
                self.remove_old_position(chosen)?;
                self.switch_positions(chosen)?;
                if self.lineages_at(location) > 0 {
                    self.refresh_cell(state, cell)?;
                } else {
                    let popped = state.heap.pop(&mut writeback(&mut state.heap_index));
                    debug_assert!(popped.is_some_and(|node| node.cell == cell));
                    *state.heap_index.get_mut(cell.y, cell.x) = UNUSED;
                }
            }
            CellEventType::Coalescence => {
                let (first, second) = self.select_two_random_lineages(location)?;
                self.age_lineage(first);
                self.coalescence_event(first, second)?;
                self.refresh_cell(state, cell)?;
            }
            CellEventType::Dispersal => {
                let chosen = self.select_random_lineage(location)?;
                self.remove_old_position(chosen)?;
                let origin = self.store.lineage(chosen).location;
                let mut destination;
                loop {
                    destination = origin;
                    self.dispersal.disperse_excluding_self(
                        &mut self.rng,
                        &self.landscape,
                        &mut destination,
                    )?;
                    if self.reproduction_accepts(destination) {
                        break;
                    }
                }
                self.store.lineage_mut(chosen).location = destination;
                if let Some(other) = self.settle_at_destination(chosen)? {
                    self.coalescence_event(chosen, other)?;
                }
                let destination_cell = self.landscape.cell_of(destination)?;
                // Origin side: reschedule, or retire the node if the cell
                // emptied.
                if self.lineages_at(location) > 0 {
                    self.refresh_cell(state, cell)?;
                } else {
                    let popped = state.heap.pop(&mut writeback(&mut state.heap_index));
                    debug_assert!(popped.is_some_and(|node| node.cell == cell));
                    *state.heap_index.get_mut(cell.y, cell.x) = UNUSED;
                }
                // Destination side: first occupant pushes a fresh node,
                // anything else is rescheduled with its new occupancy.
                if *state.heap_index.get(destination_cell.y, destination_cell.x) == UNUSED {
                    self.push_cell_event(state, destination_cell)?;
                } else {
                    self.refresh_cell(state, destination_cell)?;
                }
            }
        }
        Ok(())
    }

    /// Age a lineage to the current (rounded) generation before it leaves
    /// the simulation.
    fn age_lineage(&mut self, lineage_index: usize) {
        let node = self.store.node_of_mut(lineage_index);
        node.generations_existed = (self.generation.round() - node.generation).max(0.0) as u64;
    }

    fn select_random_lineage(&mut self, location: MapLocation) -> Result<usize> {
        let ids = self.lineage_ids_at(location);
        if ids.is_empty() {
            return Err(SimError::invariant(format!(
                "no lineages at {location} for a scheduled cell event"
            )));
        }
        Ok(ids[self.rng.uint_in(ids.len() as u64 - 1) as usize])
    }

    fn select_two_random_lineages(&mut self, location: MapLocation) -> Result<(usize, usize)> {
        let ids = self.lineage_ids_at(location);
        if ids.len() < 2 {
            return Err(SimError::invariant(format!(
                "cannot select two lineages at {location}: only {} present",
                ids.len()
            )));
        }
        let first = ids[self.rng.uint_in(ids.len() as u64 - 1) as usize];
        loop {
            let second = ids[self.rng.uint_in(ids.len() as u64 - 1) as usize];
            if second != first {
                return Ok((first, second));
            }
        }
    }

    /// Recompute a cell's coalescence probability, draw it a fresh clock
    /// and re-sift its heap node.
    fn refresh_cell(&mut self, state: &mut GillespieState, cell: Cell) -> Result<()> {
        let location = state.probabilities.get(cell.y, cell.x).location;
        let coalescence = self.coalescence_probability(location)?;
        let random_number = self.rng.uniform01();
        let n = self.landscape.capacity_at(location, self.generation)?;
        let probability = state.probabilities.get_mut(cell.y, cell.x);
        probability.coalescence_probability = coalescence;
        probability.random_number = random_number;
        let dt = probability.time_to_next_event(
            self.death.get(cell),
            state.summed_death_rate,
            u64::from(n),
        );
        let index = *state.heap_index.get(cell.y, cell.x);
        if index == UNUSED {
            return Err(SimError::invariant(format!(
                "refreshing cell {cell} with no heap entry"
            )));
        }
        state.heap.update_time(
            index,
            self.generation + dt,
            &mut writeback(&mut state.heap_index),
        );
        Ok(())
    }

    /// Schedule a first event for a newly-occupied cell.
    fn push_cell_event(&mut self, state: &mut GillespieState, cell: Cell) -> Result<()> {
        let location = state.probabilities.get(cell.y, cell.x).location;
        let coalescence = self.coalescence_probability(location)?;
        let random_number = self.rng.uniform01();
        let n = self.landscape.capacity_at(location, self.generation)?;
        let probability = state.probabilities.get_mut(cell.y, cell.x);
        probability.coalescence_probability = coalescence;
        probability.random_number = random_number;
        let dt = probability.time_to_next_event(
            self.death.get(cell),
            state.summed_death_rate,
            u64::from(n),
        );
        state.heap.push(
            cell,
            self.generation + dt,
            EventType::Cell,
            &mut writeback(&mut state.heap_index),
        );
        Ok(())
    }

    /// Heap discipline check: the heap property holds and the slot table
    /// agrees with the heap in both directions.
    pub fn validate_gillespie(&self) -> Result<()> {
        if !self.params.strictness.heap_validation {
            return Ok(());
        }
        let Some(state) = &self.gillespie else {
            return Ok(());
        };
        if !state.heap.is_valid() {
            return Err(SimError::invariant(
                "the heap property has been broken".to_string(),
            ));
        }
        for (index, node) in state.heap.iter().enumerate() {
            if node.event == EventType::Cell
                && *state.heap_index.get(node.cell.y, node.cell.x) != index
            {
                return Err(SimError::invariant(format!(
                    "heap node {index} for cell {} not reflected in the slot table",
                    node.cell
                )));
            }
        }
        for y in 0..state.heap_index.rows() {
            for x in 0..state.heap_index.cols() {
                let slot = *state.heap_index.get(y, x);
                if slot == UNUSED {
                    continue;
                }
                if slot >= state.heap.len() {
                    return Err(SimError::invariant(format!(
                        "slot table points cell ({x}, {y}) at index {slot} beyond the heap"
                    )));
                }
                let node = state.heap.node(slot);
                if node.cell != Cell::new(x, y) {
                    return Err(SimError::invariant(format!(
                        "slot table for cell ({x}, {y}) points at a node for {}",
                        node.cell
                    )));
                }
            }
        }
        Ok(())
    }

    /// Diagnostics accessor for tests.
    #[must_use]
    pub fn gillespie_state(&self) -> Option<&GillespieState> {
        self.gillespie.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_cell_probability_composes_the_three_rates() {
        let mut probability = GillespieProbability::new(MapLocation::default());
        probability.speciation_probability = 0.1;
        probability.dispersal_outside_cell_probability = 0.5;
        probability.coalescence_probability = 0.4;
        let expected = 0.1 + 0.9 * (0.5 * 0.4 + 0.5);
        assert!((probability.in_cell_probability() - expected).abs() < 1e-12);
    }

    #[test]
    fn event_draw_partitions_the_unit_interval() {
        let mut probability = GillespieProbability::new(MapLocation::default());
        probability.speciation_probability = 0.2;
        probability.dispersal_outside_cell_probability = 0.5;
        probability.coalescence_probability = 1.0;
        let in_cell = probability.in_cell_probability();
        assert_eq!(
            probability.generate_event(0.19 / in_cell),
            CellEventType::Speciation
        );
        assert_eq!(
            probability.generate_event(0.21 / in_cell),
            CellEventType::Dispersal
        );
        assert_eq!(
            probability.generate_event(0.99),
            CellEventType::Coalescence
        );
    }

    #[test]
    fn cached_uniform_keeps_the_clock() {
        let mut probability = GillespieProbability::new(MapLocation::default());
        probability.speciation_probability = 0.01;
        probability.dispersal_outside_cell_probability = 0.3;
        probability.coalescence_probability = 0.2;
        probability.random_number = 0.5;
        let a = probability.time_to_next_event(1.0, 10.0, 4);
        let b = probability.time_to_next_event(1.0, 10.0, 4);
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
