//! The per-event coalescence engine.
//!
//! Each step rewinds one death/rebirth event: a uniform lineage is chosen
//! (filtered by the death map), tested for speciation against its stored
//! uniform, and otherwise dispersed backwards to the cell its parent
//! occupied, where it may coalesce with a lineage already there. The
//! engine owns the lineage store, the per-cell index and all maps for the
//! duration of a run; community building happens afterwards on the frozen
//! genealogy.

use crate::activity::ActivityMap;
use crate::cells::CellList;
use crate::config::{SimParameters, StrictnessPolicy};
use crate::dispersal::DispersalCoordinator;
use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::landscape::{Landscape, LandscapeInputs};
use crate::lineage::{
    protracted_speciation_occurs, speciation_occurs, GenealogyNode, Lineage, LineageStore,
};
use crate::location::MapLocation;
use crate::rng::RandomSource;
use crate::sample::SampleMask;
use std::time::Instant;
use tracing::{info, warn};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All lineages coalesced or speciated; the genealogy is complete.
    Complete,
    /// The wall clock (or a step limit) ran out; state must be dumped.
    Paused,
}

/// Everything the engine consumes besides the parameter record. Raster
/// decoding is upstream; these are dense numeric grids.
#[derive(Debug, Clone, Default)]
pub struct SimulationInputs {
    pub landscape: LandscapeInputs,
    pub sample_mask: Option<Grid<f64>>,
    pub death: Option<Grid<f64>>,
    pub reproduction: Option<Grid<f64>>,
    pub dispersal_matrix: Option<Grid<f64>>,
}

/// The spatially explicit coalescence simulation.
pub struct Simulation {
    pub(crate) params: SimParameters,
    pub(crate) rng: RandomSource,
    pub(crate) landscape: Landscape,
    pub(crate) dispersal: DispersalCoordinator,
    pub(crate) death: ActivityMap,
    pub(crate) reproduction: ActivityMap,
    pub(crate) mask: SampleMask,
    pub(crate) store: LineageStore,
    pub(crate) cells: Grid<CellList>,
    pub(crate) generation: f64,
    pub(crate) steps: f64,
    pub(crate) reference_times: Vec<f64>,
    pub(crate) time_reference: usize,
    pub(crate) uses_temporal_sampling: bool,
    pub(crate) continue_sim: bool,
    pub(crate) sim_complete: bool,
    pub(crate) start_lineages: usize,
    pub(crate) gillespie: Option<crate::gillespie::GillespieState>,
    /// Test hook: pause after this many steps of the current run.
    pub(crate) step_limit: Option<u64>,
}

impl Simulation {
    /// Build and seed a simulation from a validated parameter record and
    /// its input grids.
    pub fn new(mut params: SimParameters, inputs: SimulationInputs) -> Result<Self> {
        params.validate()?;
        let rng = RandomSource::with_seed(params.seed);
        let landscape = Landscape::new(&params, &inputs.landscape)?;
        let dispersal =
            DispersalCoordinator::new(&params, inputs.dispersal_matrix, &landscape)?;
        let death = match inputs.death {
            Some(grid) => ActivityMap::from_grid(grid, &landscape)?,
            None => ActivityMap::null(),
        };
        // The reproduction map shares the death map when the same file
        // backs both.
        let reproduction = match inputs.reproduction {
            Some(grid) => ActivityMap::from_grid(grid, &landscape)?,
            None => ActivityMap::null(),
        };
        death.verify_against(&landscape, "death")?;
        reproduction.verify_against(&landscape, "reproduction")?;
        let mask = SampleMask::new(&params, inputs.sample_mask)?;

        let mut reference_times = params.times.clone();
        if reference_times.first() != Some(&0.0) {
            reference_times.insert(0, 0.0);
        }
        let uses_temporal_sampling = reference_times.len() > 1;

        let mut simulation = Self {
            rng,
            landscape,
            dispersal,
            death,
            reproduction,
            mask,
            store: LineageStore::sized_for(0),
            cells: Grid::new(params.grid_y_size, params.grid_x_size, CellList::default())?,
            generation: 0.0,
            steps: 0.0,
            reference_times,
            time_reference: 1,
            uses_temporal_sampling,
            continue_sim: true,
            sim_complete: false,
            start_lineages: 0,
            gillespie: None,
            step_limit: None,
            params,
        };
        simulation.fill_objects()?;
        Ok(simulation)
    }

    /// Number of individuals sampled from a cell at a given generation.
    pub(crate) fn individuals_sampled(
        &self,
        location: MapLocation,
        generation: f64,
    ) -> Result<u64> {
        let capacity = self.landscape.capacity_at(location, generation)?;
        let fraction = self.mask.exact_value(location);
        Ok((self.params.deme_sample * f64::from(capacity) * fraction)
            .floor()
            .max(0.0) as u64)
    }

    /// Seed the lineage store and cell index from the sample mask.
    fn fill_objects(&mut self) -> Result<()> {
        for y in 0..self.params.grid_y_size {
            for x in 0..self.params.grid_x_size {
                let capacity = self
                    .landscape
                    .capacity_at(MapLocation::new(x as i64, y as i64, 0, 0), 0.0)?;
                self.cells.get_mut(y, x).initialise(capacity);
            }
        }
        let mut initial = 0u64;
        for sy in 0..self.mask.height() {
            for sx in 0..self.mask.width() {
                let location = self.mask.recalculate_coordinates(sx, sy);
                let sample_amount = self.individuals_sampled(location, 0.0)?;
                initial += sample_amount;
            }
        }
        if initial == 0 {
            return Err(SimError::config(
                "initial count is 0; no individuals to simulate",
            ));
        }
        info!(individuals = initial, "seeding simulation");
        self.store = LineageStore::sized_for(initial as usize);

        for sy in 0..self.mask.height() {
            for sx in 0..self.mask.width() {
                let location = self.mask.recalculate_coordinates(sx, sy);
                let sample_amount = self.individuals_sampled(location, 0.0)?;
                for k in 0..sample_amount {
                    if location.is_on_grid() {
                        let cell = self
                            .cells
                            .get(location.y as usize, location.x as usize);
                        if k >= u64::from(cell.max_size()) && self.params.deme_sample <= 1.0 {
                            break;
                        }
                    }
                    let spec_rate = self.rng.uniform01();
                    let node = self
                        .store
                        .push_node(GenealogyNode::tip(location, 0.0, spec_rate));
                    let index = self.store.push_lineage(Lineage::new(location, node, 0));
                    if location.is_on_grid() {
                        let position = self
                            .cells
                            .get_mut(location.y as usize, location.x as usize)
                            .add_lineage(index)?;
                        self.store.lineage_mut(index).list_position = position;
                    } else {
                        let nwrap = self
                            .cells
                            .get_mut(location.y as usize, location.x as usize)
                            .add_wrapped(index);
                        self.store.lineage_mut(index).nwrap = nwrap;
                    }
                }
            }
        }
        self.start_lineages = self.store.endactive;
        if self.params.strictness.lineage_validation {
            self.validate_lineages()?;
        }
        Ok(())
    }

    // Accessors, mostly for tests and the community builder.

    #[must_use]
    pub fn params(&self) -> &SimParameters {
        &self.params
    }

    #[must_use]
    pub fn store(&self) -> &LineageStore {
        &self.store
    }

    /// Community builder over this simulation's frozen genealogy.
    pub fn community_builder(&mut self) -> crate::community::CommunityBuilder<'_> {
        crate::community::CommunityBuilder::new(
            &mut self.store,
            self.params.min_speciation_rate,
            self.params.grid_x_size,
            self.params.grid_y_size,
        )
    }

    #[must_use]
    pub const fn generation(&self) -> f64 {
        self.generation
    }

    #[must_use]
    pub const fn steps(&self) -> f64 {
        self.steps
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.sim_complete
    }

    #[must_use]
    pub const fn strictness(&self) -> StrictnessPolicy {
        self.params.strictness
    }

    /// Pause after `limit` further steps; test hook for deterministic
    /// pause points.
    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = Some(limit);
    }

    /// Cooperative cancellation, checked once per step.
    pub fn cancel(&mut self) {
        self.continue_sim = false;
    }

    /// Run to completion or to the wall-clock/step budget.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let started = Instant::now();
        info!(
            lineages = self.store.endactive,
            seed = self.params.seed,
            task = self.params.task,
            "beginning coalescence simulation"
        );
        if self.store.endactive < 2 {
            return self.stop_simulation();
        }
        if let Some(threshold) = self.params.gillespie_threshold {
            return self.run_with_gillespie(threshold, started);
        }
        let mut steps_this_run = 0u64;
        while self.store.endactive > 1 && self.continue_sim {
            self.single_step()?;
            steps_this_run += 1;
            if self.out_of_budget(&started, steps_this_run) {
                break;
            }
        }
        self.stop_simulation()
    }

    pub(crate) fn out_of_budget(&self, started: &Instant, steps_this_run: u64) -> bool {
        if let Some(limit) = self.step_limit {
            if steps_this_run >= limit {
                return true;
            }
        }
        steps_this_run >= 100 && started.elapsed().as_secs() >= self.params.max_time
    }

    /// One backwards event.
    pub fn single_step(&mut self) -> Result<()> {
        if self.store.endactive == 0 {
            return Err(SimError::invariant(
                "stepping a simulation with no live lineages".to_string(),
            ));
        }
        self.increment_generation()?;
        if !self.continue_sim {
            return Ok(());
        }
        let chosen = self.choose_random_lineage();
        self.store.node_of_mut(chosen).generations_existed += 1;
        let node = self.store.node_of(chosen);
        if self.check_speciation(node.spec_rate, node.generations_existed) {
            self.speciation(chosen)?;
        } else {
            self.remove_old_position(chosen)?;
            let origin = self.store.lineage(chosen).location;
            let mut location;
            // The reproduction map weights where the parent may have
            // lived; a rejected destination re-samples the kernel.
            loop {
                location = origin;
                self.dispersal.disperse(
                    &mut self.rng,
                    &self.landscape,
                    &mut location,
                    self.generation,
                )?;
                if self.reproduction_accepts(location) {
                    break;
                }
            }
            self.store.lineage_mut(chosen).location = location;
            if let Some(coalchosen) = self.settle_at_destination(chosen)? {
                self.coalescence_event(chosen, coalchosen)?;
            }
        }
        self.check_lonely_survivor()?;
        if self.params.strictness.lineage_validation {
            self.validate_lineages()?;
        }
        if self.params.desired_species > 1 && (self.steps as u64).is_multiple_of(100_000) {
            let estimate = self.estimate_species_count();
            if estimate < self.params.desired_species {
                info!(estimate, "desired species count reached; halting");
                self.continue_sim = false;
            }
        }
        Ok(())
    }

    fn increment_generation(&mut self) -> Result<()> {
        self.steps += 1.0;
        self.generation += 2.0 / self.store.endactive as f64;
        if self.landscape.update(self.generation) {
            self.dispersal.rebuild_rows(&self.landscape)?;
        }
        self.check_time_update()?;
        Ok(())
    }

    /// Advance the temporal-sampling cursor, injecting tips when a sample
    /// point is crossed.
    pub(crate) fn check_time_update(&mut self) -> Result<()> {
        if !self.uses_temporal_sampling || self.time_reference >= self.reference_times.len() {
            return Ok(());
        }
        let next = self.reference_times[self.time_reference];
        if next <= self.generation {
            if next > 0.0 {
                info!(generation = self.generation, "expanding map at sample point");
                self.add_lineages(next)?;
            }
            self.time_reference += 1;
        }
        Ok(())
    }

    /// With temporal sampling, a lone survivor cannot coalesce with
    /// anything until the next sample point injects lineages: speciate it
    /// and jump the clock.
    fn check_lonely_survivor(&mut self) -> Result<()> {
        if !self.uses_temporal_sampling
            || self.store.endactive != 1
            || self.time_reference >= self.reference_times.len()
        {
            return Ok(());
        }
        let next = self.reference_times[self.time_reference];
        if next > self.generation {
            let survivor = self.store.endactive;
            self.store.node_of_mut(survivor).spec_rate = 0.0;
            self.speciation(survivor)?;
            self.generation = next + 1e-12;
            self.check_time_update()?;
            if self.store.endactive < 2 {
                self.continue_sim = false;
            }
        }
        Ok(())
    }

    fn death_accepts(&mut self, location: MapLocation) -> bool {
        if self.death.is_null() {
            return true;
        }
        match self.landscape.cell_of(location) {
            Ok(cell) => self.death.action_occurs(&mut self.rng, cell),
            Err(_) => true,
        }
    }

    pub(crate) fn reproduction_accepts(&mut self, location: MapLocation) -> bool {
        if self.reproduction.is_null() {
            return true;
        }
        match self.landscape.cell_of(location) {
            Ok(cell) => self.reproduction.action_occurs(&mut self.rng, cell),
            Err(_) => true,
        }
    }

    /// Uniform choice over live lineages, redrawn (independently) until
    /// the local death weight accepts.
    fn choose_random_lineage(&mut self) -> usize {
        let mut chosen = self.rng.uint_in(self.store.endactive as u64 - 1) as usize + 1;
        loop {
            let location = self.store.lineage(chosen).location;
            if self.death_accepts(location) {
                return chosen;
            }
            chosen = self.rng.uint_in(self.store.endactive as u64 - 1) as usize + 1;
        }
    }

    /// Speciation test at a fraction under the minimum rate, so the final
    /// sweep at the exact rate always agrees.
    pub(crate) fn check_speciation(&self, spec_rate_draw: f64, generations: u64) -> bool {
        let rate = 0.99999 * self.params.min_speciation_rate;
        match &self.params.protracted {
            Some(window) => protracted_speciation_occurs(spec_rate_draw, rate, generations, window),
            None => speciation_occurs(spec_rate_draw, rate, generations),
        }
    }

    /// Mark the lineage's branch as a new species and retire it.
    pub(crate) fn speciation(&mut self, chosen: usize) -> Result<()> {
        let reference = self.store.lineage(chosen).reference;
        if self.store.node(reference).speciated {
            return Err(SimError::invariant(format!(
                "attempting to speciate an already-speciated node {reference} \
                 (chosen {chosen}, endactive {})",
                self.store.endactive
            )));
        }
        self.store.node_mut(reference).speciated = true;
        self.remove_old_position(chosen)?;
        self.switch_positions(chosen)
    }

    /// Detach a lineage from its cell's bookkeeping.
    pub(crate) fn remove_old_position(&mut self, chosen: usize) -> Result<()> {
        let lineage = self.store.lineage(chosen).clone();
        let (x, y) = (lineage.location.x as usize, lineage.location.y as usize);
        if lineage.nwrap == 0 {
            if !lineage.is_on_grid() {
                return Err(SimError::invariant(format!(
                    "lineage {chosen} has nwrap 0 but location {} is off-grid",
                    lineage.location
                )));
            }
            self.cells.get_mut(y, x).remove_on_grid(lineage.list_position)?;
        } else {
            let shifted = self.cells.get_mut(y, x).remove_wrapped(lineage.nwrap)?;
            for index in shifted {
                let nwrap = &mut self.store.lineage_mut(index).nwrap;
                if *nwrap == 0 {
                    return Err(SimError::invariant(format!(
                        "wrapped list holds lineage {index} with nwrap 0"
                    )));
                }
                *nwrap -= 1;
            }
        }
        let lineage = self.store.lineage_mut(chosen);
        lineage.list_position = 0;
        lineage.nwrap = 0;
        Ok(())
    }

    /// Land a dispersed lineage at its new location. Returns the lineage
    /// it coalesces with, if the destination draw found one.
    pub(crate) fn settle_at_destination(&mut self, chosen: usize) -> Result<Option<usize>> {
        let location = self.store.lineage(chosen).location;
        let (x, y) = (location.x as usize, location.y as usize);
        if location.is_on_grid() {
            let capacity = self.landscape.capacity_at(location, self.generation)?;
            {
                let cell = self.cells.get_mut(y, x);
                if cell.max_size() != capacity {
                    cell.set_max_size(capacity);
                }
            }
            let coalchosen = self.cells.get(y, x).random_occupant(&mut self.rng);
            if coalchosen == 0 {
                let position = self.cells.get_mut(y, x).add_lineage(chosen)?;
                let lineage = self.store.lineage_mut(chosen);
                lineage.list_position = position;
                lineage.nwrap = 0;
                Ok(None)
            } else {
                let lineage = self.store.lineage_mut(chosen);
                lineage.list_position = 0;
                lineage.nwrap = 0;
                Ok(Some(coalchosen))
            }
        } else {
            let matches: Vec<usize> = self
                .cells
                .get(y, x)
                .wrapped()
                .iter()
                .copied()
                .filter(|&index| self.store.lineage(index).location == location)
                .collect();
            if matches.is_empty() {
                let nwrap = self.cells.get_mut(y, x).add_wrapped(chosen);
                let lineage = self.store.lineage_mut(chosen);
                lineage.nwrap = nwrap;
                lineage.list_position = 0;
                return Ok(None);
            }
            let capacity = self.landscape.capacity_at(location, self.generation)?;
            let randwrap =
                (self.rng.uniform01() * f64::from(capacity)).floor() as usize + 1;
            if randwrap > matches.len() {
                let nwrap = self.cells.get_mut(y, x).add_wrapped(chosen);
                let lineage = self.store.lineage_mut(chosen);
                lineage.nwrap = nwrap;
                lineage.list_position = 0;
                Ok(None)
            } else {
                Ok(Some(matches[randwrap - 1]))
            }
        }
    }

    /// Merge `chosen` into `coalchosen`: append one internal node as both
    /// children's parent and retire the consumed lineage.
    pub(crate) fn coalescence_event(&mut self, chosen: usize, coalchosen: usize) -> Result<()> {
        if coalchosen == 0 {
            return Err(SimError::invariant(
                "coalescence attempted with the null lineage".to_string(),
            ));
        }
        let origin = self.store.lineage(chosen).location;
        let spec_rate = self.rng.uniform01();
        let parent = self
            .store
            .push_node(GenealogyNode::internal(origin, self.generation, spec_rate));
        let chosen_reference = self.store.lineage(chosen).reference;
        let coalchosen_reference = self.store.lineage(coalchosen).reference;
        self.store.node_mut(chosen_reference).parent = parent;
        self.store.node_mut(coalchosen_reference).parent = parent;
        let merged_minmax = self
            .store
            .lineage(coalchosen)
            .minmax
            .max(self.store.lineage(chosen).minmax);
        self.store.lineage_mut(coalchosen).minmax = merged_minmax;
        self.store.lineage_mut(chosen).minmax = merged_minmax;
        self.store.lineage_mut(chosen).reference = parent;
        self.store.lineage_mut(coalchosen).reference = parent;
        self.switch_positions(chosen)
    }

    /// O(1) removal from the active table: swap with the last live
    /// lineage and shrink. The swapped-in lineage's cell bookkeeping is
    /// redirected to its new index.
    pub(crate) fn switch_positions(&mut self, chosen: usize) -> Result<()> {
        let endactive = self.store.endactive;
        if chosen > endactive {
            return Err(SimError::invariant(format!(
                "chosen {chosen} is beyond endactive {endactive}"
            )));
        }
        if chosen != endactive {
            self.store.active.swap(chosen, endactive);
            let moved = self.store.lineage(chosen).clone();
            let (x, y) = (moved.location.x as usize, moved.location.y as usize);
            if moved.nwrap == 0 {
                self.cells
                    .get_mut(y, x)
                    .set_slot(moved.list_position, chosen)?;
            } else {
                self.cells.get_mut(y, x).set_wrapped(moved.nwrap, chosen)?;
            }
        }
        self.store.endactive -= 1;
        Ok(())
    }

    /// Inject new tips representing individuals alive at `generation`
    /// (temporal sampling / landscape re-expansion).
    pub(crate) fn add_lineages(&mut self, generation: f64) -> Result<()> {
        for sy in 0..self.mask.height() {
            for sx in 0..self.mask.width() {
                let location = self.mask.recalculate_coordinates(sx, sy);
                if !self.mask.is_sampled(location) {
                    continue;
                }
                let capacity = self.landscape.capacity_at(location, generation)?;
                if capacity == 0 {
                    continue;
                }
                let desired = self.individuals_sampled(location, generation)?;
                let proportion = desired as f64 / f64::from(capacity);
                let mut to_add = desired;

                // Existing lineages at the location become tips with
                // probability desired/capacity, keeping their onward
                // coalescent history.
                let existing: Vec<usize> = if location.is_on_grid() {
                    let cell = self.cells.get(location.y as usize, location.x as usize);
                    (0..cell.slot_count())
                        .map(|slot| cell.lineage_at(slot))
                        .filter(|&index| index != 0)
                        .collect()
                } else {
                    self.cells
                        .get(location.y as usize, location.x as usize)
                        .wrapped()
                        .iter()
                        .copied()
                        .filter(|&index| self.store.lineage(index).location == location)
                        .collect()
                };
                if location.is_on_grid() {
                    let cell = self.cells.get_mut(location.y as usize, location.x as usize);
                    if capacity > cell.max_size() {
                        cell.change_percent_cover(capacity);
                    }
                }
                for index in existing {
                    if to_add == 0 {
                        break;
                    }
                    if self.rng.uniform01() < proportion {
                        self.make_tip(index, generation)?;
                        to_add -= 1;
                    }
                }
                // The remainder are appended as fresh lineages and tips.
                for _ in 0..to_add {
                    if location.is_on_grid() {
                        let cell = self.cells.get(location.y as usize, location.x as usize);
                        if cell.occupied() >= cell.max_size() as usize {
                            warn!(
                                %location,
                                "sample cell is full; skipping remaining expansion"
                            );
                            break;
                        }
                    }
                    let spec_rate = self.rng.uniform01();
                    let node = self
                        .store
                        .push_node(GenealogyNode::tip(location, generation, spec_rate));
                    let index = self.store.push_lineage(Lineage::new(location, node, 0));
                    if location.is_on_grid() {
                        let position = self
                            .cells
                            .get_mut(location.y as usize, location.x as usize)
                            .add_lineage(index)?;
                        self.store.lineage_mut(index).list_position = position;
                    } else {
                        let nwrap = self
                            .cells
                            .get_mut(location.y as usize, location.x as usize)
                            .add_wrapped(index);
                        self.store.lineage_mut(index).nwrap = nwrap;
                    }
                }
            }
        }
        if self.store.endactive > self.start_lineages {
            self.start_lineages = self.store.endactive;
        }
        if self.params.strictness.lineage_validation {
            self.validate_lineages()?;
        }
        Ok(())
    }

    /// Turn an existing lineage into a tip at `generation`. A node that is
    /// already a tip gets a fresh tip chained above it, so both sampling
    /// events stay in the genealogy.
    fn make_tip(&mut self, lineage_index: usize, generation: f64) -> Result<()> {
        let location = self.store.lineage(lineage_index).location;
        let reference = self.store.lineage(lineage_index).reference;
        if self.store.node(reference).tip {
            let spec_rate = self.rng.uniform01();
            let new_tip = self
                .store
                .push_node(GenealogyNode::tip(location, generation, spec_rate));
            self.store.node_mut(reference).parent = new_tip;
            self.store.lineage_mut(lineage_index).reference = new_tip;
        } else {
            let node = self.store.node_mut(reference);
            node.tip = true;
            node.generation = generation;
            node.origin = location;
        }
        Ok(())
    }

    /// Richness estimator: the smallest speciation rate that would have
    /// speciated each branch, applied over the whole genealogy.
    pub fn estimate_species_count(&mut self) -> u64 {
        let mut dminmax: f64 = 0.0;
        for i in 1..=self.store.endactive {
            let node = self.store.node_of(i);
            let new_minmax = if node.generations_existed == 0 {
                node.spec_rate
            } else {
                1.0 - (1.0 - node.spec_rate).powf(1.0 / node.generations_existed as f64)
            };
            let merged = new_minmax.min(self.store.lineage(i).minmax);
            self.store.lineage_mut(i).minmax = merged;
            dminmax = dminmax.max(merged);
        }
        let enddata = self.store.enddata;
        let mut speciated = vec![false; enddata + 1];
        for i in 1..=enddata {
            let node = self.store.node_mut(i);
            if node.tip {
                node.exists = true;
            }
            let generations = node.generations_existed.max(1);
            if speciation_occurs(node.spec_rate, dminmax, generations) {
                speciated[i] = true;
            }
        }
        loop {
            let mut changed = false;
            for i in 1..=enddata {
                let parent = self.store.node(i).parent;
                if parent != 0
                    && self.store.node(i).exists
                    && !speciated[i]
                    && !self.store.node(parent).exists
                {
                    self.store.node_mut(parent).exists = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let mut species = 0u64;
        for i in 1..=enddata {
            if self.store.node(i).exists && speciated[i] {
                species += 1;
            }
        }
        for i in 1..=enddata {
            self.store.node_mut(i).exists = false;
        }
        species
    }

    /// Wind down: pause if lineages remain, otherwise force-speciate the
    /// survivors and finalise the genealogy.
    pub(crate) fn stop_simulation(&mut self) -> Result<RunOutcome> {
        if self.store.endactive > 1 {
            info!(
                lineages = self.store.endactive,
                "out of time; pausing simulation"
            );
            return Ok(RunOutcome::Paused);
        }
        for i in 1..=self.store.endactive {
            let reference = self.store.lineage(i).reference;
            let node = self.store.node_mut(reference);
            node.speciated = true;
            node.spec_rate = 0.0;
        }
        self.sim_complete = true;
        self.finalise_genealogy()?;
        info!(
            steps = self.steps,
            generation = self.generation,
            nodes = self.store.enddata,
            "simulation complete"
        );
        Ok(RunOutcome::Complete)
    }

    /// Mark every node that speciates at the minimum rate and verify the
    /// speciation trail from every remaining node.
    fn finalise_genealogy(&mut self) -> Result<()> {
        let rate = self.params.min_speciation_rate;
        for i in 1..=self.store.enddata {
            let node = self.store.node_mut(i);
            if speciation_occurs(node.spec_rate, rate, node.generations_existed) {
                node.speciated = true;
            }
        }
        self.store.validate_genealogy(rate)?;
        for i in 1..=self.store.enddata {
            if self.store.node(i).speciated {
                continue;
            }
            let mut walk = i;
            let mut hops = 0usize;
            while !self.store.node(walk).speciated {
                walk = self.store.node(walk).parent;
                hops += 1;
                if walk == 0 || hops > self.store.enddata {
                    return Err(SimError::invariant(format!(
                        "node {i}: speciation trail reached the null node after {hops} hops \
                         (step {}, generation {})",
                        self.steps, self.generation
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of live lineages at a logical location.
    pub(crate) fn lineages_at(&self, location: MapLocation) -> usize {
        let cell = self.cells.get(location.y as usize, location.x as usize);
        if location.is_on_grid() {
            cell.occupied()
        } else {
            cell.wrapped()
                .iter()
                .filter(|&&index| self.store.lineage(index).location == location)
                .count()
        }
    }

    /// All live lineage indices at a logical location.
    pub(crate) fn lineage_ids_at(&self, location: MapLocation) -> Vec<usize> {
        let cell = self.cells.get(location.y as usize, location.x as usize);
        if location.is_on_grid() {
            (0..cell.slot_count())
                .map(|slot| cell.lineage_at(slot))
                .filter(|&index| index != 0)
                .collect()
        } else {
            cell.wrapped()
                .iter()
                .copied()
                .filter(|&index| self.store.lineage(index).location == location)
                .collect()
        }
    }

    /// Check every lineage/cell invariant: `nwrap == 0` iff the lineage
    /// sits at its recorded grid slot, wrapped lineages are reachable in
    /// exactly `nwrap` hops, and total occupancy matches `endactive`.
    pub fn validate_lineages(&self) -> Result<()> {
        let mut counted = 0usize;
        for i in 1..=self.store.endactive {
            let lineage = self.store.lineage(i);
            let cell = self
                .cells
                .get(lineage.location.y as usize, lineage.location.x as usize);
            if lineage.is_on_grid() {
                if lineage.nwrap != 0 {
                    return Err(SimError::invariant(format!(
                        "lineage {i} is on-grid with nwrap {}",
                        lineage.nwrap
                    )));
                }
                if cell.lineage_at(lineage.list_position) != i {
                    return Err(SimError::invariant(format!(
                        "lineage {i} not found at its cell slot {} ({})",
                        lineage.list_position, lineage.location
                    )));
                }
            } else {
                if lineage.nwrap == 0 {
                    return Err(SimError::invariant(format!(
                        "lineage {i} is off-grid with nwrap 0 ({})",
                        lineage.location
                    )));
                }
                if cell.wrapped().get(lineage.nwrap - 1) != Some(&i) {
                    return Err(SimError::invariant(format!(
                        "lineage {i} not at wrap position {} of its cell ({})",
                        lineage.nwrap, lineage.location
                    )));
                }
            }
        }
        for cell in self.cells.iter() {
            counted += cell.occupied() + cell.wrapped_count();
        }
        if counted != self.store.endactive {
            return Err(SimError::invariant(format!(
                "cell occupancy {counted} does not match endactive {}",
                self.store.endactive
            )));
        }
        Ok(())
    }
}
