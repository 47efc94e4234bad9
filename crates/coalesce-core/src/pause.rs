//! Pause and resume.
//!
//! A paused run dumps its entire engine state as one flat binary record:
//! the protracted-flag sentinel first, then the scalar state, the random
//! source, both arenas in full, and the landscape grids. Resume restores
//! the record, rebuilds the per-cell index from the active table, and
//! continues to byte-identical output.

use crate::config::SimParameters;
use crate::engine::{Simulation, SimulationInputs};
use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::landscape::Landscape;
use crate::lineage::{GenealogyNode, Lineage, LineageStore};
use crate::rng::RandomSource;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The full dumped engine state, field order fixed by the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseState {
    /// Sentinel: whether this dump came from a protracted-speciation run.
    /// Resume refuses a mismatch.
    pub protracted: bool,
    pub params: SimParameters,
    pub rng: RandomSource,
    pub generation: f64,
    pub steps: f64,
    pub time_reference: usize,
    pub reference_times: Vec<f64>,
    pub uses_temporal_sampling: bool,
    pub start_lineages: usize,
    pub endactive: usize,
    pub enddata: usize,
    pub active: Vec<Lineage>,
    pub data: Vec<GenealogyNode>,
    pub landscape: Landscape,
}

/// Location of the dump for a `(task, seed)` pair.
#[must_use]
pub fn pause_file_path(output_directory: &Path, task: u64, seed: u64) -> PathBuf {
    output_directory
        .join("Pause")
        .join(format!("dump_{task}_{seed}.bin"))
}

impl Simulation {
    /// Snapshot the engine into a dumpable record. Only the in-use prefix
    /// of each arena is kept.
    #[must_use]
    pub fn pause_state(&self) -> PauseState {
        PauseState {
            protracted: self.params.protracted.is_some(),
            params: self.params.clone(),
            rng: self.rng.clone(),
            generation: self.generation,
            steps: self.steps,
            time_reference: self.time_reference,
            reference_times: self.reference_times.clone(),
            uses_temporal_sampling: self.uses_temporal_sampling,
            start_lineages: self.start_lineages,
            endactive: self.store.endactive,
            enddata: self.store.enddata,
            active: self.store.active[..=self.store.endactive].to_vec(),
            data: self.store.data[..=self.store.enddata].to_vec(),
            landscape: self.landscape.clone(),
        }
    }

    /// Write the dump under `${output}/Pause/`, falling back to the
    /// output directory itself when the pause directory cannot be
    /// created.
    pub fn save_pause(&self) -> Result<PathBuf> {
        let state = self.pause_state();
        let bytes = postcard::to_allocvec(&state)
            .map_err(|err| SimError::resource(format!("failed to serialise pause state: {err}")))?;
        let preferred = pause_file_path(
            &self.params.output_directory,
            self.params.task,
            self.params.seed,
        );
        let path = match preferred.parent().map(fs::create_dir_all) {
            Some(Ok(())) => preferred,
            _ => {
                warn!(
                    "could not create the pause directory; writing to the output directory instead"
                );
                fs::create_dir_all(&self.params.output_directory).map_err(|err| {
                    SimError::resource(format!("output directory is not writable: {err}"))
                })?;
                self.params.output_directory.join(format!(
                    "dump_{}_{}.bin",
                    self.params.task, self.params.seed
                ))
            }
        };
        fs::write(&path, &bytes)
            .map_err(|err| SimError::resource(format!("failed to write pause dump: {err}")))?;
        info!(path = %path.display(), lineages = state.endactive, "pause dump written");
        Ok(path)
    }

    /// Read a dump back from disk.
    pub fn load_pause(path: &Path) -> Result<PauseState> {
        let bytes = fs::read(path).map_err(|err| {
            SimError::resource(format!("cannot open pause dump {}: {err}", path.display()))
        })?;
        postcard::from_bytes(&bytes)
            .map_err(|err| SimError::resource(format!("corrupt pause dump: {err}")))
    }

    /// Rebuild a simulation from a dump. The activity maps, sample mask
    /// and dispersal matrix are re-imported from `inputs`; the landscape
    /// epoch state comes from the dump.
    pub fn resume(state: PauseState, inputs: SimulationInputs) -> Result<Self> {
        if state.protracted != state.params.protracted.is_some() {
            return Err(SimError::config(if state.protracted {
                "paused simulation used protracted speciation; parameters do not"
            } else {
                "parameters request protracted speciation; the paused simulation did not"
            }));
        }
        let mut params = state.params;
        params.validate()?;
        let landscape = state.landscape;
        let dispersal =
            crate::dispersal::DispersalCoordinator::new(&params, inputs.dispersal_matrix, &landscape)?;
        let death = match inputs.death {
            Some(grid) => crate::activity::ActivityMap::from_grid(grid, &landscape)?,
            None => crate::activity::ActivityMap::null(),
        };
        let reproduction = match inputs.reproduction {
            Some(grid) => crate::activity::ActivityMap::from_grid(grid, &landscape)?,
            None => crate::activity::ActivityMap::null(),
        };
        let mask = crate::sample::SampleMask::new(&params, inputs.sample_mask)?;

        let mut store = LineageStore::sized_for(state.endactive.max(1));
        store.active = state.active;
        store.data = state.data;
        store.endactive = state.endactive;
        store.enddata = state.enddata;
        store.reserve(0, 0);

        let mut simulation = Self {
            rng: state.rng,
            landscape,
            dispersal,
            death,
            reproduction,
            mask,
            store,
            cells: Grid::new(params.grid_y_size, params.grid_x_size, Default::default())?,
            generation: state.generation,
            steps: state.steps,
            reference_times: state.reference_times,
            time_reference: state.time_reference,
            uses_temporal_sampling: state.uses_temporal_sampling,
            continue_sim: true,
            sim_complete: false,
            start_lineages: state.start_lineages,
            gillespie: None,
            step_limit: None,
            params,
        };
        simulation.rebuild_cells()?;
        info!(
            lineages = simulation.store.endactive,
            generation = simulation.generation,
            "resumed paused simulation"
        );
        Ok(simulation)
    }

    /// Reconstruct the per-cell index from the active table, preserving
    /// every recorded slot and wrap position.
    fn rebuild_cells(&mut self) -> Result<()> {
        for y in 0..self.params.grid_y_size {
            for x in 0..self.params.grid_x_size {
                let capacity = self.landscape.capacity_at(
                    crate::location::MapLocation::new(x as i64, y as i64, 0, 0),
                    self.generation,
                )?;
                self.cells.get_mut(y, x).initialise(capacity);
            }
        }
        for index in 1..=self.store.endactive {
            let lineage = self.store.lineage(index).clone();
            let cell = self
                .cells
                .get_mut(lineage.location.y as usize, lineage.location.x as usize);
            if lineage.nwrap == 0 {
                if !lineage.is_on_grid() {
                    return Err(SimError::invariant(format!(
                        "dumped lineage {index} has nwrap 0 but an off-grid location"
                    )));
                }
                cell.restore_slot(lineage.list_position, index)?;
            } else {
                cell.restore_wrapped(lineage.nwrap, index)?;
            }
        }
        for cell in self.cells.iter() {
            cell.verify_restored()?;
        }
        if self.params.strictness.lineage_validation {
            self.validate_lineages()?;
        }
        Ok(())
    }
}
