//! Backwards-in-time coalescence engine for spatially explicit neutral
//! ecology.
//!
//! Given a landscape of per-cell carrying capacities (optionally changing
//! through time), a dispersal kernel, per-cell death and reproduction
//! weights, and a sampling mask, the engine reconstructs the genealogy of
//! a sampled set of individuals until every lineage has coalesced or
//! speciated. Species identities, abundances and spatial distributions
//! are then derived from the genealogy for one or more speciation rates.
//!
//! The engine is single-threaded and deterministic given the same seed,
//! parameters and map inputs; a paused run resumes to byte-identical
//! output.

pub mod activity;
pub mod cells;
pub mod community;
pub mod config;
pub mod dispersal;
pub mod engine;
pub mod error;
pub mod gillespie;
pub mod grid;
pub mod heap;
pub mod landscape;
pub mod lineage;
pub mod location;
pub mod metacommunity;
pub mod pause;
pub mod rng;
pub mod sample;

pub use activity::ActivityMap;
pub use cells::CellList;
pub use community::{
    CommunityBuilder, CommunityOutput, CommunityParameters, Fragment, SpeciesLocation,
};
pub use config::{
    DispersalMethod, LandscapePolicy, MetacommunityOption, MetacommunityParameters,
    ProtractedParameters, SimParameters, StrictnessPolicy,
};
pub use dispersal::DispersalCoordinator;
pub use engine::{RunOutcome, Simulation, SimulationInputs};
pub use error::{Result, SimError};
pub use gillespie::{CellEventType, GillespieProbability, GillespieState, UNUSED};
pub use grid::Grid;
pub use heap::{EventHeap, EventNode, EventType};
pub use landscape::{Landscape, LandscapeInputs};
pub use lineage::{GenealogyNode, Lineage, LineageStore};
pub use location::{Cell, MapLocation};
pub use metacommunity::{
    build_metacommunity, AnalyticalMetacommunity, SimulatedMetacommunity, SpeciesIdentitySource,
    TabulatedMetacommunity,
};
pub use pause::{pause_file_path, PauseState};
pub use rng::RandomSource;
pub use sample::SampleMask;
