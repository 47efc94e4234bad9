//! Simulation parameter record.
//!
//! The engine consumes a fully-populated [`SimParameters`]; parsing from
//! files is the application's concern. Validation happens once, up front,
//! and every downstream component may assume a validated record.

use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parametric or empirical dispersal kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DispersalMethod {
    #[default]
    Normal,
    FatTail,
    NormalUniform,
    Empirical,
}

impl DispersalMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::FatTail => "fat-tail",
            Self::NormalUniform => "normal-uniform",
            Self::Empirical => "empirical",
        }
    }
}

/// Boundary policy applied when a lineage leaves the fine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LandscapePolicy {
    #[default]
    Closed,
    Infinite,
    TiledFine,
    TiledCoarse,
}

impl LandscapePolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Infinite => "infinite",
            Self::TiledFine => "tiled-fine",
            Self::TiledCoarse => "tiled-coarse",
        }
    }
}

/// Protracted speciation window in generations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ProtractedParameters {
    pub min_speciation_gen: f64,
    pub max_speciation_gen: f64,
}

/// Which metacommunity provider supplies ancestral species identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MetacommunityOption {
    #[default]
    Simulated,
    Analytical,
    Database,
}

impl MetacommunityOption {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Analytical => "analytical",
            Self::Database => "database",
        }
    }
}

/// Metacommunity configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetacommunityParameters {
    pub size: u64,
    pub speciation_rate: f64,
    pub option: MetacommunityOption,
    /// External reference for the `database` option.
    pub external_reference: u64,
}

/// Runtime strictness toggles. These were compile-time flags in older
/// simulators; keeping them on a policy object lets the test suite enable
/// them without a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StrictnessPolicy {
    /// Fail when interpolation reports a value above the historical cell.
    pub historical_regression: bool,
    /// Validate the heap property and slot table after every mutation.
    pub heap_validation: bool,
    /// Walk every lineage's cell bookkeeping after each step.
    pub lineage_validation: bool,
}

impl StrictnessPolicy {
    /// Everything on; intended for tests.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            historical_regression: true,
            heap_validation: true,
            lineage_validation: true,
        }
    }
}

/// Full parameter record for one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimParameters {
    // Simulation.
    pub seed: u64,
    pub task: u64,
    pub output_directory: PathBuf,
    /// Wall-clock budget in seconds before the run pauses.
    pub max_time: u64,
    /// Default per-cell carrying capacity.
    pub deme: u32,
    /// Fraction of each cell's individuals sampled as tips.
    pub deme_sample: f64,
    pub min_speciation_rate: f64,
    /// Richness-estimator short-circuit; 0 disables it.
    pub desired_species: u64,
    /// Additional temporal sampling points in generations.
    pub times: Vec<f64>,

    // Dispersal.
    pub dispersal_method: DispersalMethod,
    pub sigma: f64,
    pub tau: f64,
    pub m_probability: f64,
    pub cutoff: f64,
    pub restrict_self: bool,
    pub landscape_type: LandscapePolicy,
    pub dispersal_file: Option<PathBuf>,
    pub dispersal_relative_cost: f64,

    // Sample grid and maps. Sizes are in cells; offsets position the sample
    // grid within the fine map and the fine map within the coarse map.
    pub grid_x_size: usize,
    pub grid_y_size: usize,
    pub sample_x_size: usize,
    pub sample_y_size: usize,
    pub sample_x_offset: i64,
    pub sample_y_offset: i64,
    pub fine_map_file: Option<PathBuf>,
    pub fine_map_x_size: usize,
    pub fine_map_y_size: usize,
    pub fine_map_x_offset: i64,
    pub fine_map_y_offset: i64,
    pub coarse_map_file: Option<PathBuf>,
    pub coarse_map_x_size: usize,
    pub coarse_map_y_size: usize,
    pub coarse_map_x_offset: i64,
    pub coarse_map_y_offset: i64,
    /// Coarse-to-fine edge ratio.
    pub coarse_map_scale: u32,
    pub historical_fine_map_file: Option<PathBuf>,
    pub historical_coarse_map_file: Option<PathBuf>,
    /// Generation at which the historical maps take over.
    pub gen_since_historical: f64,
    pub habitat_change_rate: f64,
    pub sample_mask_file: Option<PathBuf>,
    /// Treat the sample mask as exact per-cell fractions rather than a
    /// boolean mask.
    pub uses_spatial_sampling: bool,
    pub death_file: Option<PathBuf>,
    pub reproduction_file: Option<PathBuf>,

    // Optional behaviours.
    pub protracted: Option<ProtractedParameters>,
    pub metacommunity: Option<MetacommunityParameters>,
    /// Switch to the Gillespie algorithm when the live-lineage count drops
    /// below this value; requires an empirical dispersal map.
    pub gillespie_threshold: Option<usize>,

    pub strictness: StrictnessPolicy,
}

impl Default for SimParameters {
    fn default() -> Self {
        Self {
            seed: 1,
            task: 0,
            output_directory: PathBuf::from("output"),
            max_time: 3600,
            deme: 1,
            deme_sample: 1.0,
            min_speciation_rate: 1e-6,
            desired_species: 0,
            times: Vec::new(),
            dispersal_method: DispersalMethod::Normal,
            sigma: 1.0,
            tau: 1.0,
            m_probability: 0.0,
            cutoff: 0.0,
            restrict_self: false,
            landscape_type: LandscapePolicy::Closed,
            dispersal_file: None,
            dispersal_relative_cost: 1.0,
            grid_x_size: 0,
            grid_y_size: 0,
            sample_x_size: 0,
            sample_y_size: 0,
            sample_x_offset: 0,
            sample_y_offset: 0,
            fine_map_file: None,
            fine_map_x_size: 0,
            fine_map_y_size: 0,
            fine_map_x_offset: 0,
            fine_map_y_offset: 0,
            coarse_map_file: None,
            coarse_map_x_size: 0,
            coarse_map_y_size: 0,
            coarse_map_x_offset: 0,
            coarse_map_y_offset: 0,
            coarse_map_scale: 1,
            historical_fine_map_file: None,
            historical_coarse_map_file: None,
            gen_since_historical: 0.0,
            habitat_change_rate: 0.0,
            sample_mask_file: None,
            uses_spatial_sampling: false,
            death_file: None,
            reproduction_file: None,
            protracted: None,
            metacommunity: None,
            gillespie_threshold: None,
            strictness: StrictnessPolicy::default(),
        }
    }
}

impl SimParameters {
    /// Fill derived defaults (grid/sample sizes falling back to the fine
    /// map) and check the record for consistency.
    pub fn validate(&mut self) -> Result<()> {
        if self.fine_map_x_size == 0 || self.fine_map_y_size == 0 {
            return Err(SimError::config("fine map dimensions must be non-zero"));
        }
        if self.sample_x_size == 0 {
            self.sample_x_size = self.fine_map_x_size;
        }
        if self.sample_y_size == 0 {
            self.sample_y_size = self.fine_map_y_size;
        }
        if self.grid_x_size == 0 {
            self.grid_x_size = self.sample_x_size;
        }
        if self.grid_y_size == 0 {
            self.grid_y_size = self.sample_y_size;
        }
        if self.deme == 0 {
            return Err(SimError::config("deme must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.deme_sample) || self.deme_sample == 0.0 {
            return Err(SimError::config(format!(
                "deme_sample must lie in (0, 1], got {}",
                self.deme_sample
            )));
        }
        if !(0.0..=1.0).contains(&self.min_speciation_rate) || self.min_speciation_rate == 0.0 {
            return Err(SimError::config(format!(
                "min_speciation_rate must lie in (0, 1], got {}",
                self.min_speciation_rate
            )));
        }
        if self.dispersal_relative_cost < 1.0 {
            return Err(SimError::config(
                "dispersal_relative_cost must be at least 1",
            ));
        }
        if self.coarse_map_scale == 0 {
            return Err(SimError::config("coarse_map_scale must be at least 1"));
        }
        match self.dispersal_method {
            DispersalMethod::Normal if self.sigma <= 0.0 => {
                return Err(SimError::config("sigma must be positive for normal dispersal"));
            }
            DispersalMethod::FatTail if self.sigma <= 0.0 || self.tau <= 0.0 => {
                return Err(SimError::config(
                    "sigma and tau must be positive for fat-tailed dispersal",
                ));
            }
            DispersalMethod::NormalUniform => {
                if self.sigma <= 0.0 {
                    return Err(SimError::config(
                        "sigma must be positive for normal-uniform dispersal",
                    ));
                }
                if !(0.0..=1.0).contains(&self.m_probability) {
                    return Err(SimError::config("m_probability must lie in [0, 1]"));
                }
                if self.cutoff <= 0.0 {
                    return Err(SimError::config(
                        "cutoff must be positive for normal-uniform dispersal",
                    ));
                }
            }
            DispersalMethod::Empirical if self.dispersal_file.is_none() => {
                return Err(SimError::config(
                    "empirical dispersal requires a dispersal_file",
                ));
            }
            _ => {}
        }
        if let Some(protracted) = &self.protracted {
            if protracted.min_speciation_gen > protracted.max_speciation_gen {
                return Err(SimError::config(format!(
                    "protracted window is inverted: ({}, {})",
                    protracted.min_speciation_gen, protracted.max_speciation_gen
                )));
            }
        }
        if let Some(meta) = &self.metacommunity {
            if meta.size == 0 {
                return Err(SimError::config("metacommunity size must be non-zero"));
            }
            if meta.option != MetacommunityOption::Database
                && (meta.speciation_rate <= 0.0 || meta.speciation_rate >= 1.0)
            {
                return Err(SimError::config(
                    "metacommunity speciation rate must lie in (0, 1)",
                ));
            }
        }
        if self.gillespie_threshold.is_some() && self.dispersal_method != DispersalMethod::Empirical
        {
            return Err(SimError::config(
                "the Gillespie algorithm requires an empirical dispersal map",
            ));
        }
        let mut times = self.times.clone();
        times.sort_by(|a, b| a.partial_cmp(b).expect("times must not contain NaN"));
        times.dedup();
        if times.iter().any(|t| *t < 0.0) {
            return Err(SimError::config("sample times must be non-negative"));
        }
        self.times = times;
        Ok(())
    }

    /// Number of individuals sampled from a uniformly-filled cell.
    #[must_use]
    pub fn individuals_per_cell(&self) -> u64 {
        (self.deme_sample * f64::from(self.deme)).floor() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SimParameters {
        SimParameters {
            fine_map_x_size: 10,
            fine_map_y_size: 10,
            ..SimParameters::default()
        }
    }

    #[test]
    fn derives_grid_sizes_from_fine_map() {
        let mut params = base();
        params.validate().unwrap();
        assert_eq!(params.grid_x_size, 10);
        assert_eq!(params.sample_y_size, 10);
    }

    #[test]
    fn rejects_zero_speciation_rate() {
        let mut params = base();
        params.min_speciation_rate = 0.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_gillespie_without_empirical_map() {
        let mut params = base();
        params.gillespie_threshold = Some(100);
        assert!(params.validate().is_err());
    }

    #[test]
    fn sorts_and_dedups_sample_times() {
        let mut params = base();
        params.times = vec![50.0, 0.0, 50.0, 10.0];
        params.validate().unwrap();
        assert_eq!(params.times, vec![0.0, 10.0, 50.0]);
    }

    #[test]
    fn rejects_inverted_protracted_window() {
        let mut params = base();
        params.protracted = Some(ProtractedParameters {
            min_speciation_gen: 100.0,
            max_speciation_gen: 10.0,
        });
        assert!(params.validate().is_err());
    }
}
