//! Community building: applying speciation rates to a frozen genealogy.
//!
//! The engine records which uniform each node drew at creation; any
//! speciation rate at or above the simulated minimum can therefore be
//! applied after the fact. Each application marks the speciating nodes,
//! walks every selected tip to its nearest speciating ancestor, and
//! aggregates species abundances, per-cell locations and per-fragment
//! counts under a fresh community reference.

use crate::config::ProtractedParameters;
use crate::error::{Result, SimError};
use crate::lineage::{protracted_speciation_occurs, speciation_occurs, LineageStore};
use crate::metacommunity::SpeciesIdentitySource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Tips are matched to a sample time within this tolerance.
const TIME_TOLERANCE: f64 = 1e-8;

/// One `(speciation rate, sample time, metacommunity, protracted)` tuple,
/// identified by its reference in the output schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityParameters {
    pub reference: u64,
    pub speciation_rate: f64,
    pub time: f64,
    pub fragments: bool,
    pub metacommunity_reference: u64,
    pub protracted: ProtractedParameters,
}

/// A named rectangular fragment of the sample space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub name: String,
    pub x_min: i64,
    pub x_max: i64,
    pub y_min: i64,
    pub y_max: i64,
}

impl Fragment {
    #[must_use]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }
}

/// One sampled individual's location, tagged with its species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesLocation {
    pub species_id: u64,
    pub x: i64,
    pub y: i64,
}

/// Everything one community application produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityOutput {
    pub parameters: CommunityParameters,
    /// Species id to abundance.
    pub abundances: BTreeMap<u64, u64>,
    pub locations: Vec<SpeciesLocation>,
    /// (fragment name, species id) to abundance.
    pub fragment_abundances: BTreeMap<(String, u64), u64>,
}

impl CommunityOutput {
    #[must_use]
    pub fn species_richness(&self) -> usize {
        self.abundances.len()
    }

    #[must_use]
    pub fn total_individuals(&self) -> u64 {
        self.abundances.values().sum()
    }
}

/// Applies speciation rates to the genealogy the engine produced.
pub struct CommunityBuilder<'a> {
    store: &'a mut LineageStore,
    min_speciation_rate: f64,
    grid_x_size: i64,
    grid_y_size: i64,
    fragments: Vec<Fragment>,
    performed: Vec<CommunityParameters>,
}

impl<'a> CommunityBuilder<'a> {
    pub fn new(
        store: &'a mut LineageStore,
        min_speciation_rate: f64,
        grid_x_size: usize,
        grid_y_size: usize,
    ) -> Self {
        Self {
            store,
            min_speciation_rate,
            grid_x_size: grid_x_size as i64,
            grid_y_size: grid_y_size as i64,
            fragments: Vec::new(),
            performed: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_fragments(mut self, fragments: Vec<Fragment>) -> Self {
        self.fragments = fragments;
        self
    }

    /// Community references handed out so far, in order.
    #[must_use]
    pub fn performed(&self) -> &[CommunityParameters] {
        &self.performed
    }

    /// Rates below the simulated minimum cannot be applied; rates within
    /// a relative hair of it snap onto it.
    fn resolve_rate(&self, rate: f64) -> Result<f64> {
        if (rate - self.min_speciation_rate).abs() <= self.min_speciation_rate * 1e-6 {
            return Ok(self.min_speciation_rate);
        }
        if rate < self.min_speciation_rate {
            return Err(SimError::config(format!(
                "speciation rate {rate} is below the simulated minimum {}",
                self.min_speciation_rate
            )));
        }
        Ok(rate)
    }

    fn speciates(
        &self,
        node_index: usize,
        rate: f64,
        protracted: Option<&ProtractedParameters>,
    ) -> bool {
        let node = self.store.node(node_index);
        match protracted {
            Some(window) => protracted_speciation_occurs(
                node.spec_rate,
                rate,
                node.generations_existed,
                window,
            ),
            None => speciation_occurs(node.spec_rate, rate, node.generations_existed),
        }
    }

    /// Apply one `(rate, time)` pair. With a metacommunity, speciating
    /// branches draw their identity from the ancestral pool instead of
    /// minting fresh ids, so distinct branches may collapse into one
    /// species.
    pub fn apply(
        &mut self,
        rate: f64,
        time: f64,
        protracted: Option<ProtractedParameters>,
        mut metacommunity: Option<&mut dyn SpeciesIdentitySource>,
    ) -> Result<CommunityOutput> {
        let rate = self.resolve_rate(rate)?;
        let metacommunity_reference = metacommunity
            .as_ref()
            .map_or(0, |sampler| sampler.reference());
        let parameters = CommunityParameters {
            reference: self.performed.len() as u64 + 1,
            speciation_rate: rate,
            time,
            fragments: !self.fragments.is_empty(),
            metacommunity_reference,
            protracted: protracted.unwrap_or_default(),
        };
        if self.performed.iter().any(|done| {
            done.speciation_rate == parameters.speciation_rate
                && done.time == parameters.time
                && done.fragments == parameters.fragments
                && done.metacommunity_reference == parameters.metacommunity_reference
                && done.protracted == parameters.protracted
        }) {
            return Err(SimError::config(format!(
                "community for rate {rate} at time {time} has already been calculated"
            )));
        }
        info!(rate, time, reference = parameters.reference, "building community");

        for i in 1..=self.store.enddata() {
            self.store.node_mut(i).reset_scratch();
        }
        let mut species_count = 0u64;
        let mut abundances: BTreeMap<u64, u64> = BTreeMap::new();
        let mut locations = Vec::new();
        let mut fragment_abundances: BTreeMap<(String, u64), u64> = BTreeMap::new();

        for tip in 1..=self.store.enddata() {
            {
                let node = self.store.node(tip);
                if !node.tip || (node.generation - time).abs() > TIME_TOLERANCE {
                    continue;
                }
            }
            // Nearest speciating ancestor; the root itself when the branch
            // never speciates.
            let mut walk = tip;
            loop {
                if self.speciates(walk, rate, protracted.as_ref()) {
                    break;
                }
                let parent = self.store.node(walk).parent;
                if parent == 0 {
                    break;
                }
                walk = parent;
            }
            let species_id = if self.store.node(walk).species_id != 0 {
                self.store.node(walk).species_id
            } else {
                let id = match metacommunity.as_deref_mut() {
                    Some(sampler) => sampler.random_species_id()?,
                    None => {
                        species_count += 1;
                        species_count
                    }
                };
                self.store.node_mut(walk).species_id = id;
                id
            };
            *abundances.entry(species_id).or_insert(0) += 1;

            let origin = self.store.node(tip).origin;
            let x = origin.x + origin.xwrap * self.grid_x_size;
            let y = origin.y + origin.ywrap * self.grid_y_size;
            locations.push(SpeciesLocation { species_id, x, y });
            for fragment in &self.fragments {
                if fragment.contains(x, y) {
                    *fragment_abundances
                        .entry((fragment.name.clone(), species_id))
                        .or_insert(0) += 1;
                }
            }
        }

        self.performed.push(parameters.clone());
        Ok(CommunityOutput {
            parameters,
            abundances,
            locations,
            fragment_abundances,
        })
    }

    /// Apply the cartesian product of rates and times.
    pub fn apply_all(
        &mut self,
        rates: &[f64],
        times: &[f64],
        protracted: Option<ProtractedParameters>,
        mut metacommunity: Option<&mut dyn SpeciesIdentitySource>,
    ) -> Result<Vec<CommunityOutput>> {
        let mut unique_rates: Vec<f64> = Vec::new();
        for &rate in rates {
            let resolved = self.resolve_rate(rate)?;
            if !unique_rates.iter().any(|&seen| seen == resolved) {
                unique_rates.push(resolved);
            }
        }
        unique_rates.sort_by(|a, b| a.partial_cmp(b).expect("rates must not be NaN"));
        let times: Vec<f64> = if times.is_empty() { vec![0.0] } else { times.to_vec() };
        let mut outputs = Vec::with_capacity(unique_rates.len() * times.len());
        for &rate in &unique_rates {
            for &time in &times {
                outputs.push(self.apply(
                    rate,
                    time,
                    protracted,
                    metacommunity.as_deref_mut(),
                )?);
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::GenealogyNode;
    use crate::location::MapLocation;

    /// Three tips: 1 and 2 coalesce into 4, which coalesces with 3 into 5
    /// (the root, forced to speciate). Node 4 carries a draw that
    /// speciates only at high rates.
    fn toy_store() -> LineageStore {
        let mut store = LineageStore::sized_for(3);
        for i in 0..3 {
            let mut node = GenealogyNode::tip(MapLocation::new(i, 0, 0, 0), 0.0, 0.99);
            node.generations_existed = 1;
            store.push_node(node);
        }
        let mut inner = GenealogyNode::internal(MapLocation::new(0, 0, 0, 0), 1.0, 0.5);
        inner.generations_existed = 10;
        let inner_index = store.push_node(inner);
        let mut root = GenealogyNode::internal(MapLocation::new(1, 0, 0, 0), 2.0, 0.0);
        root.generations_existed = 1;
        root.speciated = true;
        let root_index = store.push_node(root);
        store.node_mut(1).parent = inner_index;
        store.node_mut(2).parent = inner_index;
        store.node_mut(inner_index).parent = root_index;
        store.node_mut(3).parent = root_index;
        store
    }

    #[test]
    fn low_rate_collapses_everything_to_the_root() {
        let mut store = toy_store();
        let mut builder = CommunityBuilder::new(&mut store, 1e-9, 4, 4);
        let output = builder.apply(1e-9, 0.0, None, None).unwrap();
        assert_eq!(output.species_richness(), 1);
        assert_eq!(output.total_individuals(), 3);
    }

    #[test]
    fn higher_rate_splits_at_the_inner_node() {
        let mut store = toy_store();
        // Node 4: spec 0.5 over 10 generations speciates at rate 0.1
        // (threshold 1 - 0.9^10 ~ 0.65).
        let mut builder = CommunityBuilder::new(&mut store, 1e-9, 4, 4);
        let output = builder.apply(0.1, 0.0, None, None).unwrap();
        assert_eq!(output.species_richness(), 2);
        let mut counts: Vec<u64> = output.abundances.values().copied().collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn rates_below_the_minimum_are_refused() {
        let mut store = toy_store();
        let mut builder = CommunityBuilder::new(&mut store, 1e-3, 4, 4);
        assert!(builder.apply(1e-6, 0.0, None, None).is_err());
        // Within a relative hair of the minimum snaps onto it.
        assert!(builder.apply(1e-3 * (1.0 + 1e-9), 0.0, None, None).is_ok());
    }

    #[test]
    fn duplicate_applications_are_refused() {
        let mut store = toy_store();
        let mut builder = CommunityBuilder::new(&mut store, 1e-9, 4, 4);
        builder.apply(0.1, 0.0, None, None).unwrap();
        assert!(builder.apply(0.1, 0.0, None, None).is_err());
        assert_eq!(builder.performed().len(), 1);
    }

    #[test]
    fn fragment_counts_follow_tip_positions() {
        let mut store = toy_store();
        let fragments = vec![
            Fragment {
                name: "west".to_string(),
                x_min: 0,
                x_max: 0,
                y_min: 0,
                y_max: 3,
            },
            Fragment {
                name: "east".to_string(),
                x_min: 1,
                x_max: 3,
                y_min: 0,
                y_max: 3,
            },
        ];
        let mut builder =
            CommunityBuilder::new(&mut store, 1e-9, 4, 4).with_fragments(fragments);
        let output = builder.apply(1e-9, 0.0, None, None).unwrap();
        let west: u64 = output
            .fragment_abundances
            .iter()
            .filter(|((name, _), _)| name == "west")
            .map(|(_, count)| count)
            .sum();
        let east: u64 = output
            .fragment_abundances
            .iter()
            .filter(|((name, _), _)| name == "east")
            .map(|(_, count)| count)
            .sum();
        assert_eq!(west, 1);
        assert_eq!(east, 2);
        assert!(output.parameters.fragments);
    }

    #[test]
    fn locations_are_emitted_per_individual() {
        let mut store = toy_store();
        let mut builder = CommunityBuilder::new(&mut store, 1e-9, 4, 4);
        let output = builder.apply(1e-9, 0.0, None, None).unwrap();
        assert_eq!(output.locations.len(), 3);
        let xs: Vec<i64> = output.locations.iter().map(|row| row.x).collect();
        assert_eq!(xs, vec![0, 1, 2]);
    }
}
