//! Metacommunity providers.
//!
//! Lineages that reach the root of a finite simulation without speciating
//! draw their species identity from an ancestral, spatially-implicit
//! neutral pool; with a metacommunity configured, every speciating branch
//! draws from the same pool. Three providers share one interface: a
//! simulated non-spatial coalescent, the analytical species-abundance
//! closed form, and a tabulated abundance list read from a previous
//! database.

use crate::config::{MetacommunityOption, MetacommunityParameters};
use crate::error::{Result, SimError};
use crate::lineage::speciation_occurs;
use crate::rng::RandomSource;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A source of ancestral species identities. Every provider maintains the
/// invariant that after `n` draws its backing community has seen at least
/// `n` individuals.
pub trait SpeciesIdentitySource {
    /// Sample an individual from the metacommunity uniformly and return
    /// the species containing it.
    fn random_species_id(&mut self) -> Result<u64>;

    /// Reference of this metacommunity in the output schema.
    fn reference(&self) -> u64;

    /// Number of individuals in the backing community.
    fn community_size(&self) -> u64;
}

/// Build the provider selected by the parameter record. `tabulated`
/// supplies the abundance map for the database option.
pub fn build_metacommunity(
    params: &MetacommunityParameters,
    seed: u64,
    reference: u64,
    local_community_size: u64,
    tabulated: Option<BTreeMap<u64, u64>>,
) -> Result<Box<dyn SpeciesIdentitySource>> {
    match params.option {
        MetacommunityOption::Simulated => Ok(Box::new(SimulatedMetacommunity::generate(
            params.size,
            params.speciation_rate,
            seed,
            reference,
        )?)),
        MetacommunityOption::Analytical => Ok(Box::new(AnalyticalMetacommunity::new(
            params.size,
            params.speciation_rate,
            seed,
            reference,
            local_community_size,
        )?)),
        MetacommunityOption::Database => {
            let abundances = tabulated.ok_or_else(|| {
                SimError::config(
                    "database metacommunity selected but no abundance table was supplied",
                )
            })?;
            Ok(Box::new(TabulatedMetacommunity::from_abundances(
                &abundances,
                seed,
                reference,
            )?))
        }
    }
}

/// Metacommunity generated by a non-spatial neutral coalescent of
/// `size` individuals, tabulated once up front.
pub struct SimulatedMetacommunity {
    /// Cumulative abundance per species; species ids are 1-based indices.
    cumulative: Vec<u64>,
    total: u64,
    reference: u64,
    rng: RandomSource,
}

impl SimulatedMetacommunity {
    pub fn generate(size: u64, speciation_rate: f64, seed: u64, reference: u64) -> Result<Self> {
        if size == 0 {
            return Err(SimError::config("metacommunity size must be non-zero"));
        }
        info!(size, speciation_rate, "simulating non-spatial metacommunity");
        let mut rng = RandomSource::with_seed(seed);

        #[derive(Clone, Default)]
        struct Node {
            parent: usize,
            spec_rate: f64,
            generations: u64,
            speciated: bool,
        }

        let count = size as usize;
        let mut nodes: Vec<Node> = Vec::with_capacity(2 * count + 1);
        nodes.push(Node::default());
        for _ in 0..count {
            nodes.push(Node {
                spec_rate: rng.uniform01(),
                ..Node::default()
            });
        }
        // Active lineages hold node references; removal swaps with the
        // last entry.
        let mut active: Vec<usize> = (1..=count).collect();
        let guard_rate = 0.99999 * speciation_rate;
        while active.len() > 1 {
            let chosen_position = rng.uint_in(active.len() as u64 - 1) as usize;
            let chosen = active[chosen_position];
            nodes[chosen].generations += 1;
            if speciation_occurs(nodes[chosen].spec_rate, guard_rate, nodes[chosen].generations) {
                nodes[chosen].speciated = true;
                active.swap_remove(chosen_position);
                continue;
            }
            let partner_position = rng.uint_in(size - 1) as usize;
            if partner_position < active.len() && partner_position != chosen_position {
                let partner = active[partner_position];
                let parent = nodes.len();
                nodes.push(Node {
                    spec_rate: rng.uniform01(),
                    ..Node::default()
                });
                nodes[chosen].parent = parent;
                nodes[partner].parent = parent;
                active[partner_position] = parent;
                active.swap_remove(chosen_position);
            }
        }
        if let Some(&survivor) = active.first() {
            nodes[survivor].speciated = true;
        }

        // Tabulate abundances: each tip belongs to its nearest speciated
        // ancestor.
        let mut species_of_node: BTreeMap<usize, u64> = BTreeMap::new();
        let mut abundances: Vec<u64> = Vec::new();
        for tip in 1..=count {
            let mut walk = tip;
            while !nodes[walk].speciated && nodes[walk].parent != 0 {
                walk = nodes[walk].parent;
            }
            let species = *species_of_node.entry(walk).or_insert_with(|| {
                abundances.push(0);
                abundances.len() as u64
            });
            abundances[species as usize - 1] += 1;
        }
        let mut cumulative = Vec::with_capacity(abundances.len());
        let mut running = 0u64;
        for abundance in &abundances {
            running += abundance;
            cumulative.push(running);
        }
        debug!(species = abundances.len(), "metacommunity tabulated");
        Ok(Self {
            cumulative,
            total: running,
            reference,
            rng,
        })
    }
}

impl SpeciesIdentitySource for SimulatedMetacommunity {
    fn random_species_id(&mut self) -> Result<u64> {
        let individual = self.rng.uint_in(self.total - 1);
        let species = self.cumulative.partition_point(|&sum| sum <= individual);
        Ok(species as u64 + 1)
    }

    fn reference(&self) -> u64 {
        self.reference
    }

    fn community_size(&self) -> u64 {
        self.total
    }
}

/// Expected species richness of a neutral community of `size`
/// individuals under point speciation (Vallade & Houchmandzadeh 2003;
/// Alonso & McKane 2004).
#[must_use]
pub fn expected_species_richness(size: u64, speciation_rate: f64) -> u64 {
    let theta = speciation_rate * (size as f64 - 1.0) / (1.0 - speciation_rate);
    let richness = if size > 10_000_000 {
        theta * (1.0 + size as f64 / theta).ln()
    } else {
        (0..size)
            .map(|i| theta / (theta + i as f64))
            .sum::<f64>()
    };
    (richness.ceil() as u64).max(1)
}

/// Metacommunity drawn from the analytical species-abundance
/// distribution: species are minted with logarithmic-series abundances
/// until the expected richness is covered, then individual draws map into
/// the cumulative table.
pub struct AnalyticalMetacommunity {
    size: u64,
    speciation_rate: f64,
    reference: u64,
    rng: RandomSource,
    /// Cumulative individual count to species id.
    ind_to_species: BTreeMap<u64, u64>,
    seen_individuals: u64,
    max_species_id: u64,
}

impl AnalyticalMetacommunity {
    pub fn new(
        size: u64,
        speciation_rate: f64,
        seed: u64,
        reference: u64,
        local_community_size: u64,
    ) -> Result<Self> {
        if size == 0 {
            return Err(SimError::config("metacommunity size must be non-zero"));
        }
        let mut metacommunity = Self {
            size,
            speciation_rate,
            reference,
            rng: RandomSource::with_seed(seed),
            ind_to_species: BTreeMap::new(),
            seen_individuals: 0,
            max_species_id: 0,
        };
        let richness = expected_species_richness(size, speciation_rate);
        info!(size, richness, "burning in analytical species abundances");
        for _ in 0..richness {
            metacommunity.add_new_species();
        }
        // The local community must be coverable by the individuals seen
        // so far.
        if metacommunity.seen_individuals < local_community_size.min(size) {
            return Err(SimError::invariant(format!(
                "analytical metacommunity has seen {} individuals, fewer than the local \
                 community size {local_community_size}",
                metacommunity.seen_individuals
            )));
        }
        Ok(metacommunity)
    }

    fn add_new_species(&mut self) {
        if self.seen_individuals >= self.size {
            return;
        }
        let remaining = self.size - self.seen_individuals;
        let mut abundance;
        loop {
            abundance = self
                .rng
                .logarithmic(1.0 - self.speciation_rate)
                .clamp(1, self.size);
            if abundance <= remaining {
                break;
            }
        }
        self.max_species_id += 1;
        self.seen_individuals += abundance;
        self.ind_to_species
            .insert(self.seen_individuals, self.max_species_id);
    }
}

impl SpeciesIdentitySource for AnalyticalMetacommunity {
    fn random_species_id(&mut self) -> Result<u64> {
        let individual = self.rng.uint_in(self.size - 1);
        if individual >= self.seen_individuals {
            self.add_new_species();
            return Ok(self.max_species_id);
        }
        let species = self
            .ind_to_species
            .range(individual + 1..)
            .next()
            .map(|(_, &species)| species)
            .ok_or_else(|| {
                SimError::invariant(format!(
                    "individual {individual} not covered by the cumulative abundance table"
                ))
            })?;
        Ok(species)
    }

    fn reference(&self) -> u64 {
        self.reference
    }

    fn community_size(&self) -> u64 {
        self.size
    }
}

/// Metacommunity read from a supplied species-to-abundance table.
pub struct TabulatedMetacommunity {
    /// (cumulative count, species id) pairs in table order.
    cumulative: Vec<(u64, u64)>,
    total: u64,
    reference: u64,
    rng: RandomSource,
}

impl TabulatedMetacommunity {
    pub fn from_abundances(
        abundances: &BTreeMap<u64, u64>,
        seed: u64,
        reference: u64,
    ) -> Result<Self> {
        let mut cumulative = Vec::with_capacity(abundances.len());
        let mut running = 0u64;
        for (&species, &count) in abundances {
            if count == 0 {
                continue;
            }
            running += count;
            cumulative.push((running, species));
        }
        if running == 0 {
            return Err(SimError::config(
                "tabulated metacommunity has no individuals",
            ));
        }
        Ok(Self {
            cumulative,
            total: running,
            reference,
            rng: RandomSource::with_seed(seed),
        })
    }
}

impl SpeciesIdentitySource for TabulatedMetacommunity {
    fn random_species_id(&mut self) -> Result<u64> {
        let individual = self.rng.uint_in(self.total - 1);
        let index = self
            .cumulative
            .partition_point(|&(sum, _)| sum <= individual);
        Ok(self.cumulative[index].1)
    }

    fn reference(&self) -> u64 {
        self.reference
    }

    fn community_size(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_metacommunity_covers_all_individuals() {
        let metacommunity = SimulatedMetacommunity::generate(500, 0.01, 42, 1).unwrap();
        assert_eq!(metacommunity.community_size(), 500);
        assert!(!metacommunity.cumulative.is_empty());
        assert_eq!(*metacommunity.cumulative.last().unwrap(), 500);
    }

    #[test]
    fn simulated_draws_stay_in_range() {
        let mut metacommunity = SimulatedMetacommunity::generate(200, 0.05, 7, 1).unwrap();
        let species = metacommunity.cumulative.len() as u64;
        for _ in 0..1000 {
            let id = metacommunity.random_species_id().unwrap();
            assert!(id >= 1 && id <= species);
        }
    }

    #[test]
    fn richness_formula_is_monotone_in_rate() {
        let low = expected_species_richness(10_000, 1e-4);
        let high = expected_species_richness(10_000, 1e-2);
        assert!(high > low);
        assert!(high <= 10_000);
    }

    #[test]
    fn analytical_seen_individuals_cover_the_local_community() {
        let metacommunity = AnalyticalMetacommunity::new(100_000, 0.001, 3, 1, 500).unwrap();
        assert!(metacommunity.seen_individuals >= 500);
    }

    #[test]
    fn analytical_draws_mint_species_on_demand() {
        let mut metacommunity = AnalyticalMetacommunity::new(10_000, 0.01, 11, 1, 100).unwrap();
        for _ in 0..2000 {
            let id = metacommunity.random_species_id().unwrap();
            assert!(id >= 1 && id <= metacommunity.max_species_id);
        }
        assert!(metacommunity.seen_individuals <= metacommunity.size);
    }

    #[test]
    fn tabulated_respects_the_supplied_table() {
        let mut table = BTreeMap::new();
        table.insert(7u64, 1u64);
        table.insert(9u64, 3u64);
        let mut metacommunity = TabulatedMetacommunity::from_abundances(&table, 5, 2).unwrap();
        let mut seen_seven = 0;
        let mut seen_nine = 0;
        for _ in 0..2000 {
            match metacommunity.random_species_id().unwrap() {
                7 => seen_seven += 1,
                9 => seen_nine += 1,
                other => panic!("unexpected species {other}"),
            }
        }
        assert!(seen_nine > seen_seven);
    }

    #[test]
    fn abundance_structure_is_seed_invariant_up_to_relabelling() {
        let a = SimulatedMetacommunity::generate(300, 0.02, 1, 1).unwrap();
        let b = SimulatedMetacommunity::generate(300, 0.02, 1, 1).unwrap();
        assert_eq!(a.cumulative, b.cumulative);
    }
}
