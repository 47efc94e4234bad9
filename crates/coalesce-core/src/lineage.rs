//! Live lineages and the genealogy table.
//!
//! Both tables are dense, 1-indexed arenas: index 0 is reserved as null so
//! parent/next references can use 0 as a terminator, cycles are impossible
//! by construction, and pause/resume is a flat dump. `endactive` and
//! `enddata` mark the in-use suffixes; the vectors grow geometrically and
//! never shrink within a run.

use crate::config::ProtractedParameters;
use crate::error::{Result, SimError};
use crate::location::MapLocation;
use serde::{Deserialize, Serialize};

/// One live lineage, tracked backwards in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub location: MapLocation,
    /// Index of this lineage's current node in the genealogy table.
    pub reference: usize,
    /// Slot inside the owning cell's on-grid list; 0 when off-grid.
    pub list_position: usize,
    /// 1-based position inside the owning cell's wrapped list; 0 when
    /// on-grid.
    pub nwrap: usize,
    /// Smallest speciation rate that would have speciated this branch;
    /// used by the richness estimator.
    pub minmax: f64,
}

impl Lineage {
    #[must_use]
    pub fn new(location: MapLocation, reference: usize, list_position: usize) -> Self {
        Self {
            location,
            reference,
            list_position,
            nwrap: 0,
            minmax: 1.0,
        }
    }

    #[must_use]
    pub const fn is_on_grid(&self) -> bool {
        self.location.is_on_grid()
    }
}

/// One genealogy vertex. Nodes are permanent: tips for sampled
/// individuals, internal nodes appended at coalescence events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenealogyNode {
    /// Whether this node is a sampled individual.
    pub tip: bool,
    /// Where the node came into existence.
    pub origin: MapLocation,
    /// Parent node index; 0 = root / unresolved.
    pub parent: usize,
    /// Number of generations this lineage existed before its parent event.
    pub generations_existed: u64,
    /// Generation at which the node was created (tips: the sample time).
    pub generation: f64,
    /// Uniform draw on [0, 1) fixed at creation; compared against the
    /// per-rate speciation threshold.
    pub spec_rate: f64,
    pub speciated: bool,
    /// Scratch flag reused by the richness estimator and the community
    /// builder: reachable from a selected tip.
    pub exists: bool,
    /// Scratch species assignment for the community builder.
    pub species_id: u64,
}

impl GenealogyNode {
    #[must_use]
    pub fn tip(origin: MapLocation, generation: f64, spec_rate: f64) -> Self {
        Self {
            tip: true,
            origin,
            generation,
            spec_rate,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn internal(origin: MapLocation, generation: f64, spec_rate: f64) -> Self {
        Self {
            tip: false,
            origin,
            generation,
            spec_rate,
            ..Self::default()
        }
    }

    /// Reset the scratch flags between community applications.
    pub fn reset_scratch(&mut self) {
        self.speciated = false;
        self.exists = false;
        self.species_id = 0;
    }
}

/// Point-speciation test: a branch alive `generations` generations
/// speciates at rate `rate` iff its stored uniform falls below
/// `1 - (1 - rate)^generations`.
#[must_use]
pub fn speciation_occurs(spec_rate_draw: f64, rate: f64, generations: u64) -> bool {
    spec_rate_draw < 1.0 - (1.0 - rate).powf(generations as f64)
}

/// Protracted variant: the branch must be older than the minimum window,
/// and is forced to speciate past the maximum.
#[must_use]
pub fn protracted_speciation_occurs(
    spec_rate_draw: f64,
    rate: f64,
    generations: u64,
    window: &ProtractedParameters,
) -> bool {
    let age = generations as f64;
    if age < window.min_speciation_gen {
        return false;
    }
    if window.max_speciation_gen > 0.0 && age >= window.max_speciation_gen {
        return true;
    }
    speciation_occurs(spec_rate_draw, rate, generations)
}

/// The two dense arenas: `active` live lineages and `data` genealogy
/// nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageStore {
    pub(crate) active: Vec<Lineage>,
    pub(crate) data: Vec<GenealogyNode>,
    pub(crate) endactive: usize,
    pub(crate) enddata: usize,
}

impl LineageStore {
    /// Allocate for an initial sample of `initial_count` individuals. The
    /// genealogy gets twice that plus slack, since a binary coalescent
    /// adds at most `n - 1` internal nodes.
    #[must_use]
    pub fn sized_for(initial_count: usize) -> Self {
        Self {
            active: vec![Lineage::default(); initial_count + 1],
            data: vec![GenealogyNode::default(); 2 * initial_count + 1],
            endactive: 0,
            enddata: 0,
        }
    }

    #[must_use]
    pub const fn endactive(&self) -> usize {
        self.endactive
    }

    #[must_use]
    pub const fn enddata(&self) -> usize {
        self.enddata
    }

    #[must_use]
    pub fn lineage(&self, index: usize) -> &Lineage {
        &self.active[index]
    }

    pub fn lineage_mut(&mut self, index: usize) -> &mut Lineage {
        &mut self.active[index]
    }

    #[must_use]
    pub fn node(&self, index: usize) -> &GenealogyNode {
        &self.data[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut GenealogyNode {
        &mut self.data[index]
    }

    /// The node a live lineage currently points at.
    #[must_use]
    pub fn node_of(&self, lineage_index: usize) -> &GenealogyNode {
        &self.data[self.active[lineage_index].reference]
    }

    pub fn node_of_mut(&mut self, lineage_index: usize) -> &mut GenealogyNode {
        let reference = self.active[lineage_index].reference;
        &mut self.data[reference]
    }

    /// Ensure room for `extra_active` more lineages and `extra_data` more
    /// nodes, accounting for the coalescence events the new lineages can
    /// still produce.
    pub fn reserve(&mut self, extra_active: usize, extra_data: usize) {
        let min_active = self.endactive + extra_active + 2;
        let min_data = self.enddata + extra_data + 2 + 2 * min_active;
        if self.data.len() < min_data {
            self.data.resize(min_data.max(self.data.len() * 2), GenealogyNode::default());
        }
        if self.active.len() < min_active {
            self.active
                .resize(min_active.max(self.active.len() * 2), Lineage::default());
        }
    }

    /// Append a genealogy node, returning its 1-based index.
    pub fn push_node(&mut self, node: GenealogyNode) -> usize {
        self.enddata += 1;
        if self.enddata >= self.data.len() {
            self.data
                .resize((self.enddata + 1).max(self.data.len() * 2), GenealogyNode::default());
        }
        self.data[self.enddata] = node;
        self.enddata
    }

    /// Append a live lineage, returning its 1-based index.
    pub fn push_lineage(&mut self, lineage: Lineage) -> usize {
        self.endactive += 1;
        if self.endactive >= self.active.len() {
            self.active
                .resize((self.endactive + 1).max(self.active.len() * 2), Lineage::default());
        }
        self.active[self.endactive] = lineage;
        self.endactive
    }

    /// Every genealogy node reachable from a live lineage must either have
    /// a parent or be marked speciated once the run completes.
    pub fn validate_genealogy(&self, min_rate: f64) -> Result<()> {
        for i in 1..=self.enddata {
            let node = &self.data[i];
            if node.parent == 0
                && !node.speciated
                && !speciation_occurs(node.spec_rate, min_rate, node.generations_existed)
            {
                return Err(SimError::invariant(format!(
                    "genealogy node {i} has no parent and has not speciated"
                )));
            }
            if node.parent > self.enddata {
                return Err(SimError::invariant(format!(
                    "genealogy node {i} points at parent {} beyond enddata {}",
                    node.parent, self.enddata
                )));
            }
        }
        Ok(())
    }
}
