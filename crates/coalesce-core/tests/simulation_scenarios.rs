//! End-to-end scenarios for the per-event engine and the community
//! builder.

use coalesce_core::{
    CommunityBuilder, LandscapePolicy, RunOutcome, SimParameters, SimulatedMetacommunity,
    Simulation, SimulationInputs, StrictnessPolicy,
};

fn uniform_params(size: usize, deme: u32, rate: f64, seed: u64) -> SimParameters {
    SimParameters {
        seed,
        deme,
        min_speciation_rate: rate,
        fine_map_x_size: size,
        fine_map_y_size: size,
        landscape_type: LandscapePolicy::Closed,
        sigma: 1.5,
        strictness: StrictnessPolicy {
            historical_regression: false,
            heap_validation: false,
            lineage_validation: false,
        },
        ..SimParameters::default()
    }
}

/// Capacity-uniform 10x10 grid, full sampling, speciation rate 1: every
/// sampled individual becomes its own species.
#[test]
fn nonspatial_sanity_rate_one_gives_one_species_per_individual() {
    let params = uniform_params(10, 1, 1.0, 1001);
    let mut sim = Simulation::new(params, SimulationInputs::default()).unwrap();
    assert_eq!(sim.store().endactive(), 100);
    assert_eq!(sim.run().unwrap(), RunOutcome::Complete);

    let mut builder = sim.community_builder();
    let output = builder.apply(1.0, 0.0, None, None).unwrap();
    assert_eq!(output.species_richness(), 100);
    assert!(output.abundances.values().all(|&count| count == 1));
}

/// Same grid with a vanishing speciation rate: everything coalesces into
/// a single species, and the genealogy is a rooted binary tree with
/// `n - 1` internal nodes.
#[test]
fn full_coalescence_yields_one_species_and_a_binary_tree() {
    let params = uniform_params(10, 1, 1e-12, 1002);
    let mut sim = Simulation::new(params, SimulationInputs::default()).unwrap();
    assert_eq!(sim.run().unwrap(), RunOutcome::Complete);

    let store = sim.store();
    let tips = (1..=store.enddata())
        .filter(|&i| store.node(i).tip)
        .count();
    assert_eq!(tips, 100);
    assert_eq!(store.enddata(), 199, "99 coalescences expected");
    // Every node except the root has a parent.
    let roots = (1..=store.enddata())
        .filter(|&i| store.node(i).parent == 0)
        .count();
    assert_eq!(roots, 1);

    let mut builder = sim.community_builder();
    let output = builder.apply(1e-12, 0.0, None, None).unwrap();
    assert_eq!(output.species_richness(), 1);
    assert_eq!(output.total_individuals(), 100);
}

/// A single sampled individual terminates immediately and speciates.
#[test]
fn single_lineage_exits_with_one_species() {
    let params = uniform_params(1, 1, 1e-6, 1003);
    let mut sim = Simulation::new(params, SimulationInputs::default()).unwrap();
    assert_eq!(sim.store().endactive(), 1);
    assert_eq!(sim.run().unwrap(), RunOutcome::Complete);
    let mut builder = sim.community_builder();
    let output = builder.apply(1e-6, 0.0, None, None).unwrap();
    assert_eq!(output.species_richness(), 1);
    assert_eq!(output.total_individuals(), 1);
}

/// Linear 1x5 landscape sampled at two times: both sample points emit a
/// full set of tips, recoverable per time from the community builder.
#[test]
fn temporal_sampling_emits_tips_for_both_sample_points() {
    let mut params = SimParameters {
        seed: 1004,
        deme: 2,
        min_speciation_rate: 1e-6,
        fine_map_x_size: 5,
        fine_map_y_size: 1,
        landscape_type: LandscapePolicy::Closed,
        sigma: 1.0,
        ..SimParameters::default()
    };
    params.times = vec![0.0, 100.0];
    let mut sim = Simulation::new(params, SimulationInputs::default()).unwrap();
    assert_eq!(sim.store().endactive(), 10);
    assert_eq!(sim.run().unwrap(), RunOutcome::Complete);

    let expected_per_time = 10;
    let store = sim.store();
    let tips_at = |time: f64| {
        (1..=store.enddata())
            .filter(|&i| {
                let node = store.node(i);
                node.tip && (node.generation - time).abs() < 1e-8
            })
            .count()
    };
    assert_eq!(tips_at(0.0), expected_per_time);
    assert_eq!(tips_at(100.0), expected_per_time);

    let mut builder = sim.community_builder();
    let at_zero = builder.apply(1e-6, 0.0, None, None).unwrap();
    let at_hundred = builder.apply(1e-6, 100.0, None, None).unwrap();
    assert_eq!(at_zero.total_individuals(), expected_per_time as u64);
    assert_eq!(at_hundred.total_individuals(), expected_per_time as u64);
}

/// Applying `{r1, r2}` in one builder equals applying them one at a time
/// on copies of the genealogy.
#[test]
fn community_application_is_independent_per_rate() {
    let params = uniform_params(6, 2, 1e-4, 1005);
    let mut sim = Simulation::new(params, SimulationInputs::default()).unwrap();
    assert_eq!(sim.run().unwrap(), RunOutcome::Complete);

    let mut combined_store = sim.store().clone();
    let mut first_store = sim.store().clone();
    let mut second_store = sim.store().clone();

    let mut combined = CommunityBuilder::new(&mut combined_store, 1e-4, 6, 6);
    let outputs = combined
        .apply_all(&[1e-4, 1e-2], &[0.0], None, None)
        .unwrap();
    assert_eq!(outputs.len(), 2);

    let mut first = CommunityBuilder::new(&mut first_store, 1e-4, 6, 6);
    let alone_low = first.apply(1e-4, 0.0, None, None).unwrap();
    let mut second = CommunityBuilder::new(&mut second_store, 1e-4, 6, 6);
    let alone_high = second.apply(1e-2, 0.0, None, None).unwrap();

    assert_eq!(outputs[0].abundances, alone_low.abundances);
    assert_eq!(outputs[1].abundances, alone_high.abundances);
    // Higher rates can only split species further.
    assert!(outputs[1].species_richness() >= outputs[0].species_richness());
}

/// Two metacommunity draws differing only in seed relabel species but
/// leave the abundance multiset intact.
#[test]
fn metacommunity_seed_only_permutes_species_identities() {
    let params = uniform_params(5, 2, 1e-3, 1006);
    let mut sim = Simulation::new(params, SimulationInputs::default()).unwrap();
    assert_eq!(sim.run().unwrap(), RunOutcome::Complete);

    let multiset = |seed: u64, store: &coalesce_core::LineageStore| {
        let mut store = store.clone();
        let mut metacommunity =
            SimulatedMetacommunity::generate(100_000, 0.9, seed, 1).unwrap();
        let mut builder = CommunityBuilder::new(&mut store, 1e-3, 5, 5);
        let output = builder
            .apply(1e-3, 0.0, None, Some(&mut metacommunity))
            .unwrap();
        let mut counts: Vec<u64> = output.abundances.values().copied().collect();
        counts.sort_unstable();
        counts
    };
    let first = multiset(11, sim.store());
    let second = multiset(22, sim.store());
    assert_eq!(first, second);
}

/// Zero-capacity cells can never hold lineages.
#[test]
fn zero_capacity_cells_are_never_occupied() {
    use coalesce_core::Grid;
    let mut density = Grid::new(4, 4, 1.0).unwrap();
    *density.get_mut(1, 1) = 0.0;
    *density.get_mut(2, 3) = 0.0;
    let params = SimParameters {
        strictness: StrictnessPolicy::strict(),
        ..uniform_params(4, 2, 1e-3, 1007)
    };
    let inputs = SimulationInputs {
        landscape: coalesce_core::LandscapeInputs {
            fine: Some(density),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut sim = Simulation::new(params, inputs).unwrap();
    assert_eq!(sim.store().endactive(), (16 - 2) * 2);
    for _ in 0..2000 {
        if sim.store().endactive() <= 1 {
            break;
        }
        sim.single_step().unwrap();
        let store = sim.store();
        for i in 1..=store.endactive() {
            let location = store.lineage(i).location;
            assert!(
                !((location.x == 1 && location.y == 1) || (location.x == 3 && location.y == 2)),
                "lineage {i} occupies a zero-capacity cell"
            );
        }
    }
}
