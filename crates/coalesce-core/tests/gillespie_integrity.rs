//! Heap-integrity smoke test for the Gillespie engine: a checkerboard
//! landscape with an empirical dispersal map, driven event by event with
//! every validation enabled.

use coalesce_core::{
    Cell, DispersalMethod, EventType, Grid, LandscapePolicy, SimParameters, Simulation,
    SimulationInputs, StrictnessPolicy, UNUSED,
};

/// Habitable cells of the 3x3 checkerboard.
const HABITABLE: [(usize, usize); 5] = [(0, 0), (2, 0), (1, 1), (0, 2), (2, 2)];

fn checkerboard_density() -> Grid<f64> {
    let mut density = Grid::new(3, 3, 0.0).unwrap();
    for &(x, y) in &HABITABLE {
        *density.get_mut(y, x) = 2.0;
    }
    density
}

/// Identity plus uniform mass to the next habitable cell in a fixed
/// cycle.
fn dispersal_matrix() -> Grid<f64> {
    let mut matrix = Grid::new(9, 9, 0.0).unwrap();
    for (position, &(x, y)) in HABITABLE.iter().enumerate() {
        let (nx, ny) = HABITABLE[(position + 1) % HABITABLE.len()];
        let source = y * 3 + x;
        let destination = ny * 3 + nx;
        *matrix.get_mut(source, source) = 0.5;
        *matrix.get_mut(source, destination) = 0.5;
    }
    matrix
}

fn gillespie_simulation(seed: u64, rate: f64) -> Simulation {
    let params = SimParameters {
        seed,
        deme: 1,
        min_speciation_rate: rate,
        fine_map_x_size: 3,
        fine_map_y_size: 3,
        landscape_type: LandscapePolicy::Closed,
        dispersal_method: DispersalMethod::Empirical,
        dispersal_file: Some("dispersal.csv".into()),
        strictness: StrictnessPolicy::strict(),
        ..SimParameters::default()
    };
    let inputs = SimulationInputs {
        landscape: coalesce_core::LandscapeInputs {
            fine: Some(checkerboard_density()),
            ..Default::default()
        },
        dispersal_matrix: Some(dispersal_matrix()),
        ..Default::default()
    };
    Simulation::new(params, inputs).unwrap()
}

fn assert_slots_cover_inhabited_cells(sim: &Simulation) {
    let state = sim.gillespie_state().expect("gillespie state");
    let heap = state.heap();
    let heap_index = state.heap_index();
    // Every used slot points at a heap node for its own cell.
    for y in 0..3 {
        for x in 0..3 {
            let slot = *heap_index.get(y, x);
            if slot == UNUSED {
                continue;
            }
            assert!(slot < heap.len(), "slot for ({x}, {y}) is out of the heap");
            assert_eq!(heap.node(slot).cell, Cell::new(x, y));
        }
    }
    // Every cell-event node in the heap is reflected in the slot table,
    // and no heap node points at an unused slot.
    for (index, node) in heap.iter().enumerate() {
        if node.event == EventType::Cell {
            assert_eq!(
                *heap_index.get(node.cell.y, node.cell.x),
                index,
                "heap node {index} missing from the slot table"
            );
        }
    }
    // Every inhabited cell is scheduled.
    let store = sim.store();
    for i in 1..=store.endactive() {
        let location = store.lineage(i).location;
        let slot = *heap_index.get(location.y as usize, location.x as usize);
        assert_ne!(
            slot, UNUSED,
            "inhabited cell ({}, {}) has no scheduled event",
            location.x, location.y
        );
    }
}

#[test]
fn heap_and_slot_table_survive_ten_thousand_events() {
    let mut sim = gillespie_simulation(2001, 1e-9);
    assert_eq!(sim.store().endactive(), 10);
    sim.setup_gillespie().unwrap();
    assert_slots_cover_inhabited_cells(&sim);
    for _ in 0..10_000 {
        if sim.store().endactive() <= 1 {
            break;
        }
        // Strictness re-validates the heap property and the two-way slot
        // consistency inside every step.
        sim.gillespie_step().unwrap();
        assert_slots_cover_inhabited_cells(&sim);
        sim.validate_lineages().unwrap();
    }
}

#[test]
fn gillespie_and_event_counters_advance_monotonically() {
    let mut sim = gillespie_simulation(2002, 1e-9);
    sim.setup_gillespie().unwrap();
    let mut last_generation = sim.generation();
    let mut last_steps = sim.steps();
    for _ in 0..500 {
        if sim.store().endactive() <= 1 {
            break;
        }
        sim.gillespie_step().unwrap();
        assert!(sim.generation() >= last_generation, "generation went backwards");
        assert!(sim.steps() >= last_steps, "step estimate went backwards");
        last_generation = sim.generation();
        last_steps = sim.steps();
    }
}

#[test]
fn full_gillespie_run_reaches_a_single_species() {
    let params = SimParameters {
        seed: 2003,
        deme: 1,
        min_speciation_rate: 1e-9,
        fine_map_x_size: 3,
        fine_map_y_size: 3,
        landscape_type: LandscapePolicy::Closed,
        dispersal_method: DispersalMethod::Empirical,
        dispersal_file: Some("dispersal.csv".into()),
        gillespie_threshold: Some(1_000),
        strictness: StrictnessPolicy::strict(),
        ..SimParameters::default()
    };
    let inputs = SimulationInputs {
        landscape: coalesce_core::LandscapeInputs {
            fine: Some(checkerboard_density()),
            ..Default::default()
        },
        dispersal_matrix: Some(dispersal_matrix()),
        ..Default::default()
    };
    let mut sim = Simulation::new(params, inputs).unwrap();
    assert_eq!(sim.run().unwrap(), coalesce_core::RunOutcome::Complete);
    let mut builder = sim.community_builder();
    let output = builder.apply(1e-9, 0.0, None, None).unwrap();
    assert_eq!(output.species_richness(), 1);
    assert_eq!(output.total_individuals(), 10);
}
