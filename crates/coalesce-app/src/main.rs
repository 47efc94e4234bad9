//! Command-line runner: layered configuration in, DuckDB database out.
//!
//! Exit codes: 0 completed, 1 paused, 2 configuration error, 3 runtime
//! invariant error.

mod maps;

use anyhow::{Context, Result};
use clap::Parser;
use coalesce_core::{
    build_metacommunity, pause_file_path, Fragment, RunOutcome, SimError, SimParameters,
    Simulation,
};
use coalesce_storage::Storage;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "coalesce", version, about = "Spatially explicit neutral coalescence simulator")]
struct AppCli {
    /// Layered configuration files (TOML) applied in order.
    #[arg(
        long = "config",
        value_name = "FILE",
        required = true,
        env = "COALESCE_CONFIG",
        value_delimiter = ';'
    )]
    config_layers: Vec<PathBuf>,
    /// Resume the paused run identified by the configured task and seed.
    #[arg(long)]
    resume: bool,
    /// Override the configured seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Override the configured task reference.
    #[arg(long)]
    task: Option<u64>,
}

/// Full application configuration: the engine parameter record plus the
/// post-simulation community instructions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    simulation: SimParameters,
    /// Speciation rates applied by the community builder; the simulated
    /// minimum is always included.
    speciation_rates: Vec<f64>,
    fragments: Vec<Fragment>,
}

fn main() -> ExitCode {
    let cli = AppCli::parse();
    init_tracing();
    match run(&cli) {
        Ok(RunOutcome::Complete) => ExitCode::SUCCESS,
        Ok(RunOutcome::Paused) => ExitCode::from(1),
        Err(err) => {
            let code = err
                .downcast_ref::<SimError>()
                .map_or(3, SimError::exit_code);
            error!("{err:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(3))
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn run(cli: &AppCli) -> Result<RunOutcome> {
    let mut config = compose_config(&cli.config_layers)?;
    if let Some(seed) = cli.seed {
        config.simulation.seed = seed;
    }
    if let Some(task) = cli.task {
        config.simulation.task = task;
    }
    config
        .simulation
        .validate()
        .context("configuration failed validation")?;

    let inputs = maps::load_inputs(&config.simulation)?;
    let mut simulation = if cli.resume {
        let dump = pause_file_path(
            &config.simulation.output_directory,
            config.simulation.task,
            config.simulation.seed,
        );
        info!(path = %dump.display(), "resuming from pause dump");
        let state = Simulation::load_pause(&dump)?;
        Simulation::resume(state, inputs)?
    } else {
        Simulation::new(config.simulation.clone(), inputs)?
    };

    let outcome = simulation.run()?;
    if outcome == RunOutcome::Paused {
        let path = simulation.save_pause()?;
        info!(path = %path.display(), "simulation paused; resume with --resume");
        return Ok(RunOutcome::Paused);
    }

    write_output(&config, &mut simulation)?;
    Ok(RunOutcome::Complete)
}

/// Merge configuration layers through JSON values, later layers winning
/// key by key.
fn compose_config(layers: &[PathBuf]) -> Result<AppConfig> {
    let mut merged = serde_json::to_value(AppConfig::default()).expect("serialize default config");
    for path in layers {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration layer {}", path.display()))?;
        let layer: JsonValue = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML layer {}", path.display()))?;
        info!(layer = %path.display(), "applying configuration layer");
        merge_layer(&mut merged, layer);
    }
    serde_json::from_value(merged).context("failed to deserialize merged configuration")
}

fn merge_layer(base: &mut JsonValue, layer: JsonValue) {
    match (base, layer) {
        (JsonValue::Object(base_map), JsonValue::Object(layer_map)) => {
            for (key, value) in layer_map {
                if let Some(existing) = base_map.get_mut(&key) {
                    merge_layer(existing, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (target, value) => {
            *target = value;
        }
    }
}

fn database_path(params: &SimParameters) -> PathBuf {
    params
        .output_directory
        .join(format!("data_{}_{}.duckdb", params.task, params.seed))
}

/// Apply the configured speciation rates and write every table.
fn write_output(config: &AppConfig, simulation: &mut Simulation) -> Result<()> {
    let params = simulation.params().clone();
    std::fs::create_dir_all(&params.output_directory).map_err(|err| {
        SimError::resource(format!(
            "cannot create output directory {}: {err}",
            params.output_directory.display()
        ))
    })?;
    let path = database_path(&params);
    info!(path = %path.display(), "writing output database");
    let mut storage = Storage::open(&path).map_err(to_transient)?;
    storage
        .write_simulation_parameters(&params, true)
        .map_err(to_transient)?;
    storage
        .write_species_list(simulation.store())
        .map_err(to_transient)?;

    let mut rates = config.speciation_rates.clone();
    if !rates.contains(&params.min_speciation_rate) {
        rates.push(params.min_speciation_rate);
    }
    let times = if params.times.is_empty() {
        vec![0.0]
    } else {
        params.times.clone()
    };

    let mut metacommunity = match &params.metacommunity {
        Some(meta) => {
            let tip_count = {
                let store = simulation.store();
                (1..=store.enddata())
                    .filter(|&i| store.node(i).tip)
                    .count() as u64
            };
            let tabulated = if meta.option == coalesce_core::MetacommunityOption::Database {
                Some(
                    storage
                        .species_abundances(meta.external_reference)
                        .map_err(to_transient)?,
                )
            } else {
                None
            };
            let sampler = build_metacommunity(
                meta,
                params.seed.wrapping_add(1),
                1,
                tip_count,
                tabulated,
            )?;
            storage
                .write_metacommunity_parameters(
                    1,
                    meta.size,
                    meta.speciation_rate,
                    meta.option,
                    meta.external_reference,
                )
                .map_err(to_transient)?;
            Some(sampler)
        }
        None => None,
    };

    let outputs = {
        let mut builder = simulation
            .community_builder()
            .with_fragments(config.fragments.clone());
        builder.apply_all(
            &rates,
            &times,
            params.protracted,
            metacommunity.as_deref_mut(),
        )?
    };
    for output in &outputs {
        storage.write_community(output).map_err(to_transient)?;
    }
    info!(communities = outputs.len(), "output complete");
    Ok(())
}

fn to_transient(err: coalesce_storage::StorageError) -> SimError {
    SimError::transient(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_merge_key_by_key() {
        let mut base = serde_json::json!({
            "simulation": {"seed": 1, "deme": 4},
            "speciation_rates": [0.1]
        });
        let layer = serde_json::json!({
            "simulation": {"seed": 9},
            "fragments": []
        });
        merge_layer(&mut base, layer);
        assert_eq!(base["simulation"]["seed"], 9);
        assert_eq!(base["simulation"]["deme"], 4);
        assert_eq!(base["speciation_rates"][0], 0.1);
    }

    #[test]
    fn config_parses_from_toml() {
        let toml_text = r#"
            speciation_rates = [0.001, 0.01]

            [simulation]
            seed = 7
            deme = 2
            min_speciation_rate = 0.001
            fine_map_x_size = 4
            fine_map_y_size = 4

            [[fragments]]
            name = "west"
            x_min = 0
            x_max = 1
            y_min = 0
            y_max = 3
        "#;
        let parsed: JsonValue = toml::from_str(toml_text).unwrap();
        let mut merged =
            serde_json::to_value(AppConfig::default()).expect("default config serializes");
        merge_layer(&mut merged, parsed);
        let config: AppConfig = serde_json::from_value(merged).unwrap();
        assert_eq!(config.simulation.seed, 7);
        assert_eq!(config.speciation_rates.len(), 2);
        assert_eq!(config.fragments[0].name, "west");
    }
}
