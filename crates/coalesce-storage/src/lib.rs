//! DuckDB-backed persistence for simulation output.
//!
//! The sink owns the output schema: the full genealogy (`SPECIES_LIST`),
//! per-community species tables, and the parameter records that make a
//! database self-describing. Opening retries briefly to tolerate
//! transient locks; the handle is held for the shortest span possible by
//! the caller.

use coalesce_core::{
    CommunityOutput, LineageStore, MetacommunityOption, SimParameters,
};
use duckdb::{params, Connection, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// How many times a locked database is retried before giving up.
const OPEN_ATTEMPTS: u32 = 10;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("database did not open after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },
}

/// DuckDB-backed sink for the simulation output schema.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database, retrying transient failures with a
    /// short backoff before aborting.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut delay = Duration::from_secs(1);
        let mut last_error = String::new();
        for attempt in 1..=OPEN_ATTEMPTS {
            match Connection::open(path) {
                Ok(conn) => {
                    let mut storage = Self { conn };
                    storage.initialize_schema()?;
                    return Ok(storage);
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(attempt, error = %last_error, "database open failed; retrying");
                    thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_secs(4));
                }
            }
        }
        Err(StorageError::Unavailable {
            attempts: OPEN_ATTEMPTS,
            message: last_error,
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "create table if not exists SIMULATION_PARAMETERS (
                seed bigint not null,
                task bigint not null,
                output_dir text not null,
                max_time bigint not null,
                deme bigint not null,
                deme_sample double not null,
                speciation_rate double not null,
                desired_species bigint not null,
                sigma double not null,
                tau double not null,
                m_probability double not null,
                cutoff double not null,
                dispersal_method text not null,
                restrict_self boolean not null,
                landscape_type text not null,
                dispersal_map text not null,
                fine_map_file text not null,
                fine_map_x bigint not null,
                fine_map_y bigint not null,
                fine_map_x_offset bigint not null,
                fine_map_y_offset bigint not null,
                coarse_map_file text not null,
                coarse_map_x bigint not null,
                coarse_map_y bigint not null,
                coarse_map_x_offset bigint not null,
                coarse_map_y_offset bigint not null,
                coarse_map_scale bigint not null,
                historical_fine_map text not null,
                historical_coarse_map text not null,
                gen_since_historical double not null,
                habitat_change_rate double not null,
                sample_file text not null,
                sample_x bigint not null,
                sample_y bigint not null,
                sample_x_offset bigint not null,
                sample_y_offset bigint not null,
                grid_x bigint not null,
                grid_y bigint not null,
                protracted boolean not null,
                min_speciation_gen double not null,
                max_speciation_gen double not null,
                sim_complete boolean not null
            );
            create table if not exists SPECIES_LIST (
                node_id bigint primary key,
                parent bigint,
                speciated boolean,
                tip boolean,
                exists_flag boolean,
                randnum double,
                gen_alive bigint,
                spec_rate double,
                x bigint,
                y bigint,
                xwrap bigint,
                ywrap bigint,
                generation double
            );
            create table if not exists SPECIES_ABUNDANCES (
                community_reference bigint,
                species_id bigint,
                count bigint,
                primary key (community_reference, species_id)
            );
            create table if not exists SPECIES_LOCATIONS (
                community_reference bigint,
                species_id bigint,
                x bigint,
                y bigint
            );
            create table if not exists FRAGMENT_ABUNDANCES (
                community_reference bigint,
                fragment text,
                species_id bigint,
                count bigint,
                primary key (community_reference, fragment, species_id)
            );
            create table if not exists COMMUNITY_PARAMETERS (
                reference bigint primary key,
                speciation_rate double,
                time double,
                fragments boolean,
                metacommunity_reference bigint,
                protracted_min double,
                protracted_max double
            );
            create table if not exists METACOMMUNITY_PARAMETERS (
                reference bigint primary key,
                size bigint,
                speciation_rate double,
                option text,
                external_reference bigint
            );",
        )?;
        Ok(())
    }

    fn path_string(path: Option<&std::path::PathBuf>) -> String {
        path.map_or_else(|| "none".to_string(), |p| p.display().to_string())
    }

    /// Record the full scalar parameter set alongside the completion
    /// flag.
    pub fn write_simulation_parameters(
        &mut self,
        parameters: &SimParameters,
        sim_complete: bool,
    ) -> Result<(), StorageError> {
        let protracted = parameters.protracted.unwrap_or_default();
        self.conn.execute(
            "insert into SIMULATION_PARAMETERS values (
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            )",
            params![
                parameters.seed as i64,
                parameters.task as i64,
                parameters.output_directory.display().to_string(),
                parameters.max_time as i64,
                i64::from(parameters.deme),
                parameters.deme_sample,
                parameters.min_speciation_rate,
                parameters.desired_species as i64,
                parameters.sigma,
                parameters.tau,
                parameters.m_probability,
                parameters.cutoff,
                parameters.dispersal_method.as_str(),
                parameters.restrict_self,
                parameters.landscape_type.as_str(),
                Self::path_string(parameters.dispersal_file.as_ref()),
                Self::path_string(parameters.fine_map_file.as_ref()),
                parameters.fine_map_x_size as i64,
                parameters.fine_map_y_size as i64,
                parameters.fine_map_x_offset,
                parameters.fine_map_y_offset,
                Self::path_string(parameters.coarse_map_file.as_ref()),
                parameters.coarse_map_x_size as i64,
                parameters.coarse_map_y_size as i64,
                parameters.coarse_map_x_offset,
                parameters.coarse_map_y_offset,
                i64::from(parameters.coarse_map_scale),
                Self::path_string(parameters.historical_fine_map_file.as_ref()),
                Self::path_string(parameters.historical_coarse_map_file.as_ref()),
                parameters.gen_since_historical,
                parameters.habitat_change_rate,
                Self::path_string(parameters.sample_mask_file.as_ref()),
                parameters.sample_x_size as i64,
                parameters.sample_y_size as i64,
                parameters.sample_x_offset,
                parameters.sample_y_offset,
                parameters.grid_x_size as i64,
                parameters.grid_y_size as i64,
                parameters.protracted.is_some(),
                protracted.min_speciation_gen,
                protracted.max_speciation_gen,
                sim_complete,
            ],
        )?;
        Ok(())
    }

    /// Dump the raw genealogy. `spec_rate` per row is the smallest
    /// speciation rate at which that node would speciate.
    pub fn write_species_list(&mut self, store: &LineageStore) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        Self::insert_species_list(&tx, store)?;
        tx.commit()?;
        self.conn.execute("VACUUM;", [])?;
        info!(nodes = store.enddata(), "species list written");
        Ok(())
    }

    fn insert_species_list(
        tx: &Transaction<'_>,
        store: &LineageStore,
    ) -> Result<(), duckdb::Error> {
        let mut stmt = tx.prepare(
            "insert or replace into SPECIES_LIST (
                node_id, parent, speciated, tip, exists_flag, randnum, gen_alive,
                spec_rate, x, y, xwrap, ywrap, generation
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for node_id in 1..=store.enddata() {
            let node = store.node(node_id);
            let spec_rate = if node.generations_existed == 0 {
                node.spec_rate
            } else {
                1.0 - (1.0 - node.spec_rate).powf(1.0 / node.generations_existed as f64)
            };
            stmt.execute(params![
                node_id as i64,
                node.parent as i64,
                node.speciated,
                node.tip,
                node.exists,
                node.spec_rate,
                node.generations_existed as i64,
                spec_rate,
                node.origin.x,
                node.origin.y,
                node.origin.xwrap,
                node.origin.ywrap,
                node.generation,
            ])?;
        }
        Ok(())
    }

    /// Write one community application: abundances, locations, fragment
    /// counts and the community reference row.
    pub fn write_community(&mut self, output: &CommunityOutput) -> Result<(), StorageError> {
        let reference = output.parameters.reference as i64;
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "insert into SPECIES_ABUNDANCES (community_reference, species_id, count)
                 values (?, ?, ?)",
            )?;
            for (&species_id, &count) in &output.abundances {
                stmt.execute(params![reference, species_id as i64, count as i64])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "insert into SPECIES_LOCATIONS (community_reference, species_id, x, y)
                 values (?, ?, ?, ?)",
            )?;
            for row in &output.locations {
                stmt.execute(params![reference, row.species_id as i64, row.x, row.y])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "insert into FRAGMENT_ABUNDANCES
                 (community_reference, fragment, species_id, count)
                 values (?, ?, ?, ?)",
            )?;
            for ((fragment, species_id), &count) in &output.fragment_abundances {
                stmt.execute(params![
                    reference,
                    fragment,
                    *species_id as i64,
                    count as i64
                ])?;
            }
        }
        tx.execute(
            "insert into COMMUNITY_PARAMETERS
             (reference, speciation_rate, time, fragments, metacommunity_reference,
              protracted_min, protracted_max)
             values (?, ?, ?, ?, ?, ?, ?)",
            params![
                reference,
                output.parameters.speciation_rate,
                output.parameters.time,
                output.parameters.fragments,
                output.parameters.metacommunity_reference as i64,
                output.parameters.protracted.min_speciation_gen,
                output.parameters.protracted.max_speciation_gen,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a metacommunity used by one or more communities.
    pub fn write_metacommunity_parameters(
        &mut self,
        reference: u64,
        size: u64,
        speciation_rate: f64,
        option: MetacommunityOption,
        external_reference: u64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "insert into METACOMMUNITY_PARAMETERS
             (reference, size, speciation_rate, option, external_reference)
             values (?, ?, ?, ?, ?)",
            params![
                reference as i64,
                size as i64,
                speciation_rate,
                option.as_str(),
                external_reference as i64,
            ],
        )?;
        Ok(())
    }

    /// Row count of a schema table.
    pub fn count_rows(&mut self, table: &str) -> Result<i64, StorageError> {
        let count =
            self.conn
                .query_row(&format!("select count(*) from {table}"), [], |row| {
                    row.get(0)
                })?;
        Ok(count)
    }

    /// Abundances of one community, keyed by species id.
    pub fn species_abundances(
        &mut self,
        community_reference: u64,
    ) -> Result<BTreeMap<u64, u64>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select species_id, count from SPECIES_ABUNDANCES
             where community_reference = ? order by species_id",
        )?;
        let mut rows = stmt.query(params![community_reference as i64])?;
        let mut abundances = BTreeMap::new();
        while let Some(row) = rows.next()? {
            abundances.insert(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64);
        }
        Ok(abundances)
    }

    /// The full species list as (node_id, parent, speciated, tip) rows,
    /// for comparisons between runs.
    pub fn species_list_digest(
        &mut self,
    ) -> Result<Vec<(i64, i64, bool, bool, f64)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select node_id, parent, speciated, tip, randnum
             from SPECIES_LIST order by node_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut digest = Vec::new();
        while let Some(row) = rows.next()? {
            digest.push((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ));
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initialises_all_tables() {
        let mut storage = Storage::open_in_memory().unwrap();
        for table in [
            "SIMULATION_PARAMETERS",
            "SPECIES_LIST",
            "SPECIES_ABUNDANCES",
            "SPECIES_LOCATIONS",
            "FRAGMENT_ABUNDANCES",
            "COMMUNITY_PARAMETERS",
            "METACOMMUNITY_PARAMETERS",
        ] {
            assert_eq!(storage.count_rows(table).unwrap(), 0, "{table}");
        }
    }

    #[test]
    fn simulation_parameters_round_trip() {
        let mut storage = Storage::open_in_memory().unwrap();
        let mut parameters = SimParameters {
            seed: 9,
            task: 4,
            fine_map_x_size: 8,
            fine_map_y_size: 8,
            ..SimParameters::default()
        };
        parameters.validate().unwrap();
        storage
            .write_simulation_parameters(&parameters, true)
            .unwrap();
        assert_eq!(storage.count_rows("SIMULATION_PARAMETERS").unwrap(), 1);
        let (seed, complete): (i64, bool) = storage
            .conn
            .query_row(
                "select seed, sim_complete from SIMULATION_PARAMETERS",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(seed, 9);
        assert!(complete);
    }
}
