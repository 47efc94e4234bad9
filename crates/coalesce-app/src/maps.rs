//! Plain-text map loading.
//!
//! The engine consumes dense numeric grids; raster decoding is out of
//! scope. This loader reads whitespace- or comma-separated numeric rows,
//! one map row per line, with `#` comment lines ignored.

use coalesce_core::{Grid, LandscapeInputs, SimError, SimParameters, SimulationInputs};
use std::path::Path;

/// Read a numeric grid from a text file.
pub fn load_grid(path: &Path) -> Result<Grid<f64>, SimError> {
    let contents = std::fs::read_to_string(path).map_err(|err| {
        SimError::map(format!("cannot read map file {}: {err}", path.display()))
    })?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row: Result<Vec<f64>, _> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(str::parse::<f64>)
            .collect();
        let row = row.map_err(|err| {
            SimError::map(format!(
                "bad value in {} line {}: {err}",
                path.display(),
                line_number + 1
            ))
        })?;
        if let Some(first) = rows.first() {
            if row.len() != first.len() {
                return Err(SimError::map(format!(
                    "ragged map {}: line {} has {} values, expected {}",
                    path.display(),
                    line_number + 1,
                    row.len(),
                    first.len()
                )));
            }
        }
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(SimError::map(format!(
            "map file {} contains no data rows",
            path.display()
        )));
    }
    let cols = rows[0].len();
    let cells: Vec<f64> = rows.into_iter().flatten().collect();
    Grid::from_vec(cells.len() / cols, cols, cells)
}

fn load_optional(path: Option<&std::path::PathBuf>) -> Result<Option<Grid<f64>>, SimError> {
    path.map(|p| load_grid(p)).transpose()
}

/// Load every configured map into the engine's input bundle.
pub fn load_inputs(params: &SimParameters) -> Result<SimulationInputs, SimError> {
    Ok(SimulationInputs {
        landscape: LandscapeInputs {
            fine: load_optional(params.fine_map_file.as_ref())?,
            coarse: load_optional(params.coarse_map_file.as_ref())?,
            historical_fine: load_optional(params.historical_fine_map_file.as_ref())?,
            historical_coarse: load_optional(params.historical_coarse_map_file.as_ref())?,
        },
        sample_mask: load_optional(params.sample_mask_file.as_ref())?,
        death: load_optional(params.death_file.as_ref())?,
        reproduction: load_optional(params.reproduction_file.as_ref())?,
        dispersal_matrix: load_optional(params.dispersal_file.as_ref())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_whitespace_and_comma_grids() {
        let file = write_temp("# density map\n1 0 2\n0.5, 1, 0\n");
        let grid = load_grid(file.path()).unwrap();
        assert_eq!(grid.rows(), 2);
        assert_eq!(grid.cols(), 3);
        assert_eq!(*grid.get(0, 2), 2.0);
        assert_eq!(*grid.get(1, 0), 0.5);
    }

    #[test]
    fn rejects_ragged_rows() {
        let file = write_temp("1 2 3\n1 2\n");
        assert!(load_grid(file.path()).is_err());
    }

    #[test]
    fn rejects_non_numeric_values() {
        let file = write_temp("1 x 3\n");
        assert!(load_grid(file.path()).is_err());
    }
}
