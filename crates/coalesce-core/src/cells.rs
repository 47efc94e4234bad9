//! Per-cell lineage bookkeeping.
//!
//! Each fine-map cell owns a dense short list of on-grid lineage indices
//! (holes are sentinel zeros, reclaimed on the next insertion) plus an
//! auxiliary list of off-grid lineages addressed through the sample-grid
//! tile wrap. A wrapped lineage's `nwrap` is its 1-based position in that
//! list, so walking the list from the cell reaches it in exactly `nwrap`
//! hops and the list length is the cell's wrapped count.

use crate::error::{Result, SimError};
use crate::rng::RandomSource;
use serde::{Deserialize, Serialize};

/// Lineage occupancy of one fine-map cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellList {
    /// Carrying capacity from the landscape at the last refresh.
    max_size: u32,
    /// On-grid lineage indices; 0 marks a reclaimable hole.
    slots: Vec<usize>,
    /// Number of non-zero entries in `slots`.
    occupied: usize,
    /// Off-grid lineage indices in wrap order.
    wrapped: Vec<usize>,
}

impl CellList {
    /// Reset to an empty cell with the given capacity, keeping the wrapped
    /// list (wrapped lineages belong to other tiles of this cell).
    pub fn initialise(&mut self, max_size: u32) {
        self.max_size = max_size;
        self.slots.clear();
        self.occupied = 0;
    }

    #[must_use]
    pub const fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Number of on-grid lineages in this cell.
    #[must_use]
    pub const fn occupied(&self) -> usize {
        self.occupied
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn lineage_at(&self, list_position: usize) -> usize {
        self.slots.get(list_position).copied().unwrap_or(0)
    }

    /// Capacity grew across a map epoch; the short list may now extend.
    pub fn change_percent_cover(&mut self, max_size: u32) {
        self.max_size = max_size;
    }

    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size;
    }

    /// Insert an on-grid lineage, reclaiming the first hole or appending.
    /// The short list never outgrows `max_size`.
    pub fn add_lineage(&mut self, lineage_index: usize) -> Result<usize> {
        for (position, slot) in self.slots.iter_mut().enumerate() {
            if *slot == 0 {
                *slot = lineage_index;
                self.occupied += 1;
                return Ok(position);
            }
        }
        if self.slots.len() >= self.max_size as usize {
            return Err(SimError::invariant(format!(
                "cell list full: {} slots at capacity {}",
                self.slots.len(),
                self.max_size
            )));
        }
        self.slots.push(lineage_index);
        self.occupied += 1;
        Ok(self.slots.len() - 1)
    }

    /// Null the slot at `list_position`, leaving a hole.
    pub fn remove_on_grid(&mut self, list_position: usize) -> Result<()> {
        match self.slots.get_mut(list_position) {
            Some(slot) if *slot != 0 => {
                *slot = 0;
                self.occupied -= 1;
                Ok(())
            }
            _ => Err(SimError::invariant(format!(
                "removing empty cell slot {list_position}"
            ))),
        }
    }

    /// Redirect the slot at `list_position` to another lineage index
    /// (used when a lineage is swapped with the end of the active table).
    pub fn set_slot(&mut self, list_position: usize, lineage_index: usize) -> Result<()> {
        match self.slots.get_mut(list_position) {
            Some(slot) if *slot != 0 => {
                *slot = lineage_index;
                Ok(())
            }
            _ => Err(SimError::invariant(format!(
                "redirecting empty cell slot {list_position}"
            ))),
        }
    }

    /// Uniform draw over the cell's capacity: an occupied slot returns the
    /// lineage there, a hole or out-of-list draw returns 0 (no
    /// coalescence). Capacity 0 never selects anyone.
    pub fn random_occupant(&self, rng: &mut RandomSource) -> usize {
        if self.max_size == 0 {
            return 0;
        }
        let draw = rng.uint_in(u64::from(self.max_size) - 1) as usize;
        self.slots.get(draw).copied().unwrap_or(0)
    }

    // Wrapped-list handling. Positions handed out are 1-based.

    #[must_use]
    pub fn wrapped_count(&self) -> usize {
        self.wrapped.len()
    }

    #[must_use]
    pub fn wrapped(&self) -> &[usize] {
        &self.wrapped
    }

    /// Append an off-grid lineage, returning its 1-based wrap position.
    pub fn add_wrapped(&mut self, lineage_index: usize) -> usize {
        self.wrapped.push(lineage_index);
        self.wrapped.len()
    }

    /// Splice out the wrapped lineage at 1-based position `nwrap`,
    /// returning the indices whose `nwrap` must drop by one (every
    /// surviving successor).
    pub fn remove_wrapped(&mut self, nwrap: usize) -> Result<Vec<usize>> {
        if nwrap == 0 || nwrap > self.wrapped.len() {
            return Err(SimError::invariant(format!(
                "wrapped removal at position {nwrap} of {}",
                self.wrapped.len()
            )));
        }
        self.wrapped.remove(nwrap - 1);
        Ok(self.wrapped[nwrap - 1..].to_vec())
    }

    /// Redirect the wrapped entry at 1-based position `nwrap`.
    pub fn set_wrapped(&mut self, nwrap: usize, lineage_index: usize) -> Result<()> {
        match self.wrapped.get_mut(nwrap - 1) {
            Some(entry) => {
                *entry = lineage_index;
                Ok(())
            }
            None => Err(SimError::invariant(format!(
                "redirecting wrapped position {nwrap} of {}",
                self.wrapped.len()
            ))),
        }
    }

    /// Re-place a lineage at an exact slot when restoring a paused run;
    /// the slot layout must match the dump byte-for-byte.
    pub fn restore_slot(&mut self, list_position: usize, lineage_index: usize) -> Result<()> {
        if self.slots.len() <= list_position {
            self.slots.resize(list_position + 1, 0);
        }
        if self.slots[list_position] != 0 {
            return Err(SimError::invariant(format!(
                "restoring into occupied cell slot {list_position}"
            )));
        }
        self.slots[list_position] = lineage_index;
        self.occupied += 1;
        Ok(())
    }

    /// Re-place a wrapped lineage at its exact 1-based position.
    pub fn restore_wrapped(&mut self, nwrap: usize, lineage_index: usize) -> Result<()> {
        if nwrap == 0 {
            return Err(SimError::invariant(
                "restoring wrapped lineage at position 0".to_string(),
            ));
        }
        if self.wrapped.len() < nwrap {
            self.wrapped.resize(nwrap, 0);
        }
        if self.wrapped[nwrap - 1] != 0 {
            return Err(SimError::invariant(format!(
                "restoring into occupied wrapped position {nwrap}"
            )));
        }
        self.wrapped[nwrap - 1] = lineage_index;
        Ok(())
    }

    /// After a restore, no wrapped position may remain unfilled.
    pub fn verify_restored(&self) -> Result<()> {
        if self.wrapped.contains(&0) {
            return Err(SimError::invariant(
                "wrapped list has unfilled positions after restore".to_string(),
            ));
        }
        Ok(())
    }

    /// All lineages in this cell, on-grid then wrapped.
    pub fn all_lineages(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .copied()
            .filter(|&idx| idx != 0)
            .chain(self.wrapped.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_are_reclaimed_before_appending() {
        let mut cell = CellList::default();
        cell.initialise(4);
        assert_eq!(cell.add_lineage(10).unwrap(), 0);
        assert_eq!(cell.add_lineage(11).unwrap(), 1);
        assert_eq!(cell.add_lineage(12).unwrap(), 2);
        cell.remove_on_grid(1).unwrap();
        assert_eq!(cell.occupied(), 2);
        assert_eq!(cell.add_lineage(13).unwrap(), 1);
        assert_eq!(cell.lineage_at(1), 13);
    }

    #[test]
    fn list_never_exceeds_capacity() {
        let mut cell = CellList::default();
        cell.initialise(1);
        cell.add_lineage(1).unwrap();
        assert!(cell.add_lineage(2).is_err());
        cell.change_percent_cover(2);
        assert_eq!(cell.add_lineage(2).unwrap(), 1);
    }

    #[test]
    fn random_occupant_respects_holes() {
        let mut cell = CellList::default();
        cell.initialise(2);
        cell.add_lineage(42).unwrap();
        let mut rng = RandomSource::with_seed(1);
        let mut hits = 0;
        let mut misses = 0;
        for _ in 0..1000 {
            match cell.random_occupant(&mut rng) {
                0 => misses += 1,
                42 => hits += 1,
                other => panic!("unexpected occupant {other}"),
            }
        }
        // Capacity 2 with one occupant: roughly half the draws miss.
        assert!(hits > 300 && misses > 300, "hits={hits} misses={misses}");
    }

    #[test]
    fn zero_capacity_forbids_selection() {
        let mut cell = CellList::default();
        cell.initialise(0);
        let mut rng = RandomSource::with_seed(2);
        assert_eq!(cell.random_occupant(&mut rng), 0);
    }

    #[test]
    fn wrapped_removal_reports_successors() {
        let mut cell = CellList::default();
        cell.initialise(1);
        assert_eq!(cell.add_wrapped(5), 1);
        assert_eq!(cell.add_wrapped(6), 2);
        assert_eq!(cell.add_wrapped(7), 3);
        let shifted = cell.remove_wrapped(2).unwrap();
        assert_eq!(shifted, vec![7]);
        assert_eq!(cell.wrapped(), &[5, 7]);
        assert!(cell.remove_wrapped(3).is_err());
    }
}
