//! Logical and physical coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical coordinate on the sample grid. `(x, y)` are grid-relative;
/// `(xwrap, ywrap)` address tiles of the sample grid outside its nominal
/// bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapLocation {
    pub x: i64,
    pub y: i64,
    pub xwrap: i64,
    pub ywrap: i64,
}

impl MapLocation {
    #[must_use]
    pub const fn new(x: i64, y: i64, xwrap: i64, ywrap: i64) -> Self {
        Self { x, y, xwrap, ywrap }
    }

    /// A lineage is on-grid when it sits inside the nominal sample grid.
    #[must_use]
    pub const fn is_on_grid(&self) -> bool {
        self.xwrap == 0 && self.ywrap == 0
    }

    /// The same physical cell, compared including the wrap tile.
    #[must_use]
    pub fn same_place(&self, other: &MapLocation) -> bool {
        self == other
    }
}

impl fmt::Display for MapLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) wrap ({}, {})",
            self.x, self.y, self.xwrap, self.ywrap
        )
    }
}

/// A physical cell inside the fine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cell {
    pub x: usize,
    pub y: usize,
}

impl Cell {
    #[must_use]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}
