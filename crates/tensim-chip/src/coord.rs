//! Logical worker-core coordinates.
//!
//! Coordinates are logical (0-based within the worker grid), not physical
//! NoC routing coordinates. Ranges are inclusive on both corners, matching
//! how programs are usually described ("cores (0,0) to (3,1)").

use std::collections::BTreeSet;
use std::fmt;

/// One worker core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CoreCoord {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

impl CoreCoord {
    /// Create a coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl From<(u32, u32)> for CoreCoord {
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y }
    }
}

/// Inclusive rectangle of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreRange {
    /// Lower-left corner (inclusive).
    pub start: CoreCoord,
    /// Upper-right corner (inclusive).
    pub end: CoreCoord,
}

impl CoreRange {
    /// Create a range from two corners in any order.
    #[must_use]
    pub fn new(a: CoreCoord, b: CoreCoord) -> Self {
        Self {
            start: CoreCoord::new(a.x.min(b.x), a.y.min(b.y)),
            end: CoreCoord::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Range holding exactly one core.
    #[must_use]
    pub const fn single(core: CoreCoord) -> Self {
        Self { start: core, end: core }
    }

    /// True if `core` lies inside the rectangle.
    #[must_use]
    pub const fn contains(&self, core: CoreCoord) -> bool {
        core.x >= self.start.x && core.x <= self.end.x && core.y >= self.start.y && core.y <= self.end.y
    }

    /// Number of cores covered.
    #[must_use]
    pub const fn num_cores(&self) -> u32 {
        (self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)
    }

    /// Iterate cores row-major (y outer, x inner).
    pub fn iter(&self) -> impl Iterator<Item = CoreCoord> {
        let (start, end) = (self.start, self.end);
        (start.y..=end.y).flat_map(move |y| (start.x..=end.x).map(move |x| CoreCoord::new(x, y)))
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

impl From<CoreCoord> for CoreRange {
    fn from(core: CoreCoord) -> Self {
        Self::single(core)
    }
}

/// Arbitrary set of cores described as a union of ranges.
///
/// Overlapping ranges are allowed; [`CoreRangeSet::cores`] deduplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoreRangeSet {
    ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
    /// Build from a list of ranges.
    #[must_use]
    pub fn new(ranges: Vec<CoreRange>) -> Self {
        Self { ranges }
    }

    /// The ranges as given.
    #[must_use]
    pub fn ranges(&self) -> &[CoreRange] {
        &self.ranges
    }

    /// True if no range was given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True if any range contains `core`.
    #[must_use]
    pub fn contains(&self, core: CoreCoord) -> bool {
        self.ranges.iter().any(|r| r.contains(core))
    }

    /// Distinct cores, sorted by `(x, y)`.
    #[must_use]
    pub fn cores(&self) -> Vec<CoreCoord> {
        let set: BTreeSet<CoreCoord> = self.ranges.iter().flat_map(CoreRange::iter).collect();
        set.into_iter().collect()
    }

    /// Number of distinct cores.
    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.cores().len()
    }
}

impl From<CoreCoord> for CoreRangeSet {
    fn from(core: CoreCoord) -> Self {
        Self::new(vec![CoreRange::single(core)])
    }
}

impl From<CoreRange> for CoreRangeSet {
    fn from(range: CoreRange) -> Self {
        Self::new(vec![range])
    }
}

impl From<Vec<CoreCoord>> for CoreRangeSet {
    fn from(cores: Vec<CoreCoord>) -> Self {
        Self::new(cores.into_iter().map(CoreRange::single).collect())
    }
}

impl From<&[CoreCoord]> for CoreRangeSet {
    fn from(cores: &[CoreCoord]) -> Self {
        Self::new(cores.iter().copied().map(CoreRange::single).collect())
    }
}

impl fmt::Display for CoreRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_normalises_corners() {
        let r = CoreRange::new(CoreCoord::new(3, 1), CoreCoord::new(0, 0));
        assert_eq!(r.start, CoreCoord::new(0, 0));
        assert_eq!(r.end, CoreCoord::new(3, 1));
        assert_eq!(r.num_cores(), 8);
        assert_eq!(r.iter().count(), 8);
    }

    #[test]
    fn range_iterates_row_major() {
        let r = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1));
        let cores: Vec<_> = r.iter().collect();
        assert_eq!(
            cores,
            vec![
                CoreCoord::new(0, 0),
                CoreCoord::new(1, 0),
                CoreCoord::new(0, 1),
                CoreCoord::new(1, 1)
            ]
        );
    }

    #[test]
    fn set_deduplicates_overlap() {
        let set = CoreRangeSet::new(vec![
            CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 0)),
            CoreRange::new(CoreCoord::new(1, 0), CoreCoord::new(2, 0)),
        ]);
        assert_eq!(set.num_cores(), 3);
        assert!(set.contains(CoreCoord::new(2, 0)));
        assert!(!set.contains(CoreCoord::new(0, 1)));
    }
}
