//! UID/GID mappings and identifier sets.
//!
//! A layer may carry an identifier mapping describing how the owner IDs seen
//! inside a container translate to owner IDs on the host. Each [`IdMap`] entry
//! maps the contiguous container range `[container_id, container_id + size)`
//! onto `[host_id, host_id + size)`.
//!
//! [`IdSet`] is the range-compressed set type used to report owner IDs.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize, Serializer};

/// One contiguous range of an identifier mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdMap {
    /// First ID of the range as seen inside the container.
    pub container_id: u32,
    /// First ID of the range as seen on the host.
    pub host_id: u32,
    /// Number of IDs in the range.
    pub size: u32,
}

impl IdMap {
    /// Create a mapping entry.
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// The container-side range covered by this entry.
    ///
    /// Computed in `u64` so that a range reaching `u32::MAX` does not overflow.
    pub fn container_range(&self) -> Range<u64> {
        let start = u64::from(self.container_id);
        start..start + u64::from(self.size)
    }
}

/// A set of `u32` identifiers stored as sorted, disjoint, non-adjacent ranges.
///
/// Mapping ranges routinely span 65536 IDs or more, so the set never expands
/// them; iteration yields individual IDs lazily in ascending order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ranges: Vec<Range<u64>>,
}

impl IdSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the set of container IDs declared by a mapping.
    pub fn from_container_ranges(maps: &[IdMap]) -> Self {
        let mut set = Self::new();
        for m in maps {
            set.insert_range(m.container_range());
        }
        set
    }

    /// Insert a single ID.
    pub fn insert(&mut self, id: u32) {
        let id = u64::from(id);
        self.insert_range(id..id + 1);
    }

    /// Insert every ID in `range`.
    pub fn insert_range(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in self.ranges.drain(..) {
            if r.end < merged.start {
                out.push(r);
            } else if merged.end < r.start {
                if !placed {
                    out.push(merged.clone());
                    placed = true;
                }
                out.push(r);
            } else {
                merged = merged.start.min(r.start)..merged.end.max(r.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Insert every ID of another set.
    pub fn union_with(&mut self, other: &IdSet) {
        for r in &other.ranges {
            self.insert_range(r.clone());
        }
    }

    /// Remove every ID in `range`.
    pub fn remove_range(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= range.start || range.end <= r.start {
                out.push(r);
                continue;
            }
            if r.start < range.start {
                out.push(r.start..range.start);
            }
            if range.end < r.end {
                out.push(range.end..r.end);
            }
        }
        self.ranges = out;
    }

    /// Remove every container ID declared by a mapping.
    pub fn remove_container_ranges(&mut self, maps: &[IdMap]) {
        for m in maps {
            self.remove_range(m.container_range());
        }
    }

    /// Whether `id` is in the set.
    pub fn contains(&self, id: u32) -> bool {
        let id = u64::from(id);
        let idx = self.ranges.partition_point(|r| r.end <= id);
        self.ranges.get(idx).is_some_and(|r| r.contains(&id))
    }

    /// Number of IDs in the set.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The underlying ranges, sorted and disjoint.
    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    /// Iterate over the IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        // Ranges only ever come from u32 inputs, so every member fits.
        self.ranges
            .iter()
            .flat_map(|r| r.clone())
            .filter_map(|id| u32::try_from(id).ok())
    }
}

impl fmt::Debug for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ranges.iter()).finish()
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl Serialize for IdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}
