//! Ordered interval set of ledger sequences.
//!
//! Keeps sorted, disjoint, non-adjacent inclusive ranges. This is the
//! control-file payload for incomplete shards and the source of the
//! range-compressed status string.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet {
    ranges: Vec<(u32, u32)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of values in the set.
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|&(a, b)| u64::from(b) - u64::from(a) + 1)
            .sum()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Smallest and largest values, when nonempty.
    pub fn bounds(&self) -> Option<(u32, u32)> {
        match (self.ranges.first(), self.ranges.last()) {
            (Some(&(first, _)), Some(&(_, last))) => Some((first, last)),
            _ => None,
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        let i = self.ranges.partition_point(|&(_, b)| b < value);
        self.ranges.get(i).is_some_and(|&(a, _)| a <= value)
    }

    pub fn insert(&mut self, value: u32) {
        // First range whose end is at or past value - 1, i.e. the first that
        // could contain, absorb, or sit above the new value.
        let i = self
            .ranges
            .partition_point(|&(_, b)| u64::from(b) + 1 < u64::from(value));
        if i == self.ranges.len() {
            self.ranges.push((value, value));
            return;
        }
        let (a, b) = self.ranges[i];
        if a <= value && value <= b {
            return;
        }
        if u64::from(value) + 1 == u64::from(a) {
            self.ranges[i].0 = value;
            if i > 0 && u64::from(self.ranges[i - 1].1) + 1 == u64::from(value) {
                self.ranges[i - 1].1 = self.ranges[i].1;
                self.ranges.remove(i);
            }
        } else if u64::from(value) == u64::from(b) + 1 {
            self.ranges[i].1 = value;
            if i + 1 < self.ranges.len() && u64::from(self.ranges[i + 1].0) == u64::from(value) + 1
            {
                self.ranges[i].1 = self.ranges[i + 1].1;
                self.ranges.remove(i + 1);
            }
        } else {
            self.ranges.insert(i, (value, value));
        }
    }

    /// Greatest value in `[floor, before)` that is not in the set.
    pub fn prev_missing(&self, before: u32, floor: u32) -> Option<u32> {
        let mut candidate = before.checked_sub(1)?;
        for &(a, b) in self.ranges.iter().rev() {
            if candidate > b {
                break;
            }
            if candidate >= a {
                if a == 0 {
                    return None;
                }
                candidate = a - 1;
            }
        }
        (candidate >= floor).then_some(candidate)
    }

    /// Canonical range-set string: runs as `first-last`, singletons as
    /// `first`, joined by commas. `{0,1,2,3,5,7,8,9}` renders `0-3,5,7-9`.
    pub fn to_compact_string(&self) -> String {
        let mut out = String::new();
        for &(a, b) in &self.ranges {
            if !out.is_empty() {
                out.push(',');
            }
            if a == b {
                out.push_str(&a.to_string());
            } else {
                out.push_str(&format!("{a}-{b}"));
            }
        }
        out
    }
}

impl FromIterator<u32> for RangeSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = RangeSet::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_adjacent_ranges() {
        let mut set = RangeSet::new();
        set.insert(5);
        set.insert(7);
        assert_eq!(set.to_compact_string(), "5,7");
        set.insert(6);
        assert_eq!(set.to_compact_string(), "5-7");
        set.insert(6);
        assert_eq!(set.len(), 3);
        set.insert(4);
        set.insert(8);
        assert_eq!(set.to_compact_string(), "4-8");
    }

    #[test]
    fn contains_and_bounds() {
        let set: RangeSet = [1, 2, 3, 9].into_iter().collect();
        assert!(set.contains(2));
        assert!(set.contains(9));
        assert!(!set.contains(4));
        assert_eq!(set.bounds(), Some((1, 9)));
        assert!(RangeSet::new().bounds().is_none());
    }

    #[test]
    fn prev_missing_skips_stored_runs() {
        let set: RangeSet = [6, 7, 8].into_iter().collect();
        // Acquire newest-to-oldest within [5, 8]: 8..6 stored, so 5 is next.
        assert_eq!(set.prev_missing(9, 5), Some(5));

        let set: RangeSet = [5, 8].into_iter().collect();
        assert_eq!(set.prev_missing(9, 5), Some(7));

        let full: RangeSet = [5, 6, 7, 8].into_iter().collect();
        assert_eq!(full.prev_missing(9, 5), None);

        assert_eq!(RangeSet::new().prev_missing(9, 5), Some(8));
    }

    #[test]
    fn status_compression() {
        let set: RangeSet = [0, 1, 2, 3, 5, 7, 8, 9].into_iter().collect();
        assert_eq!(set.to_compact_string(), "0-3,5,7-9");
    }

    #[test]
    fn json_round_trip() {
        let set: RangeSet = [5, 6, 9, 11, 12].into_iter().collect();
        let bytes = serde_json::to_vec(&set).expect("encode");
        let loaded: RangeSet = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(loaded, set);
    }
}
