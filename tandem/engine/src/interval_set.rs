// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use tandem_types::Dump;

/// Disjoint set of half-open intervals `[start, end)`.
///
/// The representation is canonical: adjacent and overlapping intervals are
/// merged on insertion, so the map always holds the minimum set of maximal
/// intervals and structural equality is set equality.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IntervalSet<T> {
    // start -> end
    map: BTreeMap<T, T>,
}

impl<T: Ord + Clone> IntervalSet<T> {
    pub fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Adds `[start, end)`, absorbing every interval it touches or overlaps.
    pub fn add_interval(&mut self, start: T, end: T) {
        if start >= end {
            return;
        }

        // The interval to the left absorbs us if it extends to our start or
        // beyond; otherwise we start a new entry.
        let merged_start = match self.map.range(..=start.clone()).next_back() {
            Some((existing_start, existing_end)) if *existing_end >= start => {
                existing_start.clone()
            }
            _ => start,
        };

        // Absorb every interval starting within [merged_start, end], keeping
        // the furthest end seen.
        let mut merged_end = end;
        let absorbed: Vec<T> = self
            .map
            .range(merged_start.clone()..=merged_end.clone())
            .map(|(s, _)| s.clone())
            .collect();
        for s in absorbed {
            let e = self.map.remove(&s).expect("absorbed interval present");
            if e > merged_end {
                merged_end = e;
            }
        }

        self.map.insert(merged_start, merged_end);
    }

    pub fn contains(&self, t: &T) -> bool {
        match self.map.range(..=t.clone()).next_back() {
            Some((_, end)) => t < end,
            None => false,
        }
    }

    /// The interval bounds, as a flat strictly increasing sequence
    /// `start0, end0, start1, end1, ...`.
    pub fn end_points(&self) -> Vec<T> {
        let mut end_points = Vec::with_capacity(self.map.len() * 2);
        for (start, end) in &self.map {
            end_points.push(start.clone());
            end_points.push(end.clone());
        }
        end_points
    }
}

impl<T: Ord + Clone> Default for IntervalSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone + Dump> Dump for IntervalSet<T> {
    fn dump(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.map
                .iter()
                .map(|(start, end)| serde_json::json!([start.dump(), end.dump()]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(set: &IntervalSet<u32>) -> Vec<u32> {
        set.end_points()
    }

    #[test]
    fn empty_interval_is_ignored() {
        let mut set = IntervalSet::new();
        set.add_interval(5, 5);
        set.add_interval(7, 3);
        assert!(set.is_empty());
        assert!(!set.contains(&5));
    }

    #[test]
    fn disjoint_intervals_stay_disjoint() {
        let mut set = IntervalSet::new();
        set.add_interval(10, 20);
        set.add_interval(30, 40);
        assert_eq!(endpoints(&set), vec![10, 20, 30, 40]);

        assert!(!set.contains(&9));
        assert!(set.contains(&10));
        assert!(set.contains(&19));
        assert!(!set.contains(&20));
        assert!(set.contains(&30));
        assert!(!set.contains(&40));
    }

    #[test]
    fn overlapping_intervals_merge() {
        let mut set = IntervalSet::new();
        set.add_interval(10, 20);
        set.add_interval(15, 25);
        assert_eq!(endpoints(&set), vec![10, 25]);

        set.add_interval(5, 12);
        assert_eq!(endpoints(&set), vec![5, 25]);

        // Fully contained: no change.
        set.add_interval(6, 7);
        assert_eq!(endpoints(&set), vec![5, 25]);
    }

    #[test]
    fn touching_intervals_merge() {
        let mut set = IntervalSet::new();
        set.add_interval(10, 20);
        set.add_interval(20, 30);
        assert_eq!(endpoints(&set), vec![10, 30]);
    }

    #[test]
    fn spanning_interval_absorbs_everything_between() {
        let mut set = IntervalSet::new();
        set.add_interval(10, 12);
        set.add_interval(20, 22);
        set.add_interval(30, 32);
        set.add_interval(11, 31);
        assert_eq!(endpoints(&set), vec![10, 32]);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        use itertools::Itertools;

        let intervals: Vec<(u32, u32)> = vec![(1, 4), (3, 6), (8, 10), (10, 12), (0, 2)];
        let expected = {
            let mut set = IntervalSet::new();
            for (s, e) in &intervals {
                set.add_interval(*s, *e);
            }
            set
        };

        for permutation in intervals.iter().permutations(intervals.len()) {
            let mut set = IntervalSet::new();
            for (s, e) in permutation {
                set.add_interval(*s, *e);
            }
            assert_eq!(set, expected);
        }
    }

    #[test]
    fn end_points_are_strictly_increasing() {
        let mut set = IntervalSet::new();
        for (s, e) in [(40u32, 45), (10, 20), (19, 21), (25, 30), (21, 25)] {
            set.add_interval(s, e);
        }
        let points = endpoints(&set);
        assert!(points.windows(2).all(|w| w[0] < w[1]), "{points:?}");
    }
}
