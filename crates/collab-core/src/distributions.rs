//! Distributions and progress
//!
//! Distributions are named histograms. Merging is a pointwise sum, so
//! partial results from uncoordinated senders can be combined in any order.

use std::collections::BTreeMap;

/// Bucket → count
pub type Histogram = BTreeMap<i64, u64>;

/// Named histograms
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Distributions {
    histograms: BTreeMap<String, Histogram>,
}

impl Distributions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `dist` pointwise into the histogram called `name`
    pub fn combine(&mut self, name: &str, dist: &Histogram) {
        let hist = self.histograms.entry(name.to_string()).or_default();
        for (point, count) in dist {
            let slot = hist.entry(*point).or_insert(0);
            *slot = slot.saturating_add(*count);
        }
    }

    /// Add a single observation
    pub fn add(&mut self, name: &str, point: i64, count: u64) {
        let slot = self
            .histograms
            .entry(name.to_string())
            .or_default()
            .entry(point)
            .or_insert(0);
        *slot = slot.saturating_add(count);
    }

    /// Merge every histogram of `other` into this one
    pub fn merge(&mut self, other: &Distributions) {
        for (name, dist) in &other.histograms {
            self.combine(name, dist);
        }
    }

    pub fn merged(mut self, other: &Distributions) -> Self {
        self.merge(other);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Histogram)> {
        self.histograms.iter()
    }

    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    /// Total number of observations in one histogram
    pub fn total(&self, name: &str) -> u64 {
        self.histograms
            .get(name)
            .map(|h| h.values().sum())
            .unwrap_or(0)
    }
}

impl FromIterator<(String, Histogram)> for Distributions {
    fn from_iter<T: IntoIterator<Item = (String, Histogram)>>(iter: T) -> Self {
        let mut d = Distributions::new();
        for (name, hist) in iter {
            d.combine(&name, &hist);
        }
        d
    }
}

/// Number of trials completed in one reporting interval
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub runs: u64,
}

impl Progress {
    pub fn new(runs: u64) -> Self {
        Progress { runs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hist(points: &[(i64, u64)]) -> Histogram {
        points.iter().copied().collect()
    }

    #[test]
    fn test_combine_sums_pointwise() {
        let mut d = Distributions::new();
        d.combine("defaults", &hist(&[(0, 5), (1, 2)]));
        d.combine("defaults", &hist(&[(1, 3), (4, 1)]));
        assert_eq!(d.get("defaults").unwrap(), &hist(&[(0, 5), (1, 5), (4, 1)]));
        assert_eq!(d.total("defaults"), 11);
        assert_eq!(d.total("missing"), 0);
    }

    #[test]
    fn test_names_kept_apart() {
        let mut d = Distributions::new();
        d.add("a", 1, 1);
        d.add("b", 1, 2);
        assert_eq!(d.len(), 2);
        assert_eq!(d.total("a"), 1);
        assert_eq!(d.total("b"), 2);
    }

    fn arb_distributions() -> impl Strategy<Value = Distributions> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["defaults", "losses", "tail"]),
                prop::collection::btree_map(-5i64..20, 0u64..1000, 0..8),
            ),
            0..4,
        )
        .prop_map(|v| v.into_iter().map(|(n, h)| (n.to_string(), h)).collect())
    }

    proptest! {
        #[test]
        fn prop_merge_commutative(a in arb_distributions(), b in arb_distributions()) {
            prop_assert_eq!(a.clone().merged(&b), b.clone().merged(&a));
        }

        #[test]
        fn prop_merge_associative(
            a in arb_distributions(),
            b in arb_distributions(),
            c in arb_distributions(),
        ) {
            let left = a.clone().merged(&b).merged(&c);
            let right = a.clone().merged(&b.clone().merged(&c));
            let swapped = b.clone().merged(&a).merged(&c);
            prop_assert_eq!(&left, &right);
            prop_assert_eq!(&left, &swapped);
        }

        #[test]
        fn prop_merge_preserves_totals(a in arb_distributions(), b in arb_distributions()) {
            let m = a.clone().merged(&b);
            for name in ["defaults", "losses", "tail"] {
                prop_assert_eq!(m.total(name), a.total(name) + b.total(name));
            }
        }
    }
}
