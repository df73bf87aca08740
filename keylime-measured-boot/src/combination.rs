// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Keylime Authors

//! Ranking and unranking of k-combinations.
//!
//! A [`Combination`] is a strictly increasing list of `k` indices in
//! `[0, max_value]`. Combinations of the same length are ordered
//! lexicographically, and each one is identified by its 0-based position in
//! that order (its ID). Converting between IDs and combinations takes
//! `O(k)` binomial lookups (rank) or `O(k * log(max_value))` (unrank), which
//! lets the search split the ID space between workers without enumerating
//! it.

use crate::error::{Error, Result};
use serde_derive::Serialize;
use std::fmt;

/// Identifier of a combination among all combinations of the same length.
pub type CombinationId = u64;

// Binomial coefficients of n < 128 fit in u128 and are kept in a table.
const TABLE_ROWS: usize = 128;

/// Binomial coefficient table.
///
/// Coefficients for small `n` are precomputed; larger ones are computed
/// exactly on demand. The table is built once and shared by reference
/// between all the workers of a search.
#[derive(Debug)]
pub struct Binomials {
    rows: Vec<Vec<u128>>,
}

impl Binomials {
    pub fn new() -> Self {
        let mut rows: Vec<Vec<u128>> = Vec::with_capacity(TABLE_ROWS);
        for n in 0..TABLE_ROWS {
            let mut row = vec![1u128; n + 1];
            for k in 1..n {
                row[k] = rows[n - 1][k - 1] + rows[n - 1][k];
            }
            rows.push(row);
        }
        Self { rows }
    }

    /// Returns `C(n, k)`, or `None` if it does not fit in 128 bits.
    pub fn get(&self, n: u64, k: u64) -> Option<u128> {
        if k > n {
            return Some(0);
        }
        if (n as usize) < TABLE_ROWS {
            return Some(self.rows[n as usize][k as usize]);
        }
        let k = k.min(n - k);
        let mut result: u128 = 1;
        for i in 1..=k as u128 {
            // result * (n - k + i) / i is C(n - k + i, i), so it is exact.
            // Dividing by the common factor first keeps the product small.
            let factor = n as u128 - k as u128 + i;
            let g = gcd(result, i);
            let divisor = i / g;
            result = (result / g).checked_mul(factor / divisor)?;
        }
        Some(result)
    }

    /// Returns `C(n, k)` as a combination count.
    fn count(&self, n: u64, k: u64) -> Result<u64> {
        self.get(n, k)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| {
                Error::TooManyCombinations(format!(
                    "C({n}, {k}) does not fit in 64 bits"
                ))
            })
    }
}

impl Default for Binomials {
    fn default() -> Self {
        Self::new()
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// A choice of distinct, strictly increasing indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Combination {
    indices: Vec<usize>,
}

impl Combination {
    /// Returns the first combination of `k` indices, `[0, 1, ..., k-1]`, or
    /// `None` if `k` indices do not fit in `[0, max_value]`.
    pub fn first(k: usize, max_value: usize) -> Option<Self> {
        if k > max_value.saturating_add(1) {
            return None;
        }
        Some(Self {
            indices: (0..k).collect(),
        })
    }

    /// The empty combination (no index selected).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a combination from explicit indices.
    pub fn from_indices(indices: Vec<usize>, max_value: usize) -> Result<Self> {
        let combination = Self { indices };
        combination.validate(max_value)?;
        Ok(combination)
    }

    /// Returns the number of combinations of `k` indices in `[0, max_value]`.
    pub fn count(
        k: usize,
        max_value: usize,
        binomials: &Binomials,
    ) -> Result<u64> {
        binomials.count(max_value as u64 + 1, k as u64)
    }

    /// Returns the combination with the given ID.
    pub fn from_id(
        k: usize,
        max_value: usize,
        id: CombinationId,
        binomials: &Binomials,
    ) -> Result<Self> {
        let mut combination = Self {
            indices: vec![0; k],
        };
        combination.set_id(max_value, id, binomials)?;
        Ok(combination)
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    fn validate(&self, max_value: usize) -> Result<()> {
        let mut previous: Option<usize> = None;
        for &value in &self.indices {
            if value > max_value || previous.is_some_and(|p| p >= value) {
                return Err(Error::InvalidInput(format!(
                    "{self} is not a strictly increasing combination bounded by {max_value}"
                )));
            }
            previous = Some(value);
        }
        Ok(())
    }

    /// Advances to the lexicographically next combination of the same
    /// length. Returns `false` (leaving the combination untouched) when this
    /// is the last one.
    pub fn next(&mut self, max_value: usize) -> bool {
        let k = self.indices.len();
        // Position i may hold at most max_value - (k - 1 - i).
        let Some(i) = (0..k)
            .rev()
            .find(|&i| self.indices[i] + (k - 1 - i) < max_value)
        else {
            return false;
        };
        self.indices[i] += 1;
        for j in i + 1..k {
            self.indices[j] = self.indices[j - 1] + 1;
        }
        true
    }

    /// Returns the ID of this combination.
    pub fn id(
        &self,
        max_value: usize,
        binomials: &Binomials,
    ) -> Result<CombinationId> {
        self.validate(max_value)?;
        let n = max_value as u64 + 1;
        let k = self.indices.len();
        let mut id: u64 = 0;
        let mut start: u64 = 0;
        for (i, &value) in self.indices.iter().enumerate() {
            let remaining = (k - i) as u64;
            // Combinations skipped by placing `value` rather than `start` at
            // position i.
            let upper = binomials.count(n - start, remaining)?;
            let lower = binomials.count(n - value as u64, remaining)?;
            id += upper - lower;
            start = value as u64 + 1;
        }
        Ok(id)
    }

    /// Moves this combination to the one with the given ID, keeping its
    /// length.
    pub fn set_id(
        &mut self,
        max_value: usize,
        id: CombinationId,
        binomials: &Binomials,
    ) -> Result<()> {
        let k = self.indices.len();
        let n = max_value as u64 + 1;
        let total = binomials.count(n, k as u64)?;
        if id >= total {
            return Err(Error::InvalidInput(format!(
                "combination ID {id} is out of range, there are {total} combinations of {k} out of {n}"
            )));
        }

        let mut remaining_id = id;
        let mut start: u64 = 0;
        for i in 0..k {
            let remaining = (k - i) as u64;
            let upper = binomials.count(n - start, remaining)?;

            // The number of skipped combinations grows with the value, so
            // bisect for the largest value not skipping past remaining_id.
            let mut low = start;
            let mut high = n - remaining;
            while low < high {
                let middle = low + (high - low).div_ceil(2);
                let skipped = upper - binomials.count(n - middle, remaining)?;
                if skipped <= remaining_id {
                    low = middle;
                } else {
                    high = middle - 1;
                }
            }

            remaining_id -= upper - binomials.count(n - low, remaining)?;
            self.indices[i] = low as usize;
            start = low + 1;
        }
        Ok(())
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomials_small() {
        let b = Binomials::new();
        assert_eq!(b.get(0, 0), Some(1));
        assert_eq!(b.get(5, 2), Some(10));
        assert_eq!(b.get(64, 32), Some(1_832_624_140_942_590_534));
        assert_eq!(b.get(3, 4), Some(0));
    }

    #[test]
    fn test_binomials_large_matches_recurrence() {
        let b = Binomials::new();
        for n in 128u64..140 {
            for k in [0u64, 1, 2, 5, 17, 40] {
                let expected =
                    b.get(n - 1, k.saturating_sub(1)).unwrap() //#[allow_ci]
                        * u128::from(k > 0)
                        + b.get(n - 1, k).unwrap(); //#[allow_ci]
                assert_eq!(b.get(n, k), Some(expected), "C({n}, {k})");
            }
        }
        assert_eq!(b.get(1000, 1), Some(1000));
        assert_eq!(b.get(1000, 999), Some(1000));
    }

    #[test]
    fn test_binomials_overflow() {
        let b = Binomials::new();
        assert_eq!(b.get(4096, 2048), None);
        let err = Combination::count(100, 4095, &b).unwrap_err(); //#[allow_ci]
        assert!(matches!(err, Error::TooManyCombinations(_)));
    }

    #[test]
    fn test_count_edge_cases() {
        let b = Binomials::new();
        assert_eq!(Combination::count(0, 5, &b).unwrap(), 1); //#[allow_ci]
        assert_eq!(Combination::count(7, 5, &b).unwrap(), 0); //#[allow_ci]
        assert_eq!(Combination::count(2, 3, &b).unwrap(), 6); //#[allow_ci]
        assert!(Combination::first(7, 5).is_none());
        assert_eq!(Combination::first(0, 5), Some(Combination::empty()));
    }

    #[test]
    fn test_next_visits_all_in_rank_order() {
        let b = Binomials::new();
        for (k, max_value) in [(1, 4), (2, 3), (3, 6), (4, 7), (5, 5)] {
            let total = Combination::count(k, max_value, &b).unwrap(); //#[allow_ci]
            let mut combination = Combination::first(k, max_value).unwrap(); //#[allow_ci]
            let mut visited = 1u64;
            assert_eq!(combination.id(max_value, &b).unwrap(), 0); //#[allow_ci]
            while combination.next(max_value) {
                assert_eq!(
                    combination.id(max_value, &b).unwrap(), //#[allow_ci]
                    visited,
                    "{combination}"
                );
                visited += 1;
            }
            assert_eq!(visited, total, "k={k} max_value={max_value}");
            // The last combination stays where it is.
            let last = combination.clone();
            assert!(!combination.next(max_value));
            assert_eq!(last, combination);
        }
    }

    #[test]
    fn test_next_empty_combination() {
        let mut combination = Combination::empty();
        assert!(!combination.next(10));
    }

    #[test]
    fn test_rank_known_values() {
        let b = Binomials::new();
        let c = Combination::from_indices(vec![1, 3], 3).unwrap(); //#[allow_ci]
        assert_eq!(c.id(3, &b).unwrap(), 4); //#[allow_ci]
        let c = Combination::from_indices(vec![2, 3], 3).unwrap(); //#[allow_ci]
        assert_eq!(c.id(3, &b).unwrap(), 5); //#[allow_ci]
    }

    #[test]
    fn test_unrank_inverts_rank() {
        let b = Binomials::new();
        for (k, max_value) in [(1, 63), (2, 63), (3, 200), (4, 511)] {
            let total = Combination::count(k, max_value, &b).unwrap(); //#[allow_ci]
            let step = (total / 97).max(1);
            let mut id = 0;
            while id < total {
                let c = Combination::from_id(k, max_value, id, &b).unwrap(); //#[allow_ci]
                assert_eq!(c.len(), k);
                assert_eq!(c.id(max_value, &b).unwrap(), id); //#[allow_ci]
                id += step;
            }
            let last =
                Combination::from_id(k, max_value, total - 1, &b).unwrap(); //#[allow_ci]
            assert_eq!(
                last.indices().to_vec(),
                ((max_value + 1 - k)..=max_value).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_set_id_then_next() {
        let b = Binomials::new();
        let mut c = Combination::first(3, 9).unwrap(); //#[allow_ci]
        c.set_id(9, 41, &b).unwrap(); //#[allow_ci]
        assert!(c.next(9));
        assert_eq!(c.id(9, &b).unwrap(), 42); //#[allow_ci]
    }

    #[test]
    fn test_set_id_out_of_range() {
        let b = Binomials::new();
        let mut c = Combination::first(2, 3).unwrap(); //#[allow_ci]
        assert!(c.set_id(3, 6, &b).is_err());
    }

    #[test]
    fn test_invalid_combination() {
        assert!(Combination::from_indices(vec![3, 1], 5).is_err());
        assert!(Combination::from_indices(vec![1, 1], 5).is_err());
        assert!(Combination::from_indices(vec![1, 6], 5).is_err());
    }
}
