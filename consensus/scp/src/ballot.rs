// Copyright (c) 2024-2025 The Kestrel Foundation

//! The ballot carries the value set being pushed through the federated
//! voting phases.

use crate::core_types::Value;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// A ballot is a (counter, values) pair.
///
/// Ballots are totally ordered with the counter more significant than
/// the values; the counter rises on every timed-out round.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Ballot<V: Value> {
    /// Round counter.
    pub counter: u32,

    /// The value set, strictly sorted.
    pub values: Vec<V>,
}

impl<V: Value> Ballot<V> {
    pub fn new(counter: u32, values: &[V]) -> Self {
        Self {
            counter,
            values: values.to_vec(),
        }
    }

    /// The zero ballot carries nothing and precedes every real ballot.
    pub fn is_zero(&self) -> bool {
        self.counter == 0 && self.values.is_empty()
    }

    /// All nodes must see the values in one canonical order: strictly
    /// ascending, no duplicates.
    pub fn is_values_sorted(&self) -> bool {
        self.values.windows(2).all(|w| w[0] < w[1])
    }

    /// True when `other` carries the same values at any counter.
    pub fn compatible(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl<V: Value> Ord for Ballot<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.values.cmp(&other.values))
    }
}

impl<V: Value> PartialOrd for Ballot<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V: Value> fmt::Display for Ballot<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}, {} values>", self.counter, self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_ordering() {
        let high: Ballot<u32> = Ballot::new(13, &[]);
        let low: Ballot<u32> = Ballot::new(4, &[100, 200, 300]);
        assert!(high > low);

        // Same counter: lexicographic on values.
        let a: Ballot<u32> = Ballot::new(13, &[1000, 2001]);
        let b: Ballot<u32> = Ballot::new(13, &[2000]);
        assert!(a < b);
    }

    #[test]
    fn zero_ballot() {
        assert!(Ballot::<u32>::new(0, &[]).is_zero());
        assert!(!Ballot::<u32>::new(1, &[]).is_zero());
        assert!(!Ballot::<u32>::new(0, &[42]).is_zero());
    }

    #[test]
    fn sorted_values() {
        assert!(Ballot::<u32>::new(1, &[1, 2, 3]).is_values_sorted());
        assert!(!Ballot::<u32>::new(1, &[3, 1, 2]).is_values_sorted());
        assert!(!Ballot::<u32>::new(1, &[1, 2, 2]).is_values_sorted());
    }

    #[test]
    fn compatibility_ignores_counter() {
        let a: Ballot<u32> = Ballot::new(1, &[7, 9]);
        let b: Ballot<u32> = Ballot::new(5, &[7, 9]);
        let c: Ballot<u32> = Ballot::new(1, &[7]);
        assert!(a.compatible(&b));
        assert!(!a.compatible(&c));
    }
}
