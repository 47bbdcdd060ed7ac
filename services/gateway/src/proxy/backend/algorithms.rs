//! Target selection algorithms.
//!
//! Each algorithm works on parallel slices (member index, weight) and an
//! eligibility predicate so health filtering never allocates.

use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};

/// Virtual nodes per unit of weight on the hash ring.
const VNODES_PER_WEIGHT: u32 = 16;

/// Weight is capped when expanding the ring so one heavy target cannot blow it up.
const MAX_RING_WEIGHT: u32 = 64;

/// Smooth weighted round-robin.
///
/// Every pick adds each eligible member's weight to its running score, takes
/// the highest score and subtracts the total eligible weight from the winner.
/// Over `sum(weights)` picks every member is chosen exactly `weight` times and
/// picks are interleaved rather than bursty.
#[derive(Debug, Default)]
pub(crate) struct SmoothWeighted {
    current: Mutex<Vec<i64>>,
}

impl SmoothWeighted {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            current: Mutex::new(vec![0; len]),
        }
    }

    pub(crate) fn pick(&self, weights: &[u32], eligible: impl Fn(usize) -> bool) -> Option<usize> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.len() != weights.len() {
            current.resize(weights.len(), 0);
        }

        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for (i, &weight) in weights.iter().enumerate() {
            if weight == 0 || !eligible(i) {
                continue;
            }
            current[i] += i64::from(weight);
            total += i64::from(weight);
            if best.is_none_or(|b| current[i] > current[b]) {
                best = Some(i);
            }
        }

        let best = best?;
        current[best] -= total;
        Some(best)
    }
}

/// Pick the member with the fewest active leases relative to its weight.
///
/// Ties go to the earliest declared member.
pub(crate) fn least_connections(
    weights: &[u32],
    active: impl Fn(usize) -> usize,
    eligible: impl Fn(usize) -> bool,
) -> Option<usize> {
    let mut best: Option<(usize, u64, u64)> = None;
    for (i, &weight) in weights.iter().enumerate() {
        if weight == 0 || !eligible(i) {
            continue;
        }
        let load = active(i) as u64;
        let weight = u64::from(weight);
        let better = match best {
            None => true,
            // load_i / weight_i < load_b / weight_b without division
            Some((_, best_load, best_weight)) => load * best_weight < best_load * weight,
        };
        if better {
            best = Some((i, load, weight));
        }
    }
    best.map(|(i, _, _)| i)
}

/// Consistent hash ring with weighted virtual nodes.
#[derive(Debug, Default)]
pub(crate) struct HashRing {
    points: Vec<(u64, usize)>,
}

impl HashRing {
    pub(crate) fn new<'a>(members: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let mut points = Vec::new();
        for (index, (key, weight)) in members.into_iter().enumerate() {
            let vnodes = weight.min(MAX_RING_WEIGHT) * VNODES_PER_WEIGHT;
            for vnode in 0..vnodes {
                points.push((hash64(format!("{key}#{vnode}").as_bytes()), index));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    /// Walk clockwise from `hash` to the first eligible member.
    pub(crate) fn pick(&self, hash: u64, eligible: impl Fn(usize) -> bool) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let start = self.points.partition_point(|(point, _)| *point < hash);
        let len = self.points.len();
        (0..len)
            .map(|offset| self.points[(start + offset) % len].1)
            .find(|&index| eligible(index))
    }
}

/// Stable 64-bit hash used for ring placement and hash keys.
pub fn hash64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}
