//! Weighted random ordering of answer addresses.

use rand::Rng;
use std::net::IpAddr;

/// One balancing candidate: an address with its weight and health verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Address under consideration.
    pub ip: IpAddr,
    /// Relative selection weight.
    pub weight: u32,
    /// Whether the health filter let this address through.
    pub healthy: bool,
}

/// Stateless weighted random balancer.
///
/// Produces an ordered answer list by drawing without replacement with
/// probability proportional to weight, so the first position carries the
/// configured traffic split while later positions remain usable fallbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedBalancer;

impl WeightedBalancer {
    /// Create a balancer.
    pub fn new() -> Self {
        Self
    }

    /// Order the healthy candidates by repeated weighted draws.
    /// Returns an empty list when no candidate is healthy.
    pub fn select(&self, candidates: &[Candidate]) -> Vec<IpAddr> {
        let mut remaining: Vec<&Candidate> = candidates.iter().filter(|c| c.healthy).collect();

        match remaining.len() {
            0 => return Vec::new(),
            1 => return vec![remaining[0].ip],
            _ => {}
        }

        let mut rng = rand::thread_rng();
        let mut result = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let picked = weighted_pick(&mut rng, &remaining);
            result.push(remaining.swap_remove(picked).ip);
        }
        result
    }
}

/// Cumulative-sum draw over positive weights. Zero-weight candidates are only
/// eligible when no positive weight remains, in which case the draw is
/// uniform.
fn weighted_pick<R: Rng>(rng: &mut R, candidates: &[&Candidate]) -> usize {
    debug_assert!(!candidates.is_empty());
    if candidates.len() == 1 {
        return 0;
    }

    let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        return rng.gen_range(0..candidates.len());
    }

    let mut r = rng.gen_range(0..total);
    for (i, c) in candidates.iter().enumerate() {
        let w = u64::from(c.weight);
        if w == 0 {
            continue;
        }
        if r < w {
            return i;
        }
        r -= w;
    }

    candidates.len() - 1
}
