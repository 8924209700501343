//! Weighted random selection.

use crate::director::{Member, SelectContext, Selector};

/// Picks a candidate with probability proportional to its weight.
#[derive(Debug, Default)]
pub struct WeightedRandom;

/// Walk `candidates` until the cumulative weight passes `point`.
pub(crate) fn pick_weighted(members: &[Member], candidates: &[usize], point: u64) -> Option<usize> {
    let mut acc = 0u64;
    for &i in candidates {
        acc += u64::from(members[i].weight);
        if point < acc {
            return Some(i);
        }
    }
    candidates.last().copied()
}

pub(crate) fn total_weight(members: &[Member], candidates: &[usize]) -> u64 {
    candidates.iter().map(|&i| u64::from(members[i].weight)).sum()
}

impl Selector for WeightedRandom {
    fn select(&self, members: &[Member], candidates: &[usize], _ctx: &SelectContext<'_>) -> Option<usize> {
        let total = total_weight(members, candidates);
        if total == 0 {
            return candidates.first().copied();
        }
        pick_weighted(members, candidates, fastrand::u64(0..total))
    }
}
