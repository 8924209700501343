//! Fallback selection: first healthy backend in declared order.

use crate::director::{Member, SelectContext, Selector};

#[derive(Debug, Default)]
pub struct Fallback;

impl Selector for Fallback {
    fn select(&self, _members: &[Member], candidates: &[usize], _ctx: &SelectContext<'_>) -> Option<usize> {
        // Candidates keep declared order, so the first one wins.
        candidates.first().copied()
    }
}
