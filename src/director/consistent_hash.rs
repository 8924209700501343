//! Consistent hashing over a ring of virtual nodes.
//!
//! Each backend owns `vnodes_per_backend` points derived from
//! `(seed, backend name, vnode index)`. A request maps to the first point
//! clockwise of its key hash whose backend is a candidate. Points depend only
//! on the backend's own identity, so removing a backend only moves the keys
//! that landed on its points.

use crate::director::hash::hash64;
use crate::director::{Member, SelectContext, Selector};

pub const DEFAULT_VNODES: u32 = 256;

/// Sorted ring of `(point, member index)`.
#[derive(Debug)]
pub struct HashRing {
    points: Vec<(u64, usize)>,
}

impl HashRing {
    pub fn new(members: &[Member], vnodes_per_backend: u32, seed: u64) -> Self {
        let vnodes = vnodes_per_backend.max(1);
        let mut points = Vec::with_capacity(members.len() * vnodes as usize);
        for (index, member) in members.iter().enumerate() {
            for vnode in 0..vnodes {
                let id = format!("{}:{}:{}", seed, member.backend.name, vnode);
                points.push((hash64(id.as_bytes()), index));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl Selector for HashRing {
    fn select(&self, members: &[Member], candidates: &[usize], ctx: &SelectContext<'_>) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let mut eligible = vec![false; members.len()];
        for &i in candidates {
            eligible[i] = true;
        }

        let start = self.points.partition_point(|(point, _)| *point < ctx.key_hash);
        let n = self.points.len();
        (0..n)
            .map(|offset| self.points[(start + offset) % n].1)
            .find(|&index| eligible[index])
    }
}
