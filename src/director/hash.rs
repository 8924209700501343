//! Deterministic selection from a request hash.
//!
//! `hash` directors use the cache key digest, `client` directors use the
//! client identity. The hash is scaled onto the cumulative weight of the
//! candidates, so the choice only moves when the topology or health changes.

use sha2::{Digest, Sha256};

use crate::director::random::{pick_weighted, total_weight};
use crate::director::{Member, SelectContext, Selector};

/// First 8 bytes of a SHA-256 digest, big endian.
pub fn hash64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    CacheKey,
    Client,
}

/// Weighted hash selection.
#[derive(Debug)]
pub struct KeyHash {
    source: Source,
}

impl KeyHash {
    pub fn cache_key() -> Self {
        Self { source: Source::CacheKey }
    }

    pub fn client() -> Self {
        Self { source: Source::Client }
    }
}

impl Selector for KeyHash {
    fn select(&self, members: &[Member], candidates: &[usize], ctx: &SelectContext<'_>) -> Option<usize> {
        let hash = match self.source {
            Source::CacheKey => ctx.key_hash,
            Source::Client => ctx.client_hash,
        };
        let total = total_weight(members, candidates);
        if total == 0 {
            return candidates.first().copied();
        }
        // Scale instead of modulo so weight ranges stay contiguous.
        let point = ((u128::from(hash) * u128::from(total)) >> 64) as u64;
        pick_weighted(members, candidates, point)
    }
}
