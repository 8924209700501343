//! Cache keys.
//!
//! A key is the SHA-256 digest of the hash contributions declared during the
//! Hash stage, in declaration order. Each contribution is length-prefixed so
//! `["ab", "c"]` and `["a", "bc"]` never collide.

use std::fmt;

use sha2::{Digest, Sha256};

/// Digest identifying one cached object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut builder = KeyBuilder::new();
        for part in parts {
            builder.add(part);
        }
        builder.finish()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes of the digest, used by hash-based directors.
    pub fn as_u64(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Accumulates hash contributions during the Hash stage.
#[derive(Clone, Default)]
pub struct KeyBuilder {
    hasher: Sha256,
    parts: usize,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one contribution.
    pub fn add(&mut self, part: impl AsRef<[u8]>) -> &mut Self {
        let part = part.as_ref();
        self.hasher.update((part.len() as u64).to_be_bytes());
        self.hasher.update(part);
        self.parts += 1;
        self
    }

    /// Number of contributions so far.
    pub fn len(&self) -> usize {
        self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts == 0
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(self.hasher.finalize().into())
    }
}

impl fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBuilder").field("parts", &self.parts).finish()
    }
}
