//! Record digests and partition ids.
//!
//! A record is addressed by the RIPEMD-160 hash of its set name followed by
//! its typed key (particle type byte, then the key payload). The digest,
//! not the raw key, decides which partition and therefore which node owns
//! the record.

use std::fmt;

use ripemd::{Digest as _, Ripemd160};

use crate::error::Result;
use crate::protocol::value::Value;

pub const DIGEST_SIZE: usize = 20;

/// 20-byte record identifier within a namespace.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    /// Hashes `set` and `key` the way the server does.
    ///
    /// Fails with an encoding error for value types that cannot be keys.
    pub fn compute(set: &str, key: &Value) -> Result<Self> {
        let mut key_bytes = Vec::with_capacity(1 + key.wire_size()?);
        key.write_key(&mut key_bytes)?;

        let mut hasher = Ripemd160::new();
        hasher.update(set.as_bytes());
        hasher.update(&key_bytes);

        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&hasher.finalize());
        Ok(Self(out))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; DIGEST_SIZE] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Partition owning this digest.
    ///
    /// Uses the first four digest bytes read little-endian, which is how
    /// servers on x86 derive the id.
    pub fn partition_id(&self, n_partitions: u32) -> u32 {
        partition_id(self, n_partitions)
    }
}

/// `first 32 bits of digest mod n_partitions`; zero partitions maps to 0.
pub fn partition_id(digest: &Digest, n_partitions: u32) -> u32 {
    if n_partitions == 0 {
        return 0;
    }
    let head = [digest.0[0], digest.0[1], digest.0[2], digest.0[3]];
    u32::from_le_bytes(head) % n_partitions
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
