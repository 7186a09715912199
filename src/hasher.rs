use std::hash::{BuildHasher, Hasher};

/// Initial accumulator of the cdb hash.
pub const HASH_SEED: u32 = 5381;

/// Computes the cdb hash of `key`.
///
/// The accumulator starts at [`HASH_SEED`] and every byte is folded in as
/// `h = (h * 33) ^ byte` with 32-bit wrapping arithmetic. Builders and
/// readers must agree on this function bit for bit.
#[inline]
pub fn hash(key: &[u8]) -> u32 {
    let mut hasher = CdbHasher::default();
    hasher.write(key);
    hasher.state
}

/// Streaming form of [`hash`].
///
/// Successive [`write`](Hasher::write) calls hash as if their inputs were
/// concatenated. [`finish`](Hasher::finish) returns the 32-bit state widened
/// to `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdbHasher {
    state: u32,
}

impl CdbHasher {
    /// Returns the current 32-bit hash value.
    pub fn finish32(&self) -> u32 {
        self.state
    }
}

impl Default for CdbHasher {
    fn default() -> Self {
        CdbHasher { state: HASH_SEED }
    }
}

impl Hasher for CdbHasher {
    fn finish(&self) -> u64 {
        self.state as u64
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state = ((self.state << 5).wrapping_add(self.state)) ^ byte as u32;
        }
    }
}

/// [`BuildHasher`] producing [`CdbHasher`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct CdbBuildHasher;

impl BuildHasher for CdbBuildHasher {
    type Hasher = CdbHasher;

    fn build_hasher(&self) -> Self::Hasher {
        CdbHasher::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(hash(b""), 5381);
        assert_eq!(hash(b"a"), 177604);
        // (177604 * 33) ^ 'b'
        assert_eq!(hash(b"ab"), (177604u32 * 33) ^ b'b' as u32);
    }

    #[test]
    fn test_wraps_at_32_bits() {
        let key = vec![0xffu8; 64];
        let mut expected: u64 = 5381;
        for &b in &key {
            expected = ((expected * 33) & 0xffff_ffff) ^ b as u64;
        }
        assert_eq!(hash(&key) as u64, expected);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut hasher = CdbBuildHasher.build_hasher();
        hasher.write(b"hello ");
        hasher.write(b"world");
        assert_eq!(hasher.finish32(), hash(b"hello world"));
        assert_eq!(hasher.finish(), hash(b"hello world") as u64);
    }
}
