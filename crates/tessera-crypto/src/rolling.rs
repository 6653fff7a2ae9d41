//! Rolling hash used to identify chunk windows
//!
//! A CRC-64 style table hash with polynomial `0xC96C5795D7870F42`. Unlike a
//! CRC, each step rotates the state left by one bit before mixing in the
//! table entry for the next byte:
//!
//! ```text
//! h = rotl(h, 1) ^ TABLE[byte]
//! ```
//!
//! The hash is computed over the uncompressed chunk payload (usually a full
//! 1 MiB window) and stored next to the SHA-1 in both the chunk header and
//! the manifest chunk list.

/// Polynomial used to build [`ROLLING_TABLE`]
pub const POLYNOMIAL: u64 = 0xC96C_5795_D787_0F42;

/// Lookup table for the rolling hash
pub static ROLLING_TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the rolling hash of a buffer
///
/// # Examples
///
/// ```
/// use tessera_crypto::rolling_hash;
///
/// assert_eq!(rolling_hash(&[]), 0);
/// assert_eq!(rolling_hash(&[0u8; 1024]), 0);
/// ```
pub fn rolling_hash(data: &[u8]) -> u64 {
    let mut hasher = RollingHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Incremental rolling hash state
///
/// Feeding a buffer in several pieces yields the same value as hashing it
/// in one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingHasher {
    state: u64,
}

impl RollingHasher {
    /// Create a hasher with an empty state
    pub const fn new() -> Self {
        Self { state: 0 }
    }

    /// Mix more bytes into the state
    pub fn update(&mut self, data: &[u8]) {
        let mut h = self.state;
        for &byte in data {
            h = h.rotate_left(1) ^ ROLLING_TABLE[byte as usize];
        }
        self.state = h;
    }

    /// Current hash value
    pub const fn finish(&self) -> u64 {
        self.state
    }
}
