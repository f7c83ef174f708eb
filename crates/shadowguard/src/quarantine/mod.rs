//! Bounded holding area for freed blocks.
//!
//! Objects enter at free time and leave oldest-first once their shard is over
//! budget; whoever pops them performs the real release. The quarantine never
//! touches block memory, it only tracks identities and footprints.

pub mod sharded;

use crate::util::mix64;

pub use sharded::ShardedQuarantine;

/// Something that can be held in a quarantine.
pub trait Quarantinable: Copy + PartialEq + Send {
    /// Bytes charged against the budget.
    fn footprint(&self) -> usize;
    /// Identity hash used to pick a shard.
    fn shard_hash(&self) -> u64;
}

/// A quarantined block: its header address and total size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QuarantineEntry {
    pub block: usize,
    pub size: usize,
}

impl Quarantinable for QuarantineEntry {
    #[inline]
    fn footprint(&self) -> usize {
        self.size
    }

    #[inline]
    fn shard_hash(&self) -> u64 {
        mix64(self.block as u64)
    }
}

/// Spread a hash over `shards` buckets. Inputs are often poorly distributed
/// (aligned addresses), so the low bits get mixed in before the modulo.
#[inline]
pub fn shard_index(hash: u64, shards: usize) -> usize {
    let mut a = hash as u32;
    a = a.wrapping_sub(a << 6);
    a ^= a >> 17;
    a = a.wrapping_sub(a << 9);
    a ^= a << 4;
    a = a.wrapping_sub(a << 3);
    a ^= a << 10;
    a ^= a >> 15;
    a as usize % shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_addresses_spread_over_shards() {
        const SHARDS: usize = 16;
        let mut counts = [0usize; SHARDS];
        for i in 0..16_000usize {
            let e = QuarantineEntry {
                block: 0x1000_0000 + i * 64,
                size: 64,
            };
            counts[shard_index(e.shard_hash(), SHARDS)] += 1;
        }
        for &c in &counts {
            assert!(c > 500 && c < 1500, "{:?}", counts);
        }
    }
}
