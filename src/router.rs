use crc::{Crc, CRC_16_XMODEM};
use itertools::Itertools;

/// Number of hash slots in the keyspace, as in Redis Cluster.
pub const TOTAL_SLOTS: u16 = 16384;

pub type ShardId = usize;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Maps keys to slots and slots to shards. Each shard owns a contiguous range of slots, so the
/// mapping only depends on the number of shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Router {
    shards: usize,
}

impl Router {
    pub fn new(shards: usize) -> Router {
        Router {
            shards: shards.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    pub fn slot(key: &[u8]) -> u16 {
        CRC16.checksum(hash_tag(key)) % TOTAL_SLOTS
    }

    pub fn shard_of(&self, key: &[u8]) -> ShardId {
        Router::slot(key) as usize * self.shards / TOTAL_SLOTS as usize
    }

    /// Distinct shards touched by `keys`, in ascending order.
    pub fn shards_of<'a, I>(&self, keys: I) -> Vec<ShardId>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        keys.into_iter()
            .map(|key| self.shard_of(key))
            .sorted_unstable()
            .dedup()
            .collect()
    }
}

/// Only the part between the first `{` and the next `}` is hashed when it is non-empty, which
/// lets callers co-locate related keys.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };

    match key[open + 1..].iter().position(|&b| b == b'}') {
        Some(len) if len > 0 => &key[open + 1..open + 1 + len],
        _ => key,
    }
}
