use std::collections::HashSet;
use thiserror::Error as ThisError;

use crate::db::Key;
use crate::frame::Frame;
use crate::router::{Router, ShardId};

/// Transaction ids are allocated monotonically, so they also order transactions by arrival.
pub type TxId = u64;

/// Keys a command needs, before it is split per shard.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// Keyless, answered without touching any shard.
    None,
    Keys(Vec<Key>),
    /// The whole keyspace of every shard, e.g. FLUSHDB or KEYS.
    All,
}

/// The set of keys a transaction may touch on one shard.
#[derive(Debug, Clone, PartialEq)]
pub enum Footprint {
    Keys(HashSet<Key>),
    /// Not known up front, conflicts with everything on the shard.
    Dynamic,
}

impl Footprint {
    pub fn keys<I: IntoIterator<Item = Key>>(keys: I) -> Footprint {
        Footprint::Keys(keys.into_iter().collect())
    }

    pub fn intersects(&self, other: &Footprint) -> bool {
        match (self, other) {
            (Footprint::Dynamic, _) | (_, Footprint::Dynamic) => true,
            (Footprint::Keys(a), Footprint::Keys(b)) => {
                let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                small.iter().any(|key| large.contains(key))
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            Footprint::Dynamic => true,
            Footprint::Keys(keys) => keys.contains(key),
        }
    }

    /// The part of the footprint that lives on `shard`.
    pub fn restrict(&self, router: &Router, shard: ShardId) -> Footprint {
        match self {
            Footprint::Dynamic => Footprint::Dynamic,
            Footprint::Keys(keys) => Footprint::Keys(
                keys.iter()
                    .filter(|key| router.shard_of(key) == shard)
                    .cloned()
                    .collect(),
            ),
        }
    }

    pub fn union(self, other: Footprint) -> Footprint {
        match (self, other) {
            (Footprint::Keys(mut a), Footprint::Keys(b)) => {
                a.extend(b);
                Footprint::Keys(a)
            }
            _ => Footprint::Dynamic,
        }
    }
}

impl From<Scope> for Footprint {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::None => Footprint::Keys(HashSet::new()),
            Scope::Keys(keys) => Footprint::keys(keys),
            Scope::All => Footprint::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopClass {
    /// Runs in one hop, the slot is released right after.
    SingleHop,
    /// Keeps its slot across several hops until released.
    MultiHop,
}

/// What a transaction asks a shard scheduler for.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRequest {
    pub seq: TxId,
    pub footprint: Footprint,
    pub class: HopClass,
}

impl SlotRequest {
    pub fn new(seq: TxId, footprint: Footprint, class: HopClass) -> SlotRequest {
        SlotRequest {
            seq,
            footprint,
            class,
        }
    }
}

pub const OOM_MESSAGE: &str = "OOM command not allowed when used memory > 'maxmemory'";

#[derive(Debug, Clone, ThisError, PartialEq)]
pub enum TxError {
    #[error("timed out waiting for admission")]
    AdmissionTimeout,
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    ResourceExhausted,
    #[error("transaction aborted on shard {shard}: {cause}")]
    CrossShardAbort { shard: ShardId, cause: Box<TxError> },
    #[error("shard {0} is unavailable")]
    ShardUnavailable(ShardId),
    #[error("transaction {txid} does not hold a slot")]
    SlotNotHeld { txid: TxId },
    #[error("transaction driver failed: {0}")]
    DriverFailed(String),
}

impl TxError {
    /// The innermost cause, so an aborted cross-shard write reports the same error a single
    /// shard would.
    pub fn root(&self) -> &TxError {
        match self {
            TxError::CrossShardAbort { cause, .. } => cause.root(),
            err => err,
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            TxError::ResourceExhausted => Frame::Error(OOM_MESSAGE.to_string()),
            TxError::CrossShardAbort { cause, .. }
                if *cause.root() == TxError::ResourceExhausted =>
            {
                Frame::Error(OOM_MESSAGE.to_string())
            }
            err => Frame::Error(format!("ERR {}", err)),
        }
    }
}
