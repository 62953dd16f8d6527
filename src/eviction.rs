use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::db::{Access, Db};
use crate::memory::MemoryMonitor;
use crate::scheduler::KeyLocks;
use crate::shard::{Message, ShardHandle};
use crate::transaction::TxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PolicyKind {
    Lru,
    Lfu,
}

impl PolicyKind {
    pub fn policy(self) -> Box<dyn EvictionPolicy> {
        match self {
            PolicyKind::Lru => Box::new(Lru),
            PolicyKind::Lfu => Box::new(Lfu),
        }
    }
}

/// Scores eviction candidates, the highest score is evicted first.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    fn score(&self, access: &Access, clock: u64) -> u64;
}

/// Least recently used: the longest idle key goes first.
#[derive(Debug)]
pub struct Lru;

impl EvictionPolicy for Lru {
    fn score(&self, access: &Access, clock: u64) -> u64 {
        clock.saturating_sub(access.last_access)
    }
}

/// Least frequently used: the key with the fewest hits goes first.
#[derive(Debug)]
pub struct Lfu;

impl EvictionPolicy for Lfu {
    fn score(&self, access: &Access, _clock: u64) -> u64 {
        u64::MAX - access.hits
    }
}

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub cache_mode: bool,
    pub policy: PolicyKind,
    /// Fraction of `maxmemory` above which eviction kicks in.
    pub watermark: f64,
    /// Keys sampled per eviction round.
    pub samples: usize,
    /// Keys evicted at most per synchronous run.
    pub max_batch: usize,
    pub heartbeat: bool,
    pub interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        EvictionConfig {
            cache_mode: false,
            policy: PolicyKind::Lru,
            watermark: 0.9,
            samples: 5,
            max_batch: 32,
            heartbeat: true,
            interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
    pub keys: usize,
    pub bytes: u64,
}

/// Reclaims memory in cache mode and gates memory-growing writes.
#[derive(Debug)]
pub struct EvictionController {
    config: EvictionConfig,
    policy: Box<dyn EvictionPolicy>,
    memory: Arc<MemoryMonitor>,
    evicted: AtomicU64,
}

impl EvictionController {
    pub fn new(config: EvictionConfig, memory: Arc<MemoryMonitor>) -> EvictionController {
        EvictionController {
            policy: config.policy.policy(),
            config,
            memory,
            evicted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    pub fn evicted_keys(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn under_pressure(&self) -> bool {
        self.config.cache_mode
            && self.memory.is_limited()
            && self.memory.current_ratio() > self.config.watermark
    }

    /// Bytes above the eviction target, the lower of the watermark and the deny threshold.
    pub fn excess(&self) -> u64 {
        let Some(threshold) = self.memory.deny_threshold() else {
            return 0;
        };
        let watermark = (self.memory.maxmemory() as f64 * self.config.watermark) as u64;

        self.memory.resident().saturating_sub(watermark.min(threshold))
    }

    /// Evicts unlocked keys of `db` until `goal` bytes are freed, `max_keys` keys are gone, or
    /// nothing evictable is left. When a sample only holds locked keys the sample is widened,
    /// up to the whole shard.
    pub fn evict(&self, db: &mut Db, locks: &dyn KeyLocks, goal: u64, max_keys: usize) -> Evicted {
        let samples = self.config.samples.max(1);
        let mut evicted = Evicted::default();
        let mut width = samples;

        while evicted.bytes < goal && evicted.keys < max_keys && !db.is_empty() {
            let clock = db.clock();
            let victim = db
                .sample(width)
                .into_iter()
                .filter(|candidate| !locks.is_locked(&candidate.key))
                .max_by_key(|candidate| self.policy.score(&candidate.access, clock));

            match victim {
                Some(candidate) => {
                    if let Some(size) = db.evict(&candidate.key) {
                        evicted.bytes += size as u64;
                        evicted.keys += 1;
                    }
                    width = samples;
                }
                None if width >= db.len() => break,
                None => width = width.saturating_mul(2),
            }
        }

        if evicted.keys > 0 {
            self.evicted
                .fetch_add(evicted.keys as u64, Ordering::Relaxed);
            debug!(
                shard = db.shard(),
                keys = evicted.keys,
                bytes = evicted.bytes,
                "Evicted keys"
            );
        }

        evicted
    }

    /// Write gate, run on the shard right before a write that may grow memory.
    ///
    /// In cache mode it first evicts when under pressure, and denies only if memory is still
    /// above the deny threshold afterwards. Otherwise writes are denied once accounted memory
    /// exceeds `maxmemory`.
    pub fn admit_write(&self, db: &mut Db, locks: &dyn KeyLocks) -> Result<(), TxError> {
        if !self.memory.is_limited() {
            return Ok(());
        }

        if !self.config.cache_mode {
            if self.memory.is_over_maxmemory() {
                warn!(
                    shard = db.shard(),
                    used = self.memory.used_bytes(),
                    "Write denied, maxmemory reached"
                );
                return Err(TxError::ResourceExhausted);
            }
            return Ok(());
        }

        if self.under_pressure() || self.memory.is_over_deny_threshold() {
            let goal = self.excess().max(1);
            self.evict(db, locks, goal, self.config.max_batch);
        }

        if self.memory.is_over_deny_threshold() {
            warn!(
                shard = db.shard(),
                resident = self.memory.resident(),
                "Write denied, memory above the deny threshold"
            );
            return Err(TxError::ResourceExhausted);
        }

        Ok(())
    }

    /// Periodically asks every shard to evict its share of the excess while under pressure.
    pub async fn run_heartbeat(
        self: Arc<Self>,
        shards: Arc<[ShardHandle]>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = time::interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.under_pressure() {
                        continue;
                    }

                    let goal = self.excess() / shards.len().max(1) as u64 + 1;
                    trace!(goal, "Eviction heartbeat");

                    for shard in shards.iter() {
                        // A shard that is gone has nothing left to evict.
                        let _ = shard.send(Message::Evict { goal });
                    }
                }
            }
        }

        debug!("Eviction heartbeat stopped");
    }
}
