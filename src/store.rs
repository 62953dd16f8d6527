use futures::future::join_all;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commands::info::Info;
use crate::commands::Command;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::eviction::{EvictionConfig, EvictionController, PolicyKind};
use crate::frame::Frame;
use crate::memory::{AccountedMemory, MemoryMonitor, MemorySourceKind};
use crate::router::Router;
use crate::scheduler::SchedulerStats;
use crate::shard::{Shard, ShardHandle, ShardStats};

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub shards: usize,
    pub maxmemory: u64,
    pub deny_ratio: f64,
    pub memory_source: MemorySourceKind,
    pub sample_interval: Duration,
    pub eviction: EvictionConfig,
    pub keys_output_limit: usize,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions {
            shards: 1,
            maxmemory: 0,
            deny_ratio: 1.02,
            memory_source: MemorySourceKind::Accounted,
            sample_interval: Duration::from_millis(10),
            eviction: EvictionConfig::default(),
            keys_output_limit: 8192,
        }
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> StoreOptions {
        let sample_interval = Duration::from_millis(config.mem_sample_interval_ms);

        StoreOptions {
            shards: config.threads(),
            maxmemory: config.maxmemory,
            deny_ratio: config.rss_oom_deny_ratio,
            memory_source: config.memory_source,
            sample_interval,
            eviction: EvictionConfig {
                cache_mode: config.cache_mode,
                policy: config.eviction_policy,
                watermark: config.eviction_watermark,
                heartbeat: config.enable_heartbeat_eviction,
                ..EvictionConfig::default()
            },
            keys_output_limit: config.keys_output_limit,
        }
    }
}

/// Snapshot of the store, as reported by INFO.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub uptime: Duration,
    pub shard_count: usize,
    pub used_memory: u64,
    pub resident: u64,
    pub maxmemory: u64,
    pub memory_ratio: f64,
    pub deny_threshold: Option<u64>,
    pub cache_mode: bool,
    pub policy: PolicyKind,
    pub evicted_keys: u64,
    pub shards: Vec<ShardStats>,
}

impl StoreStats {
    pub fn keys(&self) -> usize {
        self.shards.iter().map(|shard| shard.keys).sum()
    }

    pub fn scheduler(&self) -> SchedulerStats {
        self.shards
            .iter()
            .fold(SchedulerStats::default(), |total, shard| SchedulerStats {
                admitted: total.admitted + shard.scheduler.admitted,
                out_of_order: total.out_of_order + shard.scheduler.out_of_order,
                queued: total.queued + shard.scheduler.queued,
                cancelled: total.cancelled + shard.scheduler.cancelled,
            })
    }
}

/// The Store owns the shards and the background tasks around them: the memory sampler and the
/// eviction heartbeat. It is cheap to clone, every clone shares the same shards, and everything
/// is stopped once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<InnerStore>,
}

#[derive(Debug)]
struct InnerStore {
    coordinator: Coordinator,
    shards: Arc<[ShardHandle]>,
    memory: Arc<MemoryMonitor>,
    eviction: Arc<EvictionController>,
    started: Instant,
    shutdown: CancellationToken,
}

impl Store {
    /// Spawns the shards and background tasks. Must be called from within a Tokio runtime.
    pub fn start(options: StoreOptions) -> Store {
        let shard_count = options.shards.max(1);
        let router = Router::new(shard_count);
        let shutdown = CancellationToken::new();

        let memory = Arc::new(MemoryMonitor::new(
            options.memory_source,
            AccountedMemory::new(),
            options.maxmemory,
            options.deny_ratio,
        ));
        let eviction = Arc::new(EvictionController::new(
            options.eviction.clone(),
            memory.clone(),
        ));

        let shards: Arc<[ShardHandle]> = (0..shard_count)
            .map(|id| {
                Shard::spawn(
                    id,
                    router,
                    eviction.clone(),
                    options.keys_output_limit,
                    shutdown.clone(),
                )
            })
            .collect();

        tokio::spawn(
            memory
                .clone()
                .run(options.sample_interval, shutdown.clone()),
        );
        if options.eviction.cache_mode && options.eviction.heartbeat {
            tokio::spawn(
                eviction
                    .clone()
                    .run_heartbeat(shards.clone(), shutdown.clone()),
            );
        }

        info!(
            shards = shard_count,
            maxmemory = options.maxmemory,
            cache_mode = options.eviction.cache_mode,
            memory_source = %options.memory_source,
            "Store started"
        );

        let coordinator = Coordinator::new(shards.clone(), router, options.keys_output_limit);

        Store {
            inner: Arc::new(InnerStore {
                coordinator,
                shards,
                memory,
                eviction,
                started: Instant::now(),
                shutdown,
            }),
        }
    }

    /// Runs a single command.
    pub async fn submit(&self, command: Command) -> Frame {
        match command {
            Command::Info(info) => self.info(&info).await,
            command => self.inner.coordinator.execute(command).await,
        }
    }

    /// Runs the commands queued by MULTI as one transaction.
    pub async fn submit_multi(&self, commands: Vec<Command>) -> Frame {
        self.inner.coordinator.execute_multi(commands).await
    }

    pub async fn stats(&self) -> StoreStats {
        let replies = join_all(self.inner.shards.iter().map(|shard| shard.stats())).await;

        let mut shards = Vec::with_capacity(replies.len());
        for reply in replies {
            match reply {
                Ok(stats) => shards.push(stats),
                Err(err) => warn!(error = %err, "Failed to collect shard stats"),
            }
        }

        let memory = &self.inner.memory;
        let config = self.inner.eviction.config();

        StoreStats {
            uptime: self.inner.started.elapsed(),
            shard_count: self.inner.shards.len(),
            used_memory: memory.used_bytes(),
            resident: memory.resident(),
            maxmemory: memory.maxmemory(),
            memory_ratio: memory.current_ratio(),
            deny_threshold: memory.deny_threshold(),
            cache_mode: config.cache_mode,
            policy: config.policy,
            evicted_keys: self.inner.eviction.evicted_keys(),
            shards,
        }
    }

    pub async fn info(&self, info: &Info) -> Frame {
        info.render(&self.stats().await)
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.inner.memory
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Stops the shards and background tasks. Pending requests fail with a shard unavailable
    /// error.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for InnerStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cmd(parts: &[&str]) -> Command {
        let frame = Frame::Array(
            parts
                .iter()
                .map(|part| Frame::Bulk(Bytes::from(part.to_string())))
                .collect(),
        );
        Command::try_from(frame).unwrap()
    }

    #[tokio::test]
    async fn submit_and_collect_stats() {
        let store = Store::start(StoreOptions {
            shards: 3,
            ..StoreOptions::default()
        });

        store.submit(cmd(&["MSET", "a", "1", "b", "2", "c", "3"])).await;
        store.submit(cmd(&["GET", "a"])).await;

        let stats = store.stats().await;
        assert_eq!(stats.shard_count, 3);
        assert_eq!(stats.shards.len(), 3);
        assert_eq!(stats.keys(), 3);
        assert!(stats.used_memory > 0);
        assert!(stats.scheduler().admitted >= 2);
    }

    #[tokio::test]
    async fn info_is_answered_by_the_store() {
        let store = Store::start(StoreOptions::default());
        store.submit(cmd(&["SET", "a", "1"])).await;

        let Frame::Bulk(info) = store.submit(cmd(&["INFO", "keyspace"])).await else {
            panic!("expected a bulk string");
        };
        assert_eq!(&info[..], b"# Keyspace\r\ndb0:keys=1\r\n");
    }

    #[tokio::test]
    async fn cache_mode_evicts_instead_of_failing() {
        let store = Store::start(StoreOptions {
            shards: 2,
            maxmemory: 64 * 1024,
            eviction: EvictionConfig {
                cache_mode: true,
                ..EvictionConfig::default()
            },
            ..StoreOptions::default()
        });

        let reply = store
            .submit(cmd(&["DEBUG", "POPULATE", "2000", "key", "256"]))
            .await;
        assert_eq!(reply, Frame::ok());

        let stats = store.stats().await;
        assert!(stats.evicted_keys > 0);
        assert!(stats.keys() < 2000);
    }

    #[tokio::test]
    async fn shutdown_stops_the_shards() {
        let store = Store::start(StoreOptions::default());
        store.shutdown();

        // Give the shard task a chance to observe the cancellation.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let stats = store.stats().await;
        assert!(stats.shards.is_empty());
    }
}
