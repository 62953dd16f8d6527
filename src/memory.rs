use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const PAGE_SIZE: u64 = 4096;

/// Where resident memory is read from.
pub trait MemorySource: Send + Sync + fmt::Debug {
    fn resident_bytes(&self) -> u64;

    /// Cheap enough to be read on every check instead of going through the last sample.
    fn is_realtime(&self) -> bool {
        false
    }
}

/// Bytes accounted by the shards for their entries, plus in-flight reply buffers.
#[derive(Debug, Clone, Default)]
pub struct AccountedMemory(Arc<AtomicU64>);

impl AccountedMemory {
    pub fn new() -> AccountedMemory {
        AccountedMemory::default()
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub(&self, bytes: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MemorySource for AccountedMemory {
    fn resident_bytes(&self) -> u64 {
        self.get()
    }

    fn is_realtime(&self) -> bool {
        true
    }
}

/// Resident set size of the process, falls back to accounted bytes where procfs is missing.
#[derive(Debug)]
pub struct ProcessRss {
    fallback: AccountedMemory,
}

impl MemorySource for ProcessRss {
    fn resident_bytes(&self) -> u64 {
        read_statm_rss().unwrap_or_else(|| self.fallback.get())
    }
}

fn read_statm_rss() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MemorySourceKind {
    Accounted,
    Rss,
}

impl MemorySourceKind {
    pub fn build(self, accounted: &AccountedMemory) -> Box<dyn MemorySource> {
        match self {
            MemorySourceKind::Accounted => Box::new(accounted.clone()),
            MemorySourceKind::Rss => Box::new(ProcessRss {
                fallback: accounted.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub taken_at: Instant,
    pub resident: u64,
}

/// Tracks resident memory against `maxmemory`. A `maxmemory` of 0 means unlimited, in which case
/// nothing is ever over a threshold.
#[derive(Debug)]
pub struct MemoryMonitor {
    source: Box<dyn MemorySource>,
    accounted: AccountedMemory,
    maxmemory: u64,
    deny_ratio: f64,
    started: Instant,
    // The last sample, kept in atomics so readers never wait on the sampler.
    last_resident: AtomicU64,
    last_sample_ms: AtomicU64,
}

impl MemoryMonitor {
    pub fn new(
        kind: MemorySourceKind,
        accounted: AccountedMemory,
        maxmemory: u64,
        deny_ratio: f64,
    ) -> MemoryMonitor {
        let monitor = MemoryMonitor {
            source: kind.build(&accounted),
            accounted,
            maxmemory,
            deny_ratio,
            started: Instant::now(),
            last_resident: AtomicU64::new(0),
            last_sample_ms: AtomicU64::new(0),
        };
        monitor.sample();
        monitor
    }

    pub fn sample(&self) -> MemorySample {
        let resident = self.source.resident_bytes();
        let taken_at = Instant::now();

        self.last_resident.store(resident, Ordering::Relaxed);
        self.last_sample_ms.store(
            taken_at.duration_since(self.started).as_millis() as u64,
            Ordering::Relaxed,
        );

        MemorySample { taken_at, resident }
    }

    pub fn last_sample(&self) -> MemorySample {
        MemorySample {
            taken_at: self.started
                + Duration::from_millis(self.last_sample_ms.load(Ordering::Relaxed)),
            resident: self.last_resident.load(Ordering::Relaxed),
        }
    }

    pub fn resident(&self) -> u64 {
        if self.source.is_realtime() {
            self.source.resident_bytes()
        } else {
            self.last_resident.load(Ordering::Relaxed)
        }
    }

    pub fn maxmemory(&self) -> u64 {
        self.maxmemory
    }

    pub fn is_limited(&self) -> bool {
        self.maxmemory > 0
    }

    pub fn current_ratio(&self) -> f64 {
        if !self.is_limited() {
            return 0.0;
        }
        self.resident() as f64 / self.maxmemory as f64
    }

    pub fn deny_threshold(&self) -> Option<u64> {
        self.is_limited()
            .then(|| (self.maxmemory as f64 * self.deny_ratio) as u64)
    }

    pub fn is_over_deny_threshold(&self) -> bool {
        self.would_deny(0)
    }

    /// Whether allocating `extra` more bytes would cross the deny threshold.
    pub fn would_deny(&self, extra: u64) -> bool {
        self.deny_threshold()
            .is_some_and(|threshold| self.resident().saturating_add(extra) > threshold)
    }

    pub fn used_bytes(&self) -> u64 {
        self.accounted.get()
    }

    pub fn is_over_maxmemory(&self) -> bool {
        self.is_limited() && self.used_bytes() > self.maxmemory
    }

    pub fn accounted(&self) -> &AccountedMemory {
        &self.accounted
    }

    /// Samples the source every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = self.sample();
                    trace!(resident = sample.resident, "Memory sampled");
                }
            }
        }

        debug!("Memory sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::str::FromStr;

    #[test]
    fn accounted_memory_never_underflows() {
        let memory = AccountedMemory::new();
        memory.add(10);
        memory.sub(4);
        assert_eq!(memory.get(), 6);

        memory.sub(100);
        assert_eq!(memory.get(), 0);
    }

    #[test]
    fn unlimited_monitor_never_denies() {
        let accounted = AccountedMemory::new();
        let monitor = MemoryMonitor::new(MemorySourceKind::Accounted, accounted.clone(), 0, 1.02);

        accounted.add(u64::MAX / 2);

        assert_eq!(monitor.current_ratio(), 0.0);
        assert_eq!(monitor.deny_threshold(), None);
        assert!(!monitor.is_over_deny_threshold());
        assert!(!monitor.is_over_maxmemory());
    }

    #[test]
    fn accounted_source_is_read_in_real_time() {
        let accounted = AccountedMemory::new();
        let monitor = MemoryMonitor::new(MemorySourceKind::Accounted, accounted.clone(), 1000, 1.5);

        accounted.add(500);
        assert_eq!(monitor.current_ratio(), 0.5);
        assert_eq!(monitor.deny_threshold(), Some(1500));
        assert!(!monitor.is_over_deny_threshold());
        assert!(monitor.would_deny(1001));
        assert!(!monitor.would_deny(1000));

        accounted.add(600);
        assert!(monitor.is_over_maxmemory());
        assert!(!monitor.is_over_deny_threshold());

        accounted.add(401);
        assert!(monitor.is_over_deny_threshold());
    }

    #[test]
    fn sample_records_the_last_reading() {
        let accounted = AccountedMemory::new();
        let monitor = MemoryMonitor::new(MemorySourceKind::Accounted, accounted.clone(), 100, 1.0);

        accounted.add(42);
        let sample = monitor.sample();

        assert_eq!(sample.resident, 42);
        assert_eq!(monitor.last_sample().resident, 42);
    }

    #[test]
    fn rss_source_reads_procfs() {
        if !Path::new("/proc/self/statm").exists() {
            return;
        }

        let source = MemorySourceKind::Rss.build(&AccountedMemory::new());
        assert!(source.resident_bytes() > 0);
        assert!(!source.is_realtime());
    }

    #[test]
    fn parse_memory_source_kind() {
        assert_eq!(
            MemorySourceKind::from_str("accounted"),
            Ok(MemorySourceKind::Accounted)
        );
        assert_eq!(MemorySourceKind::from_str("RSS"), Ok(MemorySourceKind::Rss));
        assert!(MemorySourceKind::from_str("heap").is_err());
        assert_eq!(MemorySourceKind::Rss.to_string(), "rss");
    }
}
