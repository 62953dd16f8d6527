use std::collections::VecDeque;
use std::future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::blocking::WaiterId;
use crate::db::Db;
use crate::eviction::EvictionController;
use crate::router::{Router, ShardId};
use crate::scheduler::{Admission, Cancelled, KeyLocks, Scheduler, SchedulerStats};
use crate::transaction::{SlotRequest, TxError, TxId};

/// Keys evicted at most between two messages when memory is under pressure.
const OPPORTUNISTIC_EVICTION_BATCH: usize = 32;

/// One hop of a transaction, run on the shard task with exclusive access to its keyspace.
pub type Task = Box<dyn FnOnce(&mut HopContext<'_>) + Send>;

pub enum Message {
    /// Single-hop fast path. Runs once admitted, then its slot is released.
    Execute { request: SlotRequest, task: Task },
    /// Admission for coordinated transactions. `reply` fires once admitted, the slot stays
    /// active until `Release`.
    Acquire {
        request: SlotRequest,
        reply: oneshot::Sender<()>,
    },
    Hop { txid: TxId, task: Task },
    Release { txid: TxId },
    /// Queued requests are dropped, active ones released, unknown ones ignored.
    Cancel { txid: TxId },
    Unpark { waiter: WaiterId },
    Evict { goal: u64 },
    Stats { reply: oneshot::Sender<ShardStats> },
}

enum Work {
    Execute(Task),
    Acquire(oneshot::Sender<()>),
}

enum Event {
    Message(Message),
    Expired,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStats {
    pub shard: ShardId,
    pub keys: usize,
    pub used_bytes: usize,
    pub queue_depth: usize,
    pub active_slots: usize,
    pub parked: usize,
    pub scheduler: SchedulerStats,
}

/// What a hop sees of its shard.
pub struct HopContext<'a> {
    pub db: &'a mut Db,
    locks: &'a dyn KeyLocks,
    eviction: &'a EvictionController,
    keys_output_limit: usize,
}

impl<'a> HopContext<'a> {
    pub fn new(
        db: &'a mut Db,
        locks: &'a dyn KeyLocks,
        eviction: &'a EvictionController,
        keys_output_limit: usize,
    ) -> HopContext<'a> {
        HopContext {
            db,
            locks,
            eviction,
            keys_output_limit,
        }
    }

    /// Write gate for memory-growing writes, may evict keys of this shard.
    pub fn admit_write(&mut self) -> Result<(), TxError> {
        self.eviction.admit_write(self.db, self.locks)
    }

    pub fn keys_output_limit(&self) -> usize {
        self.keys_output_limit
    }

    pub fn eviction(&self) -> &EvictionController {
        self.eviction
    }
}

#[derive(Debug, Clone)]
pub struct ShardHandle {
    id: ShardId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ShardHandle {
    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn send(&self, message: Message) -> Result<(), TxError> {
        self.tx
            .send(message)
            .map_err(|_| TxError::ShardUnavailable(self.id))
    }

    pub async fn stats(&self) -> Result<ShardStats, TxError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Stats { reply })?;
        rx.await.map_err(|_| TxError::ShardUnavailable(self.id))
    }
}

/// A shard owns a slice of the keyspace and the scheduler that admits work on it. Everything
/// runs on a single task fed by a channel, so the keyspace is never shared.
pub struct Shard {
    db: Db,
    scheduler: Scheduler<Work>,
    eviction: Arc<EvictionController>,
    keys_output_limit: usize,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Shard {
    pub fn spawn(
        id: ShardId,
        router: Router,
        eviction: Arc<EvictionController>,
        keys_output_limit: usize,
        shutdown: CancellationToken,
    ) -> ShardHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let db = Db::new(id, router, eviction.memory().accounted().clone());

        let shard = Shard {
            db,
            scheduler: Scheduler::new(),
            eviction,
            keys_output_limit,
            rx,
        };
        tokio::spawn(shard.run(shutdown));

        ShardHandle { id, tx }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let shard = self.db.shard();
        debug!(shard, "Shard started");

        loop {
            let next_expiration = self.db.next_expiration();

            let event = tokio::select! {
                _ = shutdown.cancelled() => Event::Shutdown,
                message = self.rx.recv() => match message {
                    Some(message) => Event::Message(message),
                    None => Event::Shutdown,
                },
                _ = expiration(next_expiration) => Event::Expired,
            };

            match event {
                Event::Message(message) => self.handle(message),
                Event::Expired => {
                    let removed = self.db.remove_expired();
                    trace!(shard, removed, "Removed expired keys");
                }
                Event::Shutdown => break,
            }

            self.housekeeping();
        }

        debug!(shard, keys = self.db.len(), "Shard stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Execute { request, task } => {
                let txid = request.seq;
                if let Admission::Admitted(work) =
                    self.scheduler.schedule(request, Work::Execute(task))
                {
                    self.dispatch(vec![(txid, work)]);
                }
            }
            Message::Acquire { request, reply } => {
                let txid = request.seq;
                if let Admission::Admitted(work) =
                    self.scheduler.schedule(request, Work::Acquire(reply))
                {
                    self.dispatch(vec![(txid, work)]);
                }
            }
            Message::Hop { txid, task } => {
                if self.scheduler.is_active(txid) {
                    self.run_task(task);
                } else {
                    // Dropping the task closes its reply channel, which the sender reports.
                    warn!(shard = self.db.shard(), txid, "Hop without an active slot");
                }
            }
            Message::Release { txid } => {
                let admitted = self.scheduler.release(txid);
                self.dispatch(admitted);
            }
            Message::Cancel { txid } => match self.scheduler.cancel(txid) {
                Cancelled::Queued { admitted, .. } | Cancelled::Released(admitted) => {
                    self.dispatch(admitted)
                }
                Cancelled::Unknown => {}
            },
            Message::Unpark { waiter } => {
                self.db.unpark(waiter);
            }
            Message::Evict { goal } => {
                let max_keys = self.eviction.config().max_batch;
                self.eviction
                    .evict(&mut self.db, &self.scheduler, goal, max_keys);
            }
            Message::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Runs admitted work in arrival order. Finishing an execute releases its slot, which may
    /// admit more.
    fn dispatch(&mut self, admitted: Vec<(TxId, Work)>) {
        let mut ready: VecDeque<(TxId, Work)> = admitted.into();

        while let Some((txid, work)) = ready.pop_front() {
            match work {
                Work::Execute(task) => {
                    self.run_task(task);
                    ready.extend(self.scheduler.release(txid));
                }
                Work::Acquire(reply) => {
                    trace!(shard = self.db.shard(), txid, "Slot acquired");
                    // The caller went away before admission completed.
                    if reply.send(()).is_err() {
                        ready.extend(self.scheduler.release(txid));
                    }
                }
            }
        }
    }

    fn run_task(&mut self, task: Task) {
        let mut ctx = HopContext::new(
            &mut self.db,
            &self.scheduler,
            &self.eviction,
            self.keys_output_limit,
        );
        task(&mut ctx);
    }

    fn housekeeping(&mut self) {
        if self.eviction.under_pressure() {
            let goal = self.eviction.excess();
            self.eviction.evict(
                &mut self.db,
                &self.scheduler,
                goal,
                OPPORTUNISTIC_EVICTION_BATCH,
            );
        }
        self.db.prune_waiters(Instant::now());
    }

    fn stats(&self) -> ShardStats {
        ShardStats {
            shard: self.db.shard(),
            keys: self.db.len(),
            used_bytes: self.db.used_bytes(),
            queue_depth: self.scheduler.queue_depth(),
            active_slots: self.scheduler.active_len(),
            parked: self.db.parked(),
            scheduler: self.scheduler.stats(),
        }
    }
}

async fn expiration(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}
