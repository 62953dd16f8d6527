use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::blocking::WaiterId;
use crate::commands::bpop::{pair, BlockingPop};
use crate::commands::executable::Executable;
use crate::commands::Command;
use crate::db::{Key, Side};
use crate::frame::Frame;
use crate::router::{Router, ShardId};
use crate::shard::{HopContext, Message, ShardHandle, Task};
use crate::transaction::{Footprint, HopClass, Scope, SlotRequest, TxError, TxId};

/// Drives transactions over the shards. Single-shard commands are sent as one `Execute`
/// message, everything else acquires a slot on each shard in ascending shard order and then
/// runs its hops from a detached task, so an admitted transaction always runs to completion
/// even if its caller goes away.
#[derive(Debug)]
pub struct Coordinator {
    shards: Arc<[ShardHandle]>,
    router: Router,
    keys_output_limit: usize,
    next_txid: AtomicU64,
}

impl Coordinator {
    pub fn new(
        shards: Arc<[ShardHandle]>,
        router: Router,
        keys_output_limit: usize,
    ) -> Coordinator {
        Coordinator {
            shards,
            router,
            keys_output_limit,
            next_txid: AtomicU64::new(1),
        }
    }

    /// Transaction ids double as arrival sequence numbers for the schedulers.
    fn next_txid(&self) -> TxId {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    fn all_shards(&self) -> Vec<ShardId> {
        (0..self.shards.len()).collect()
    }

    fn shards_of(&self, keys: &[Key]) -> Vec<ShardId> {
        self.router.shards_of(keys.iter().map(|key| key.as_ref()))
    }

    pub async fn execute(&self, command: Command) -> Frame {
        match self.dispatch(command).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "Transaction failed");
                err.to_frame()
            }
        }
    }

    /// Runs `commands` as a single transaction holding a slot on every shard they touch.
    pub async fn execute_multi(&self, commands: Vec<Command>) -> Frame {
        match self.dispatch_multi(commands).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "Transaction failed");
                err.to_frame()
            }
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Frame, TxError> {
        if let Command::BlockingPop(cmd) = command {
            return self.blocking_pop(cmd).await;
        }

        let scope = command.scope();
        let shards = match &scope {
            Scope::None => return Ok(command.exec_local()),
            Scope::Keys(keys) => self.shards_of(keys),
            Scope::All => self.all_shards(),
        };
        let footprint = Footprint::from(scope);

        let txid = self.next_txid();
        if let &[shard] = shards.as_slice() {
            return self.run_single(txid, shard, footprint, command).await;
        }

        let class = if command.grows_memory() {
            HopClass::MultiHop
        } else {
            HopClass::SingleHop
        };
        let slots = self.acquire(txid, &shards, &footprint, class).await?;
        let keys_output_limit = self.keys_output_limit;

        detach(async move {
            let command = Arc::new(command);
            if command.grows_memory() {
                slots.prepare(&shards).await?;
            }
            let parts = slots.run_command(&shards, command.clone()).await?;
            Ok(command.merge(parts, keys_output_limit))
        })
        .await
    }

    async fn dispatch_multi(&self, commands: Vec<Command>) -> Result<Frame, TxError> {
        let footprint = commands
            .iter()
            .map(|command| Footprint::from(command.scope()))
            .fold(Footprint::keys(Vec::new()), Footprint::union);

        let shards = match &footprint {
            Footprint::Keys(keys) => self.router.shards_of(keys.iter().map(|key| key.as_ref())),
            Footprint::Dynamic => self.all_shards(),
        };

        if shards.is_empty() {
            let replies = commands.iter().map(Command::exec_local).collect();
            return Ok(Frame::Array(replies));
        }

        let txid = self.next_txid();
        let slots = self
            .acquire(txid, &shards, &footprint, HopClass::MultiHop)
            .await?;
        let router = self.router;
        let all_shards = self.all_shards();
        let keys_output_limit = self.keys_output_limit;

        detach(async move {
            if commands.iter().any(Command::grows_memory) {
                slots.prepare(&shards).await?;
            }

            let mut replies = Vec::with_capacity(commands.len());
            for command in commands {
                let command_shards = match command.scope() {
                    Scope::None => {
                        replies.push(command.exec_local());
                        continue;
                    }
                    Scope::Keys(keys) => router.shards_of(keys.iter().map(|key| key.as_ref())),
                    Scope::All => all_shards.clone(),
                };

                let reply = match command {
                    Command::BlockingPop(cmd) => slots
                        .pop_first(&command_shards, Arc::new(cmd.keys), cmd.side)
                        .await?
                        .unwrap_or(Frame::NullArray),
                    command => {
                        let command = Arc::new(command);
                        let parts = slots.run_command(&command_shards, command.clone()).await?;
                        command.merge(parts, keys_output_limit)
                    }
                };
                replies.push(reply);
            }

            Ok(Frame::Array(replies))
        })
        .await
    }

    /// Single-shard fast path: admission and execution in one message.
    async fn run_single(
        &self,
        txid: TxId,
        shard: ShardId,
        footprint: Footprint,
        command: Command,
    ) -> Result<Frame, TxError> {
        let (tx, rx) = oneshot::channel();
        let request = SlotRequest::new(txid, footprint, HopClass::SingleHop);
        let task: Task = Box::new(move |ctx: &mut HopContext<'_>| {
            let _ = tx.send(command.apply(ctx));
        });

        self.shards[shard].send(Message::Execute { request, task })?;

        let mut guard = CancelOnDrop {
            shard: &self.shards[shard],
            txid,
            armed: true,
        };
        let frame = rx.await.map_err(|_| TxError::ShardUnavailable(shard));
        guard.armed = false;

        frame
    }

    /// Acquires a slot on each shard in ascending order. Dropping the returned future before it
    /// completes cancels the pending request and releases the slots already held.
    async fn acquire(
        &self,
        txid: TxId,
        shards: &[ShardId],
        footprint: &Footprint,
        class: HopClass,
    ) -> Result<Slots, TxError> {
        let mut slots = Slots {
            txid,
            shards: self.shards.clone(),
            held: Vec::with_capacity(shards.len()),
            pending: None,
        };

        for &shard in shards {
            let (reply, admitted) = oneshot::channel();
            let request = SlotRequest::new(txid, footprint.restrict(&self.router, shard), class);

            slots.pending = Some(shard);
            self.shards[shard].send(Message::Acquire { request, reply })?;
            admitted
                .await
                .map_err(|_| TxError::ShardUnavailable(shard))?;
            slots.pending = None;
            slots.held.push(shard);
        }

        trace!(txid, shards = ?slots.held, "Slots acquired");
        Ok(slots)
    }

    /// BLPOP / BRPOP. Each attempt acquires the shards of all keys, pops the first non-empty
    /// list in key order or parks on every shard, then waits for a push or the deadline.
    async fn blocking_pop(&self, cmd: BlockingPop) -> Result<Frame, TxError> {
        // Zero, or a timeout past the clock's range, blocks forever.
        let deadline = if cmd.timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(cmd.timeout)
        };
        let shards = self.shards_of(&cmd.keys);
        let footprint = Footprint::keys(cmd.keys.iter().cloned());
        let side = cmd.side;
        let keys = Arc::new(cmd.keys);
        let waker = Arc::new(Notify::new());

        loop {
            let txid = self.next_txid();
            let acquired = match deadline {
                Some(deadline) => time::timeout_at(
                    deadline,
                    self.acquire(txid, &shards, &footprint, HopClass::MultiHop),
                )
                .await
                .unwrap_or(Err(TxError::AdmissionTimeout)),
                None => {
                    self.acquire(txid, &shards, &footprint, HopClass::MultiHop)
                        .await
                }
            };

            let slots = match acquired {
                Ok(slots) => slots,
                Err(TxError::AdmissionTimeout) => return Ok(Frame::NullArray),
                Err(err) => return Err(err),
            };

            let outcome = {
                let shards = shards.clone();
                let keys = keys.clone();
                let waker = waker.clone();
                detach(async move {
                    slots
                        .pop_or_park(&shards, keys, side, waker, deadline)
                        .await
                })
                .await?
            };

            let parking = match outcome {
                PopOutcome::Popped(frame) => return Ok(frame),
                PopOutcome::Parked(parking) => parking,
            };

            let woken = match deadline {
                Some(deadline) => tokio::select! {
                    _ = waker.notified() => true,
                    _ = time::sleep_until(deadline) => false,
                },
                None => {
                    waker.notified().await;
                    true
                }
            };
            drop(parking);

            if !woken {
                return Ok(Frame::NullArray);
            }
            trace!(waiter = txid, "Blocked client woken up");
        }
    }
}

/// Runs an admitted transaction body on its own task.
async fn detach<T, F>(future: F) -> Result<T, TxError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, TxError>> + Send + 'static,
{
    tokio::spawn(future)
        .await
        .map_err(|err| TxError::DriverFailed(err.to_string()))?
}

/// Cancels a single-shard request whose caller went away before it ran.
struct CancelOnDrop<'a> {
    shard: &'a ShardHandle,
    txid: TxId,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.shard.send(Message::Cancel { txid: self.txid });
        }
    }
}

enum PopOutcome {
    Popped(Frame),
    Parked(Parking),
}

/// A client parked on some shards. Dropping it unparks the waiter everywhere.
struct Parking {
    waiter: WaiterId,
    shards: Arc<[ShardHandle]>,
    participants: Vec<ShardId>,
}

impl Drop for Parking {
    fn drop(&mut self) {
        for &shard in &self.participants {
            let _ = self.shards[shard].send(Message::Unpark {
                waiter: self.waiter,
            });
        }
    }
}

/// Slots held by one transaction. Dropping it releases every held slot and cancels the
/// request still waiting for admission, if any.
struct Slots {
    txid: TxId,
    shards: Arc<[ShardHandle]>,
    held: Vec<ShardId>,
    pending: Option<ShardId>,
}

impl Slots {
    /// Runs `f` on `shard` under this transaction's slot.
    async fn hop_on<R, F>(&self, shard: ShardId, f: F) -> Result<R, TxError>
    where
        R: Send + 'static,
        F: FnOnce(&mut HopContext<'_>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move |ctx: &mut HopContext<'_>| {
            let _ = tx.send(f(ctx));
        });

        self.shards[shard].send(Message::Hop {
            txid: self.txid,
            task,
        })?;

        rx.await
            .map_err(|_| TxError::SlotNotHeld { txid: self.txid })
    }

    /// Runs `f` concurrently on every shard in `shards`, results in the same order.
    async fn hop_all<R, F>(&self, shards: &[ShardId], f: F) -> Result<Vec<R>, TxError>
    where
        R: Send + 'static,
        F: Fn(&mut HopContext<'_>) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);

        let hops = shards.iter().map(|&shard| {
            let f = f.clone();
            async move {
                self.hop_on(shard, move |ctx: &mut HopContext<'_>| (*f)(ctx))
                    .await
                    .map_err(|cause| TxError::CrossShardAbort {
                        shard,
                        cause: Box::new(cause),
                    })
            }
        });

        join_all(hops).await.into_iter().collect()
    }

    /// Prepare hop of an atomic write: every shard has to pass its write gate before anything
    /// is written.
    async fn prepare(&self, shards: &[ShardId]) -> Result<(), TxError> {
        let results = self
            .hop_all(shards, |ctx: &mut HopContext<'_>| ctx.admit_write())
            .await?;

        for (&shard, result) in shards.iter().zip(results) {
            result.map_err(|cause| TxError::CrossShardAbort {
                shard,
                cause: Box::new(cause),
            })?;
        }

        Ok(())
    }

    async fn run_command(
        &self,
        shards: &[ShardId],
        command: Arc<Command>,
    ) -> Result<Vec<Frame>, TxError> {
        self.hop_all(shards, move |ctx: &mut HopContext<'_>| command.exec(ctx))
            .await
    }

    /// Pops from the first non-empty list among `keys`, in key order across all shards.
    async fn pop_first(
        &self,
        shards: &[ShardId],
        keys: Arc<Vec<Key>>,
        side: Side,
    ) -> Result<Option<Frame>, TxError> {
        let probes = {
            let keys = keys.clone();
            self.hop_all(shards, move |ctx: &mut HopContext<'_>| probe(ctx, &keys))
                .await?
        };

        let mut found: Vec<(usize, ShardId, usize)> = Vec::new();
        for (&shard, probe) in shards.iter().zip(probes) {
            for (index, len) in probe {
                match len {
                    Ok(len) => found.push((index, shard, len)),
                    Err(err) => return Ok(Some(Frame::Error(err.to_string()))),
                }
            }
        }
        found.sort_unstable();

        for (index, shard, len) in found {
            if len == 0 {
                continue;
            }

            let key = keys[index].clone();
            let popped = {
                let key = key.clone();
                self.hop_on(shard, move |ctx: &mut HopContext<'_>| ctx.db.pop(&key, side, 1))
                    .await?
            };

            match popped {
                Ok(values) => {
                    if let Some(value) = values.into_iter().next() {
                        return Ok(Some(pair(key, value)));
                    }
                }
                Err(err) => return Ok(Some(Frame::Error(err.to_string()))),
            }
        }

        Ok(None)
    }

    /// Pops like [`Slots::pop_first`], or parks the transaction on every shard when all
    /// lists are empty. Both happen under the same slots, so no push can slip in between.
    async fn pop_or_park(
        &self,
        shards: &[ShardId],
        keys: Arc<Vec<Key>>,
        side: Side,
        waker: Arc<Notify>,
        deadline: Option<Instant>,
    ) -> Result<PopOutcome, TxError> {
        if let Some(frame) = self.pop_first(shards, keys.clone(), side).await? {
            return Ok(PopOutcome::Popped(frame));
        }

        let waiter = self.txid;
        // Unparks on every shard if parking fails halfway.
        let parking = Parking {
            waiter,
            shards: self.shards.clone(),
            participants: shards.to_vec(),
        };

        self.hop_all(shards, move |ctx: &mut HopContext<'_>| {
            let owned: Vec<Key> = keys
                .iter()
                .filter(|key| ctx.db.owns(key))
                .cloned()
                .collect();
            ctx.db.park(waiter, owned, waker.clone(), deadline);
        })
        .await?;

        trace!(waiter, "Client parked");
        Ok(PopOutcome::Parked(parking))
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        if let Some(shard) = self.pending.take() {
            let _ = self.shards[shard].send(Message::Cancel { txid: self.txid });
        }
        for &shard in &self.held {
            let _ = self.shards[shard].send(Message::Release { txid: self.txid });
        }
    }
}

/// Length of every list among `keys` this shard owns, with the key's index.
fn probe(
    ctx: &mut HopContext<'_>,
    keys: &[Key],
) -> Vec<(usize, Result<usize, crate::db::WrongType>)> {
    let mut lens = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        if ctx.db.owns(key) {
            lens.push((index, ctx.db.list_len(key)));
        }
    }
    lens
}
