use std::collections::{HashMap, VecDeque};

use crate::transaction::{Footprint, SlotRequest, TxId};

/// Tells eviction which keys are in use by admitted transactions.
pub trait KeyLocks {
    fn is_locked(&self, key: &[u8]) -> bool;
}

/// No key is ever locked, for code paths that run outside a scheduler.
pub struct NoLocks;

impl KeyLocks for NoLocks {
    fn is_locked(&self, _key: &[u8]) -> bool {
        false
    }
}

#[derive(Debug, PartialEq)]
pub enum Admission<T> {
    /// The slot is active, the payload goes back to the caller to run.
    Admitted(T),
    /// The payload waits in the queue until a release admits it.
    Queued,
}

#[derive(Debug, PartialEq)]
pub enum Cancelled<T> {
    /// It was still waiting. Removing it may have let later requests through.
    Queued { payload: T, admitted: Vec<(TxId, T)> },
    /// It was active and has been released like a regular release.
    Released(Vec<(TxId, T)>),
    Unknown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub admitted: u64,
    /// Admissions that went ahead of earlier, still queued, requests.
    pub out_of_order: u64,
    pub queued: u64,
    pub cancelled: u64,
}

#[derive(Debug)]
struct Pending<T> {
    request: SlotRequest,
    payload: T,
}

/// Per-shard admission control.
///
/// A request is admitted as soon as its footprint intersects neither an active slot nor a
/// request that arrived before it and is still queued. Disjoint work therefore runs out of order
/// while conflicting work keeps its arrival order. Queued requests are kept sorted by sequence
/// number and are never reordered by size or priority.
#[derive(Debug)]
pub struct Scheduler<T> {
    active: HashMap<TxId, SlotRequest>,
    queue: VecDeque<Pending<T>>,
    stats: SchedulerStats,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Scheduler<T> {
        Scheduler {
            active: HashMap::new(),
            queue: VecDeque::new(),
            stats: SchedulerStats::default(),
        }
    }

    pub fn schedule(&mut self, request: SlotRequest, payload: T) -> Admission<T> {
        let position = self.queue.partition_point(|p| p.request.seq < request.seq);

        if self.admissible(&request.footprint, position) {
            self.activate(request, position > 0);
            Admission::Admitted(payload)
        } else {
            self.stats.queued += 1;
            self.queue.insert(position, Pending { request, payload });
            Admission::Queued
        }
    }

    /// Releases an active slot and returns the queued payloads that became admissible, in
    /// arrival order. Unknown or already released ids are ignored.
    pub fn release(&mut self, txid: TxId) -> Vec<(TxId, T)> {
        if self.active.remove(&txid).is_none() {
            return Vec::new();
        }
        self.promote()
    }

    pub fn cancel(&mut self, txid: TxId) -> Cancelled<T> {
        if let Some(position) = self.queue.iter().position(|p| p.request.seq == txid) {
            if let Some(pending) = self.queue.remove(position) {
                self.stats.cancelled += 1;
                return Cancelled::Queued {
                    payload: pending.payload,
                    admitted: self.promote(),
                };
            }
        }

        if self.active.contains_key(&txid) {
            return Cancelled::Released(self.release(txid));
        }

        Cancelled::Unknown
    }

    /// Whether a request with this footprint, arriving now, would be admitted right away.
    pub fn would_admit(&self, footprint: &Footprint) -> bool {
        self.admissible(footprint, self.queue.len())
    }

    pub fn is_active(&self, txid: TxId) -> bool {
        self.active.contains_key(&txid)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    fn admissible(&self, footprint: &Footprint, earlier: usize) -> bool {
        let blocked_by_active = self
            .active
            .values()
            .any(|slot| slot.footprint.intersects(footprint));

        let blocked_by_queue = self
            .queue
            .iter()
            .take(earlier)
            .any(|p| p.request.footprint.intersects(footprint));

        !blocked_by_active && !blocked_by_queue
    }

    fn activate(&mut self, request: SlotRequest, out_of_order: bool) {
        self.stats.admitted += 1;
        if out_of_order {
            self.stats.out_of_order += 1;
        }
        self.active.insert(request.seq, request);
    }

    fn promote(&mut self) -> Vec<(TxId, T)> {
        let mut admitted = Vec::new();
        let mut index = 0;

        while index < self.queue.len() {
            if !self.admissible(&self.queue[index].request.footprint, index) {
                index += 1;
                continue;
            }

            if let Some(Pending { request, payload }) = self.queue.remove(index) {
                let seq = request.seq;
                self.activate(request, index > 0);
                admitted.push((seq, payload));
            }
        }

        admitted
    }
}

impl<T> KeyLocks for Scheduler<T> {
    /// Only explicit keys are locked. A dynamic footprint covers the whole shard, treating it as
    /// a lock would stop eviction for as long as a keyspace-wide command runs.
    fn is_locked(&self, key: &[u8]) -> bool {
        self.active.values().any(|slot| match &slot.footprint {
            Footprint::Keys(keys) => keys.contains(key),
            Footprint::Dynamic => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::HopClass;
    use bytes::Bytes;

    fn request(seq: TxId, keys: &[&'static str]) -> SlotRequest {
        SlotRequest::new(
            seq,
            Footprint::keys(keys.iter().map(|k| Bytes::from_static(k.as_bytes()))),
            HopClass::SingleHop,
        )
    }

    fn dynamic(seq: TxId) -> SlotRequest {
        SlotRequest::new(seq, Footprint::Dynamic, HopClass::MultiHop)
    }

    #[test]
    fn disjoint_requests_are_admitted_concurrently() {
        let mut scheduler = Scheduler::new();

        assert_eq!(scheduler.schedule(request(1, &["a"]), 1), Admission::Admitted(1));
        assert_eq!(scheduler.schedule(request(2, &["b"]), 2), Admission::Admitted(2));
        assert_eq!(scheduler.active_len(), 2);
        assert_eq!(scheduler.stats().out_of_order, 0);
    }

    #[test]
    fn conflicting_requests_queue_in_arrival_order() {
        let mut scheduler = Scheduler::new();

        assert_eq!(scheduler.schedule(request(1, &["a"]), 1), Admission::Admitted(1));
        assert_eq!(scheduler.schedule(request(2, &["a"]), 2), Admission::Queued);
        assert_eq!(scheduler.schedule(request(3, &["a"]), 3), Admission::Queued);

        assert_eq!(scheduler.release(1), vec![(2, 2)]);
        assert_eq!(scheduler.release(2), vec![(3, 3)]);
        assert_eq!(scheduler.release(3), vec![]);
        assert_eq!(scheduler.queue_depth(), 0);
    }

    #[test]
    fn disjoint_request_overtakes_queued_conflict() {
        let mut scheduler = Scheduler::new();

        scheduler.schedule(request(1, &["a"]), 1);
        assert_eq!(scheduler.schedule(request(2, &["a", "b"]), 2), Admission::Queued);
        assert_eq!(scheduler.schedule(request(3, &["c"]), 3), Admission::Admitted(3));

        let stats = scheduler.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.queued, 1);
    }

    #[test]
    fn later_request_never_overtakes_an_intersecting_earlier_one() {
        let mut scheduler = Scheduler::new();

        scheduler.schedule(request(1, &["a"]), 1);
        // Waits on "a", and holds back everyone after it that touches "b".
        assert_eq!(scheduler.schedule(request(2, &["a", "b"]), 2), Admission::Queued);
        assert_eq!(scheduler.schedule(request(3, &["b"]), 3), Admission::Queued);

        assert_eq!(scheduler.release(1), vec![(2, 2)]);
        assert!(!scheduler.is_active(3));
        assert_eq!(scheduler.release(2), vec![(3, 3)]);
    }

    #[test]
    fn release_admits_every_request_that_became_admissible() {
        let mut scheduler = Scheduler::new();

        scheduler.schedule(request(1, &["a", "b"]), 1);
        scheduler.schedule(request(2, &["a"]), 2);
        scheduler.schedule(request(3, &["b"]), 3);
        scheduler.schedule(request(4, &["a"]), 4);

        assert_eq!(scheduler.release(1), vec![(2, 2), (3, 3)]);
        assert_eq!(scheduler.queue_depth(), 1);
        assert!(scheduler.is_active(3));
        assert!(!scheduler.is_active(4));
    }

    #[test]
    fn dynamic_footprint_conflicts_with_everything() {
        let mut scheduler = Scheduler::new();

        assert_eq!(scheduler.schedule(dynamic(1), 1), Admission::Admitted(1));
        assert_eq!(scheduler.schedule(request(2, &["x"]), 2), Admission::Queued);
        assert!(!scheduler.is_locked(b"anything"));
        assert!(!scheduler.would_admit(&Footprint::keys(vec![Bytes::from("y")])));

        assert_eq!(scheduler.release(1), vec![(2, 2)]);
        assert!(scheduler.is_locked(b"x"));
        assert!(!scheduler.is_locked(b"y"));
    }

    #[test]
    fn would_admit_does_not_change_state() {
        let mut scheduler: Scheduler<()> = Scheduler::new();

        scheduler.schedule(request(1, &["a"]), ());
        let footprint = Footprint::keys(vec![Bytes::from("b")]);

        assert!(scheduler.would_admit(&footprint));
        assert!(scheduler.would_admit(&footprint));
        assert_eq!(scheduler.active_len(), 1);
        assert_eq!(scheduler.stats().admitted, 1);
    }

    #[test]
    fn cancel_removes_queued_and_releases_active() {
        let mut scheduler = Scheduler::new();

        scheduler.schedule(request(1, &["a"]), 1);
        scheduler.schedule(request(2, &["a", "b"]), 2);
        scheduler.schedule(request(3, &["b"]), 3);

        // Cancelling the queued request in the middle unblocks the one behind it.
        assert_eq!(
            scheduler.cancel(2),
            Cancelled::Queued {
                payload: 2,
                admitted: vec![(3, 3)]
            }
        );
        assert_eq!(scheduler.cancel(1), Cancelled::Released(vec![]));
        assert_eq!(scheduler.cancel(1), Cancelled::Unknown);
        assert_eq!(scheduler.stats().cancelled, 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mut scheduler = Scheduler::new();

        scheduler.schedule(request(1, &["a"]), 1);
        scheduler.schedule(request(2, &["a"]), 2);

        assert_eq!(scheduler.release(1), vec![(2, 2)]);
        assert_eq!(scheduler.release(1), vec![]);
        assert_eq!(scheduler.release(42), vec![]);
        assert!(scheduler.is_active(2));
    }
}
