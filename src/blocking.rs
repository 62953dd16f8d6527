use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::db::Key;

pub type WaiterId = u64;

#[derive(Debug)]
struct Parked {
    keys: Vec<Key>,
    waker: Arc<Notify>,
    deadline: Option<Instant>,
}

/// Clients suspended in BLPOP/BRPOP on one shard, indexed by the keys they watch.
#[derive(Debug, Default)]
pub struct Blocking {
    waiters: HashMap<WaiterId, Parked>,
    by_key: HashMap<Key, Vec<WaiterId>>,
}

impl Blocking {
    pub fn park(
        &mut self,
        id: WaiterId,
        keys: Vec<Key>,
        waker: Arc<Notify>,
        deadline: Option<Instant>,
    ) {
        self.unpark(id);

        for key in &keys {
            self.by_key.entry(key.clone()).or_default().push(id);
        }
        self.waiters.insert(
            id,
            Parked {
                keys,
                waker,
                deadline,
            },
        );
    }

    pub fn unpark(&mut self, id: WaiterId) -> bool {
        match self.waiters.remove(&id) {
            Some(parked) => {
                self.forget(id, &parked.keys);
                true
            }
            None => false,
        }
    }

    /// Notifies every waiter watching `key`. The permit is stored when the waiter is not polling
    /// yet, so a push that lands before the waiter awaits is not lost.
    pub fn wake(&self, key: &[u8]) -> usize {
        let Some(ids) = self.by_key.get(key) else {
            return 0;
        };

        ids.iter()
            .filter_map(|id| self.waiters.get(id))
            .map(|parked| parked.waker.notify_one())
            .count()
    }

    /// Drops waiters whose deadline passed without them unparking, e.g. because their client went
    /// away before the unpark message could be sent.
    pub fn prune(&mut self, now: Instant) -> usize {
        let expired: Vec<WaiterId> = self
            .waiters
            .iter()
            .filter(|(_, parked)| parked.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.unpark(*id);
        }

        expired.len()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn forget(&mut self, id: WaiterId, keys: &[Key]) {
        for key in keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                if let Some(position) = ids.iter().position(|waiter| *waiter == id) {
                    ids.remove(position);
                }
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::time::Duration;

    #[tokio::test]
    async fn wake_notifies_waiters_of_the_key() {
        let mut blocking = Blocking::default();
        let first = Arc::new(Notify::new());
        let second = Arc::new(Notify::new());

        blocking.park(1, vec![Bytes::from("a"), Bytes::from("b")], first.clone(), None);
        blocking.park(2, vec![Bytes::from("b")], second.clone(), None);

        assert_eq!(blocking.wake(b"a"), 1);
        assert_eq!(blocking.wake(b"b"), 2);
        assert_eq!(blocking.wake(b"c"), 0);

        // Permits were stored, so these complete immediately.
        first.notified().await;
        second.notified().await;
    }

    #[test]
    fn unpark_forgets_every_key() {
        let mut blocking = Blocking::default();

        blocking.park(
            7,
            vec![Bytes::from("a"), Bytes::from("b")],
            Arc::new(Notify::new()),
            None,
        );

        assert!(blocking.unpark(7));
        assert!(!blocking.unpark(7));
        assert_eq!(blocking.wake(b"a"), 0);
        assert!(blocking.is_empty());
        assert!(blocking.by_key.is_empty());
    }

    #[test]
    fn prune_drops_waiters_past_their_deadline() {
        let mut blocking = Blocking::default();
        let now = Instant::now();

        blocking.park(
            1,
            vec![Bytes::from("a")],
            Arc::new(Notify::new()),
            Some(now + Duration::from_secs(1)),
        );
        blocking.park(2, vec![Bytes::from("a")], Arc::new(Notify::new()), None);

        assert_eq!(blocking.prune(now), 0);
        assert_eq!(blocking.prune(now + Duration::from_secs(2)), 1);
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking.wake(b"a"), 1);
    }
}
