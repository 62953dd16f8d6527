use bytes::{Bytes, BytesMut};
use num_traits::CheckedAdd;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::str::{self, FromStr};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::blocking::{Blocking, WaiterId};
use crate::memory::AccountedMemory;
use crate::router::{Router, ShardId};

pub type Key = Bytes;

/// Bytes charged per entry on top of its key and payload, for the map slot, the metadata and
/// the sampling index.
pub const ENTRY_OVERHEAD: usize = 48;
/// Bytes charged per list element on top of its payload.
const LIST_NODE_OVERHEAD: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Value::String(bytes) => bytes.len(),
            Value::List(list) => list.iter().map(|item| item.len() + LIST_NODE_OVERHEAD).sum(),
        }
    }
}

/// Access metadata used to score eviction candidates. `last_access` is a per-shard logical
/// clock, bumped on every access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub last_access: u64,
    pub hits: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: Key,
    pub access: Access,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
#[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
pub struct WrongType;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum IncrError {
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR increment or decrement would overflow")]
    Overflow,
    #[error(transparent)]
    WrongType(#[from] WrongType),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    access: Access,
    size: usize,
    // Position of the key in `Db::dense`.
    index: usize,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn entry_size(key_len: usize, value: &Value) -> usize {
    key_len + value.payload_len() + ENTRY_OVERHEAD
}

/// The keyspace owned by one shard. Only the shard task touches it, so it needs no locking.
///
/// Keys with a TTL are also kept in a set ordered by expiration, which the shard loop uses to
/// sleep until the next key expires. Expired keys are removed lazily on access too. Every size
/// change is mirrored into the process-wide [`AccountedMemory`].
#[derive(Debug)]
pub struct Db {
    shard: ShardId,
    router: Router,
    entries: HashMap<Key, Entry>,
    // Every key, densely packed, so eviction can sample uniformly in O(1).
    dense: Vec<Key>,
    ttls: BTreeSet<(Instant, Key)>,
    clock: u64,
    used_bytes: usize,
    memory: AccountedMemory,
    blocking: Blocking,
}

impl Db {
    pub fn new(shard: ShardId, router: Router, memory: AccountedMemory) -> Db {
        Db {
            shard,
            router,
            entries: HashMap::new(),
            dense: Vec::new(),
            ttls: BTreeSet::new(),
            clock: 0,
            used_bytes: 0,
            memory,
            blocking: Blocking::default(),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn owns(&self, key: &[u8]) -> bool {
        self.router.shard_of(key) == self.shard
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Returns the value and records the access.
    pub fn get(&mut self, key: &[u8]) -> Option<&Value> {
        self.expire_if_due(key);
        let clock = self.tick();

        let entry = self.entries.get_mut(key)?;
        touch(&mut entry.access, clock);
        Some(&entry.value)
    }

    pub fn get_string(&mut self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(WrongType),
        }
    }

    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.expire_if_due(key);
        self.entries.contains_key(key)
    }

    /// Stores `value`, replacing any previous value and TTL.
    pub fn set(&mut self, key: Key, value: Value, ttl: Option<Duration>) {
        // A TTL beyond the clock's range never elapses.
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        let clock = self.tick();
        let size = entry_size(key.len(), &value);

        match self.entries.get_mut(&key) {
            Some(entry) => {
                if let Some(previous) = entry.expires_at {
                    self.ttls.remove(&(previous, key.clone()));
                }
                let previous_size = entry.size;
                entry.value = value;
                entry.expires_at = expires_at;
                entry.size = size;
                touch(&mut entry.access, clock);
                self.account(previous_size, size);
            }
            None => {
                let index = self.dense.len();
                self.dense.push(key.clone());
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value,
                        expires_at,
                        access: Access {
                            last_access: clock,
                            hits: 1,
                        },
                        size,
                        index,
                    },
                );
                self.account(0, size);
            }
        }

        if let Some(at) = expires_at {
            self.ttls.insert((at, key));
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Value> {
        let entry = self.entries.remove(key)?;

        // Fill the hole with the last key and fix its index.
        let key = self.dense.swap_remove(entry.index);
        if let Some(moved) = self.dense.get(entry.index) {
            if let Some(moved) = self.entries.get_mut(moved) {
                moved.index = entry.index;
            }
        }

        if let Some(at) = entry.expires_at {
            self.ttls.remove(&(at, key));
        }

        self.account(entry.size, 0);
        Some(entry.value)
    }

    pub fn incr_by<T>(&mut self, key: &Key, delta: T) -> Result<T, IncrError>
    where
        T: CheckedAdd + FromStr + ToString + Default + Copy,
    {
        self.expire_if_due(key);

        let current = match self.entries.get(key).map(|entry| &entry.value) {
            None => T::default(),
            Some(Value::String(bytes)) => str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<T>().ok())
                .ok_or(IncrError::NotInteger)?,
            Some(Value::List(_)) => return Err(WrongType.into()),
        };

        let next = current.checked_add(&delta).ok_or(IncrError::Overflow)?;
        let encoded = Value::String(Bytes::from(next.to_string()));

        if self.entries.contains_key(key) {
            self.update(key, |value| *value = encoded);
        } else {
            self.set(key.clone(), encoded, None);
        }

        Ok(next)
    }

    /// Returns the length of the string after the append.
    pub fn append(&mut self, key: &Key, data: &[u8]) -> Result<usize, WrongType> {
        self.expire_if_due(key);

        match self.entries.get(key).map(|entry| &entry.value) {
            None => {
                self.set(key.clone(), Value::String(Bytes::copy_from_slice(data)), None);
                Ok(data.len())
            }
            Some(Value::List(_)) => Err(WrongType),
            Some(Value::String(_)) => {
                let len = self.update(key, |value| match value {
                    Value::String(current) => {
                        let mut buf = BytesMut::with_capacity(current.len() + data.len());
                        buf.extend_from_slice(current);
                        buf.extend_from_slice(data);
                        *current = buf.freeze();
                        current.len()
                    }
                    Value::List(_) => 0,
                });
                Ok(len.unwrap_or_default())
            }
        }
    }

    pub fn strlen(&mut self, key: &[u8]) -> Result<usize, WrongType> {
        match self.get(key) {
            None => Ok(0),
            Some(Value::String(bytes)) => Ok(bytes.len()),
            Some(_) => Err(WrongType),
        }
    }

    /// Pushes `values` one by one on `side` and wakes the clients blocked on `key`. Returns the
    /// length of the list after the push.
    pub fn push(&mut self, key: &Key, side: Side, values: Vec<Bytes>) -> Result<usize, WrongType> {
        self.expire_if_due(key);

        let len = match self.entries.get(key).map(|entry| &entry.value) {
            Some(Value::String(_)) => return Err(WrongType),
            Some(Value::List(_)) => self
                .update(key, |value| match value {
                    Value::List(list) => {
                        push_all(list, side, values);
                        list.len()
                    }
                    Value::String(_) => 0,
                })
                .unwrap_or_default(),
            None => {
                let mut list = VecDeque::with_capacity(values.len());
                push_all(&mut list, side, values);
                let len = list.len();
                self.set(key.clone(), Value::List(list), None);
                len
            }
        };

        self.blocking.wake(key);
        Ok(len)
    }

    /// Pops up to `count` elements from `side`. The key is removed once its list is empty.
    pub fn pop(&mut self, key: &[u8], side: Side, count: usize) -> Result<Vec<Bytes>, WrongType> {
        self.expire_if_due(key);

        match self.entries.get(key).map(|entry| &entry.value) {
            None => return Ok(Vec::new()),
            Some(Value::String(_)) => return Err(WrongType),
            Some(Value::List(_)) => {}
        }

        let (popped, empty) = self
            .update(key, |value| match value {
                Value::List(list) => {
                    let n = count.min(list.len());
                    let popped: Vec<Bytes> = (0..n)
                        .filter_map(|_| match side {
                            Side::Left => list.pop_front(),
                            Side::Right => list.pop_back(),
                        })
                        .collect();
                    (popped, list.is_empty())
                }
                Value::String(_) => (Vec::new(), false),
            })
            .unwrap_or_default();

        if empty {
            self.remove(key);
        }

        Ok(popped)
    }

    pub fn list_len(&mut self, key: &[u8]) -> Result<usize, WrongType> {
        match self.get(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(WrongType),
        }
    }

    /// Elements between `start` and `stop`, both inclusive. Negative indexes count from the end.
    pub fn range(&mut self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>, WrongType> {
        let list = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::List(list)) => list,
            Some(_) => return Err(WrongType),
        };

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .range(start as usize..=stop as usize)
            .cloned()
            .collect())
    }

    pub fn value_type(&mut self, key: &[u8]) -> Option<&'static str> {
        self.get(key).map(Value::type_name)
    }

    /// `None` when the key does not exist, `Some(None)` when it exists without a TTL.
    pub fn ttl(&mut self, key: &[u8]) -> Option<Option<Duration>> {
        self.expire_if_due(key);
        let now = Instant::now();

        self.entries.get(key).map(|entry| {
            entry
                .expires_at
                .map(|at| at.saturating_duration_since(now))
        })
    }

    /// Sets a TTL on an existing key. Returns false when the key does not exist.
    pub fn expire(&mut self, key: &[u8], ttl: Duration) -> bool {
        self.expire_if_due(key);

        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };

        let at = Instant::now().checked_add(ttl);
        let owned = self.dense[entry.index].clone();
        if let Some(previous) = std::mem::replace(&mut entry.expires_at, at) {
            self.ttls.remove(&(previous, owned.clone()));
        }
        if let Some(at) = at {
            self.ttls.insert((at, owned));
        }

        true
    }

    /// Removes every key whose TTL elapsed and returns how many were removed.
    pub fn remove_expired(&mut self) -> usize {
        let now = Instant::now();

        let expired: Vec<Key> = self
            .ttls
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .map(|(_, key)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }

        expired.len()
    }

    pub fn next_expiration(&self) -> Option<Instant> {
        self.ttls.first().map(|(expires_at, _)| *expires_at)
    }

    /// Live keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(move |(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key)
    }

    /// Removes every key and returns how many there were.
    pub fn flush(&mut self) -> usize {
        let removed = self.entries.len();

        self.entries.clear();
        self.dense.clear();
        self.ttls.clear();
        self.memory.sub(self.used_bytes as u64);
        self.used_bytes = 0;

        removed
    }

    /// Up to `n` distinct keys picked uniformly at random.
    pub fn sample(&self, n: usize) -> Vec<Candidate> {
        let len = self.dense.len();
        let indices: Vec<usize> = if n >= len {
            (0..len).collect()
        } else {
            rand::seq::index::sample(&mut rand::thread_rng(), len, n).into_vec()
        };

        indices
            .into_iter()
            .filter_map(|index| {
                let key = &self.dense[index];
                self.entries.get(key).map(|entry| Candidate {
                    key: key.clone(),
                    access: entry.access,
                    size: entry.size,
                })
            })
            .collect()
    }

    /// Removes `key` and returns the bytes it accounted for.
    pub fn evict(&mut self, key: &[u8]) -> Option<usize> {
        let size = self.entries.get(key)?.size;
        self.remove(key);
        Some(size)
    }

    pub fn park(
        &mut self,
        waiter: WaiterId,
        keys: Vec<Key>,
        waker: Arc<Notify>,
        deadline: Option<Instant>,
    ) {
        self.blocking.park(waiter, keys, waker, deadline);
    }

    pub fn unpark(&mut self, waiter: WaiterId) -> bool {
        self.blocking.unpark(waiter)
    }

    pub fn parked(&self) -> usize {
        self.blocking.len()
    }

    pub fn prune_waiters(&mut self, now: Instant) -> usize {
        if self.blocking.is_empty() {
            return 0;
        }
        self.blocking.prune(now)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn expire_if_due(&mut self, key: &[u8]) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.remove(key);
        }
    }

    /// Applies `f` to an existing value, keeping its TTL, and re-accounts its size.
    fn update<R>(&mut self, key: &[u8], f: impl FnOnce(&mut Value) -> R) -> Option<R> {
        let clock = self.tick();
        let entry = self.entries.get_mut(key)?;

        let result = f(&mut entry.value);
        let previous = entry.size;
        entry.size = entry_size(key.len(), &entry.value);
        touch(&mut entry.access, clock);

        let current = entry.size;
        self.account(previous, current);
        Some(result)
    }

    fn account(&mut self, previous: usize, current: usize) {
        if current >= previous {
            let delta = current - previous;
            self.used_bytes += delta;
            self.memory.add(delta as u64);
        } else {
            let delta = previous - current;
            self.used_bytes -= delta;
            self.memory.sub(delta as u64);
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.memory.sub(self.used_bytes as u64);
    }
}

fn touch(access: &mut Access, clock: u64) {
    access.last_access = clock;
    access.hits = access.hits.saturating_add(1);
}

fn push_all(list: &mut VecDeque<Bytes>, side: Side, values: Vec<Bytes>) {
    for value in values {
        match side {
            Side::Left => list.push_front(value),
            Side::Right => list.push_back(value),
        }
    }
}
