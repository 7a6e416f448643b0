//! In-process [`LogStore`].
//!
//! Keys hold either a stream or a list, never both. Each stream keeps its
//! entries in id order plus, per consumer group, the last-delivered cursor and
//! an explicit pending map from entry id to [`Delivery`] metadata. That map is
//! what makes redelivery work: an entry stays in it, owned by the consumer it
//! was last delivered to, until it is acknowledged.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::Trim;
use crate::message::EntryId;
use crate::store::{Entry, LogStore, ReadCursor, StartPosition};
use crate::{Error, Result};

/// Delivery bookkeeping for one pending entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Group member currently responsible for the entry.
    pub consumer: String,
    pub delivery_count: u64,
    pub delivered_at_ms: u64,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Delivery>,
}

#[derive(Default)]
struct StreamLog {
    entries: BTreeMap<EntryId, Vec<u8>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

enum Value {
    Stream(StreamLog),
    List(VecDeque<Vec<u8>>),
}

pub struct MemoryStore<C: Clock = SystemClock> {
    keys: Mutex<HashMap<String, Value>>,
    appended: Notify,
    clock: C,
}

impl MemoryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            clock,
        }
    }

    /// Snapshot of a group's pending entries in id order.
    pub fn pending(&self, topic: &str, group: &str) -> Result<Vec<(EntryId, Delivery)>> {
        let mut keys = self.lock()?;
        let group = group_mut(&mut keys, topic, group)?;
        Ok(group
            .pending
            .iter()
            .map(|(id, delivery)| (*id, delivery.clone()))
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Value>>> {
        self.keys
            .lock()
            .map_err(|_| Error::Protocol("memory store lock poisoned".into()))
    }

    fn read_now(
        &self,
        topic: &str,
        group_name: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<Entry>> {
        let now_ms = self.clock.now_ms();
        let mut keys = self.lock()?;
        let log = match keys.get_mut(topic) {
            Some(Value::Stream(log)) => log,
            Some(Value::List(_)) => return Err(Error::WrongType(topic.to_string())),
            None => return Err(no_group(topic, group_name)),
        };
        let group = log
            .groups
            .get_mut(group_name)
            .ok_or_else(|| no_group(topic, group_name))?;

        let mut batch = Vec::new();
        match cursor {
            ReadCursor::New => {
                let range = (Bound::Excluded(group.last_delivered), Bound::Unbounded);
                for (id, body) in log.entries.range(range).take(count) {
                    group.pending.insert(
                        *id,
                        Delivery {
                            consumer: consumer.to_string(),
                            delivery_count: 1,
                            delivered_at_ms: now_ms,
                        },
                    );
                    group.last_delivered = *id;
                    batch.push(Entry {
                        id: *id,
                        body: Some(body.clone()),
                    });
                }
            }
            ReadCursor::Pending => {
                let owned = group
                    .pending
                    .iter_mut()
                    .filter(|(_, delivery)| delivery.consumer == consumer)
                    .take(count);
                for (id, delivery) in owned {
                    delivery.delivery_count += 1;
                    delivery.delivered_at_ms = now_ms;
                    batch.push(Entry {
                        id: *id,
                        body: log.entries.get(id).cloned(),
                    });
                }
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl<C: Clock> LogStore for MemoryStore<C> {
    async fn append(&self, topic: &str, body: &[u8], trim: Option<Trim>) -> Result<EntryId> {
        let now_ms = self.clock.now_ms();
        let id = {
            let mut keys = self.lock()?;
            let log = stream_entry(&mut keys, topic)?;
            let id = EntryId::next_after(log.last_id, now_ms);
            log.entries.insert(id, body.to_vec());
            log.last_id = id;
            if let Some(trim) = trim {
                // Exact trimming also satisfies an approximate request.
                while log.entries.len() > trim.max_len {
                    log.entries.pop_first();
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, topic: &str, group: &str, start: StartPosition) -> Result<()> {
        let mut keys = self.lock()?;
        let log = stream_entry(&mut keys, topic)?;
        if log.groups.contains_key(group) {
            return Ok(());
        }
        let last_delivered = match start {
            StartPosition::Origin => EntryId::MIN,
            StartPosition::Tail => log.last_id,
            StartPosition::After(id) => id,
        };
        log.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Entry>> {
        let deadline = match (cursor, block) {
            (ReadCursor::New, Some(block)) => Some(Instant::now() + block),
            _ => None,
        };
        loop {
            // Register interest before looking so an append between the read
            // and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_now(topic, group, consumer, cursor, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, topic: &str, group: &str, id: EntryId) -> Result<()> {
        let mut keys = self.lock()?;
        match keys.get_mut(topic) {
            Some(Value::Stream(log)) => {
                if let Some(group) = log.groups.get_mut(group) {
                    group.pending.remove(&id);
                }
                Ok(())
            }
            Some(Value::List(_)) => Err(Error::WrongType(topic.to_string())),
            None => Ok(()),
        }
    }

    async fn claim_idle(
        &self,
        topic: &str,
        group_name: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<usize> {
        let now_ms = self.clock.now_ms();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        let mut keys = self.lock()?;
        let log = match keys.get_mut(topic) {
            Some(Value::Stream(log)) => log,
            Some(Value::List(_)) => return Err(Error::WrongType(topic.to_string())),
            None => return Err(no_group(topic, group_name)),
        };
        let group = log
            .groups
            .get_mut(group_name)
            .ok_or_else(|| no_group(topic, group_name))?;

        let idle: Vec<EntryId> = group
            .pending
            .iter()
            .filter(|(_, delivery)| now_ms.saturating_sub(delivery.delivered_at_ms) >= min_idle_ms)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut claimed = 0;
        for id in idle {
            if !log.entries.contains_key(&id) {
                // Payload already trimmed; nothing left to redeliver.
                group.pending.remove(&id);
                continue;
            }
            if let Some(delivery) = group.pending.get_mut(&id) {
                delivery.consumer = consumer.to_string();
                delivery.delivered_at_ms = now_ms;
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize> {
        let mut keys = self.lock()?;
        Ok(group_mut(&mut keys, topic, group)?.pending.len())
    }

    async fn stream_len(&self, topic: &str) -> Result<usize> {
        let keys = self.lock()?;
        match keys.get(topic) {
            Some(Value::Stream(log)) => Ok(log.entries.len()),
            Some(Value::List(_)) => Err(Error::WrongType(topic.to_string())),
            None => Ok(0),
        }
    }

    async fn push_left(&self, topic: &str, body: &[u8]) -> Result<()> {
        let mut keys = self.lock()?;
        let value = keys
            .entry(topic.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match value {
            Value::List(list) => {
                list.push_front(body.to_vec());
                Ok(())
            }
            Value::Stream(_) => Err(Error::WrongType(topic.to_string())),
        }
    }

    async fn peek_last(&self, topic: &str) -> Result<Option<Vec<u8>>> {
        let keys = self.lock()?;
        match keys.get(topic) {
            Some(Value::List(list)) => Ok(list.back().cloned()),
            Some(Value::Stream(_)) => Err(Error::WrongType(topic.to_string())),
            None => Ok(None),
        }
    }

    async fn pop_right(&self, topic: &str) -> Result<()> {
        let mut keys = self.lock()?;
        let emptied = match keys.get_mut(topic) {
            Some(Value::List(list)) => {
                list.pop_back();
                list.is_empty()
            }
            Some(Value::Stream(_)) => return Err(Error::WrongType(topic.to_string())),
            None => false,
        };
        // Lists do not outlive their last element.
        if emptied {
            keys.remove(topic);
        }
        Ok(())
    }

    async fn list_len(&self, topic: &str) -> Result<usize> {
        let keys = self.lock()?;
        match keys.get(topic) {
            Some(Value::List(list)) => Ok(list.len()),
            Some(Value::Stream(_)) => Err(Error::WrongType(topic.to_string())),
            None => Ok(0),
        }
    }
}

fn no_group(topic: &str, group: &str) -> Error {
    Error::NoGroup {
        topic: topic.to_string(),
        group: group.to_string(),
    }
}

fn stream_entry<'a>(
    keys: &'a mut HashMap<String, Value>,
    topic: &str,
) -> Result<&'a mut StreamLog> {
    let value = keys
        .entry(topic.to_string())
        .or_insert_with(|| Value::Stream(StreamLog::default()));
    match value {
        Value::Stream(log) => Ok(log),
        Value::List(_) => Err(Error::WrongType(topic.to_string())),
    }
}

fn group_mut<'a>(
    keys: &'a mut HashMap<String, Value>,
    topic: &str,
    group: &str,
) -> Result<&'a mut GroupState> {
    match keys.get_mut(topic) {
        Some(Value::Stream(log)) => log.groups.get_mut(group).ok_or_else(|| no_group(topic, group)),
        Some(Value::List(_)) => Err(Error::WrongType(topic.to_string())),
        None => Err(no_group(topic, group)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MS: u64 = 1_000_000;

    fn bodies(batch: &[Entry]) -> Vec<&[u8]> {
        batch.iter().map(|e| e.body.as_deref().unwrap()).collect()
    }

    #[tokio::test]
    async fn ids_increase_within_a_millisecond() {
        let store = MemoryStore::with_clock(ManualClock::new(10 * MS));
        let a = store.append("t", b"a", None).await.unwrap();
        let b = store.append("t", b"b", None).await.unwrap();
        assert_eq!(a, EntryId::new(10, 0));
        assert_eq!(b, EntryId::new(10, 1));
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let store = MemoryStore::new();
        store.append("t", b"a", None).await.unwrap();
        store
            .ensure_group("t", "g", StartPosition::Origin)
            .await
            .unwrap();
        let first = store
            .read_group("t", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Re-creating must not reset the cursor back to the origin.
        store
            .ensure_group("t", "g", StartPosition::Origin)
            .await
            .unwrap();
        let again = store
            .read_group("t", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn ensure_group_creates_missing_topic() {
        let store = MemoryStore::new();
        store
            .ensure_group("fresh", "g", StartPosition::Tail)
            .await
            .unwrap();
        assert_eq!(store.stream_len("fresh").await.unwrap(), 0);
        assert_eq!(store.pending_count("fresh", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tail_group_skips_existing_entries() {
        let store = MemoryStore::new();
        store.append("t", b"old", None).await.unwrap();
        store
            .ensure_group("t", "g", StartPosition::Tail)
            .await
            .unwrap();
        store.append("t", b"new", None).await.unwrap();
        let batch = store
            .read_group("t", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(bodies(&batch), vec![b"new".as_slice()]);
    }

    #[tokio::test]
    async fn after_position_starts_past_the_given_id() {
        let store = MemoryStore::with_clock(ManualClock::new(MS));
        let first = store.append("t", b"a", None).await.unwrap();
        store.append("t", b"b", None).await.unwrap();
        store
            .ensure_group("t", "g", StartPosition::After(first))
            .await
            .unwrap();
        let batch = store
            .read_group("t", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(bodies(&batch), vec![b"b".as_slice()]);
    }

    #[tokio::test]
    async fn pending_read_returns_only_own_entries() {
        let store = MemoryStore::new();
        store
            .ensure_group("t", "g", StartPosition::Origin)
            .await
            .unwrap();
        store.append("t", b"a", None).await.unwrap();
        store.append("t", b"b", None).await.unwrap();

        let a = store
            .read_group("t", "g", "c1", ReadCursor::New, 1, None)
            .await
            .unwrap();
        let b = store
            .read_group("t", "g", "c2", ReadCursor::New, 1, None)
            .await
            .unwrap();
        assert_eq!(bodies(&a), vec![b"a".as_slice()]);
        assert_eq!(bodies(&b), vec![b"b".as_slice()]);

        let redelivered = store
            .read_group("t", "g", "c1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(redelivered, a);

        let pending = store.pending("t", "g").unwrap();
        assert_eq!(pending[0].1.consumer, "c1");
        assert_eq!(pending[0].1.delivery_count, 2);
        assert_eq!(pending[1].1.consumer, "c2");
        assert_eq!(pending[1].1.delivery_count, 1);
    }

    #[tokio::test]
    async fn ack_removes_exactly_one_pending_entry() {
        let store = MemoryStore::new();
        store
            .ensure_group("t", "g", StartPosition::Origin)
            .await
            .unwrap();
        store.append("t", b"a", None).await.unwrap();
        store.append("t", b"b", None).await.unwrap();
        let batch = store
            .read_group("t", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(store.pending_count("t", "g").await.unwrap(), 2);

        store.ack("t", "g", batch[0].id).await.unwrap();
        assert_eq!(store.pending_count("t", "g").await.unwrap(), 1);
        // Acknowledging twice changes nothing.
        store.ack("t", "g", batch[0].id).await.unwrap();
        assert_eq!(store.pending_count("t", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn trim_keeps_newest_entries_and_orphans_pending_payloads() {
        let store = MemoryStore::new();
        store
            .ensure_group("t", "g", StartPosition::Origin)
            .await
            .unwrap();
        let trim = Some(Trim {
            max_len: 2,
            approx: false,
        });
        store.append("t", b"a", trim).await.unwrap();
        store
            .read_group("t", "g", "c", ReadCursor::New, 1, None)
            .await
            .unwrap();
        store.append("t", b"b", trim).await.unwrap();
        store.append("t", b"c", trim).await.unwrap();
        assert_eq!(store.stream_len("t").await.unwrap(), 2);

        let pending = store
            .read_group("t", "g", "c", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body, None);
    }

    #[tokio::test]
    async fn reading_unknown_group_fails() {
        let store = MemoryStore::new();
        let err = store
            .read_group("t", "g", "c", ReadCursor::New, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoGroup { .. }));
    }

    #[tokio::test]
    async fn kinds_do_not_mix() {
        let store = MemoryStore::new();
        store.push_left("jobs", b"x").await.unwrap();
        assert!(matches!(
            store.append("jobs", b"y", None).await,
            Err(Error::WrongType(_))
        ));
        store.append("events", b"y", None).await.unwrap();
        assert!(matches!(
            store.peek_last("events").await,
            Err(Error::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn list_is_fifo_from_tail() {
        let store = MemoryStore::new();
        assert_eq!(store.peek_last("jobs").await.unwrap(), None);
        store.push_left("jobs", b"A").await.unwrap();
        store.push_left("jobs", b"B").await.unwrap();
        assert_eq!(store.peek_last("jobs").await.unwrap().as_deref(), Some(b"A".as_slice()));
        store.pop_right("jobs").await.unwrap();
        assert_eq!(store.peek_last("jobs").await.unwrap().as_deref(), Some(b"B".as_slice()));
        store.pop_right("jobs").await.unwrap();
        assert_eq!(store.list_len("jobs").await.unwrap(), 0);
        assert_eq!(store.peek_last("jobs").await.unwrap(), None);
        // Popping an absent list is a no-op.
        store.pop_right("jobs").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store
            .ensure_group("t", "g", StartPosition::Tail)
            .await
            .unwrap();

        let producer = std::sync::Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            producer.append("t", b"late", None).await.unwrap();
        });

        let batch = store
            .read_group("t", "g", "c", ReadCursor::New, 1, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(bodies(&batch), vec![b"late".as_slice()]);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_times_out_empty() {
        let store = MemoryStore::new();
        store
            .ensure_group("t", "g", StartPosition::Tail)
            .await
            .unwrap();
        let started = Instant::now();
        let batch = store
            .read_group("t", "g", "c", ReadCursor::New, 1, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn claim_moves_only_idle_entries() {
        let clock = ManualClock::new(1_000 * MS);
        let store = MemoryStore::with_clock(clock.clone());
        store
            .ensure_group("t", "g", StartPosition::Origin)
            .await
            .unwrap();
        store.append("t", b"a", None).await.unwrap();
        store
            .read_group("t", "g", "dead", ReadCursor::New, 1, None)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));
        store.append("t", b"b", None).await.unwrap();
        store
            .read_group("t", "g", "slow", ReadCursor::New, 1, None)
            .await
            .unwrap();

        let moved = store
            .claim_idle("t", "g", "rescuer", Duration::from_secs(10), 10)
            .await
            .unwrap();
        assert_eq!(moved, 1);

        let pending = store.pending("t", "g").unwrap();
        assert_eq!(pending[0].1.consumer, "rescuer");
        assert_eq!(pending[0].1.delivery_count, 1);
        assert_eq!(pending[1].1.consumer, "slow");

        let rescued = store
            .read_group("t", "g", "rescuer", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(bodies(&rescued), vec![b"a".as_slice()]);
    }
}
