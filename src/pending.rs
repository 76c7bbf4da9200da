//! Sharded table of in-flight requests.
//!
//! The table maps a request sync to the oneshot sender that fulfills the
//! caller's [`RequestFuture`](crate::future::RequestFuture). It is the
//! only structure mutated by multiple tasks concurrently: callers insert,
//! the reader removes by sync, the sweeper removes expired heads, and the
//! lifecycle manager bulk-drains on reconnect or close.
//!
//! Sharding bounds lock contention under many concurrent callers; the
//! fixed bucket array inside each shard bounds the linear scan when one
//! shard holds many simultaneous requests. Buckets are FIFO by arrival,
//! so deadline scanning only ever looks at bucket heads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::{STATE_CLOSED, STATE_DISCONNECTED};
use crate::error::{Error, Result};
use crate::protocol::Response;

/// Buckets per shard (power of two).
const BUCKETS_PER_SHARD: usize = 128;

/// One in-flight request awaiting fulfillment.
pub(crate) struct Pending {
    pub sync: u32,
    pub deadline: Option<Instant>,
    pub tx: oneshot::Sender<Result<Response>>,
}

#[derive(Default)]
struct Bucket {
    queue: VecDeque<Pending>,
}

struct Shard {
    buckets: Mutex<Box<[Bucket]>>,
}

impl Shard {
    fn new() -> Self {
        let buckets: Vec<Bucket> = (0..BUCKETS_PER_SHARD).map(|_| Bucket::default()).collect();
        Shard {
            buckets: Mutex::new(buckets.into_boxed_slice()),
        }
    }
}

/// Lock-partitioned pending-request table.
pub(crate) struct PendingTable {
    shards: Vec<Shard>,
    shard_count: u32,
}

impl PendingTable {
    /// `concurrency` must already be a power of two.
    pub fn new(concurrency: u32) -> Self {
        debug_assert!(concurrency.is_power_of_two());
        PendingTable {
            shards: (0..concurrency).map(|_| Shard::new()).collect(),
            shard_count: concurrency,
        }
    }

    #[inline]
    fn locate(&self, sync: u32) -> (usize, usize) {
        let shard = (sync & (self.shard_count - 1)) as usize;
        let bucket = ((sync / self.shard_count) as usize) & (BUCKETS_PER_SHARD - 1);
        (shard, bucket)
    }

    /// Register a new in-flight request and hand back the receiving end.
    ///
    /// Fast-fails without queuing when the connection is closed or
    /// between reconnect attempts; the state check happens under the
    /// shard lock so it cannot race the bulk drain.
    pub fn register(
        &self,
        sync: u32,
        deadline: Option<Instant>,
        state: &AtomicU8,
    ) -> Result<oneshot::Receiver<Result<Response>>> {
        let (shard, bucket) = self.locate(sync);
        let mut buckets = self.shards[shard].buckets.lock();

        match state.load(Ordering::Acquire) {
            STATE_CLOSED => return Err(Error::ConnectionClosed("using closed connection")),
            STATE_DISCONNECTED => return Err(Error::ConnectionNotReady),
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        buckets[bucket].queue.push_back(Pending { sync, deadline, tx });

        Ok(rx)
    }

    /// Remove and return the request with the given sync, if still
    /// present. Returns `None` for already-removed ids (late or duplicate
    /// responses).
    pub fn remove(&self, sync: u32) -> Option<Pending> {
        let (shard, bucket) = self.locate(sync);
        let mut buckets = self.shards[shard].buckets.lock();

        let queue = &mut buckets[bucket].queue;
        let idx = queue.iter().position(|p| p.sync == sync)?;
        queue.remove(idx)
    }

    /// Unlink every expired request, given that buckets are FIFO and all
    /// requests share one timeout: scanning stops at the first
    /// not-yet-expired head. Returns the expired entries and the earliest
    /// deadline still pending (for rescheduling the sweep).
    pub fn sweep_expired(&self, now: Instant) -> (Vec<Pending>, Option<Instant>) {
        let mut expired = Vec::new();
        let mut next: Option<Instant> = None;

        for shard in &self.shards {
            let mut buckets = shard.buckets.lock();
            for bucket in buckets.iter_mut() {
                while let Some(head) = bucket.queue.front() {
                    match head.deadline {
                        Some(deadline) if deadline < now => {
                            if let Some(p) = bucket.queue.pop_front() {
                                expired.push(p);
                            }
                        }
                        Some(deadline) => {
                            if next.map_or(true, |n| deadline < n) {
                                next = Some(deadline);
                            }
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        (expired, next)
    }

    /// Atomically flip the connection state and unlink every pending
    /// request.
    ///
    /// Shards are locked in ascending index order and all locks are held
    /// while the state is stored, so no `register` can slip a new entry
    /// past the drain under the old state.
    pub fn drain_all_with_state(&self, state: &AtomicU8, new_state: u8) -> Vec<Pending> {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.buckets.lock()).collect();

        state.store(new_state, Ordering::Release);

        let mut drained = Vec::new();
        for guard in guards.iter_mut() {
            for bucket in guard.iter_mut() {
                drained.extend(bucket.queue.drain(..));
            }
        }

        drained
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.buckets
                    .lock()
                    .iter()
                    .map(|b| b.queue.len())
                    .sum::<usize>()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::STATE_CONNECTED;
    use std::sync::Arc;
    use std::time::Duration;

    fn connected() -> AtomicU8 {
        AtomicU8::new(STATE_CONNECTED)
    }

    #[test]
    fn test_shard_selection_uniform_over_sequential_ids() {
        let table = PendingTable::new(8);
        let mut hits = [0usize; 8];

        for sync in 1..=8 * 100u32 {
            let (shard, _) = table.locate(sync);
            hits[shard] += 1;
        }

        assert!(hits.iter().all(|&h| h == 100), "hits: {hits:?}");
    }

    #[test]
    fn test_bucket_formula() {
        let table = PendingTable::new(4);
        // sync 4n+2 all land in shard 2; bucket advances every 4 ids.
        assert_eq!(table.locate(2), (2, 0));
        assert_eq!(table.locate(6), (2, 1));
        assert_eq!(table.locate(2 + 4 * 128), (2, 0));
    }

    #[test]
    fn test_register_remove_roundtrip() {
        let table = PendingTable::new(4);
        let state = connected();

        let _rx = table.register(7, None, &state).unwrap();
        assert_eq!(table.in_flight(), 1);

        let pending = table.remove(7).expect("registered entry");
        assert_eq!(pending.sync, 7);
        assert_eq!(table.in_flight(), 0);

        // Late duplicate: already removed.
        assert!(table.remove(7).is_none());
    }

    #[test]
    fn test_register_fails_fast_when_not_ready() {
        let table = PendingTable::new(4);

        let closed = AtomicU8::new(STATE_CLOSED);
        assert!(matches!(
            table.register(1, None, &closed),
            Err(Error::ConnectionClosed(_))
        ));

        let down = AtomicU8::new(STATE_DISCONNECTED);
        assert!(matches!(
            table.register(1, None, &down),
            Err(Error::ConnectionNotReady)
        ));

        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_remove_claims_entry_exactly_once() {
        let table = Arc::new(PendingTable::new(4));
        let state = connected();

        for sync in 1..=64u32 {
            let _rx = table.register(sync, None, &state).unwrap();

            let mut handles = Vec::new();
            for _ in 0..3 {
                let table = Arc::clone(&table);
                handles.push(std::thread::spawn(move || table.remove(sync).is_some()));
            }

            let wins: usize = handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum();
            assert_eq!(wins, 1, "sync {sync} claimed {wins} times");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_in_fifo_order() {
        let table = PendingTable::new(2);
        let state = connected();
        let start = Instant::now();

        // Same shard and bucket: syncs 2 and 2+2*128 share (0, 1)... use
        // explicit distinct deadlines in one bucket instead.
        let _rx1 = table
            .register(2, Some(start + Duration::from_millis(10)), &state)
            .unwrap();
        let _rx2 = table
            .register(6, Some(start + Duration::from_millis(50)), &state)
            .unwrap();

        let (expired, next) = table.sweep_expired(start + Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sync, 2);
        assert_eq!(next, Some(start + Duration::from_millis(50)));

        let (expired, next) = table.sweep_expired(start + Duration::from_millis(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sync, 6);
        assert_eq!(next, None);
    }

    #[test]
    fn test_sweep_ignores_undated_entries() {
        let table = PendingTable::new(2);
        let state = connected();

        let _rx = table.register(1, None, &state).unwrap();
        std::thread::sleep(Duration::from_millis(1));

        let (expired, next) = table.sweep_expired(Instant::now());
        assert!(expired.is_empty());
        assert_eq!(next, None);
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn test_drain_all_flips_state_and_empties_table() {
        let table = PendingTable::new(4);
        let state = connected();

        for sync in 1..=20u32 {
            let _rx = table.register(sync, None, &state).unwrap();
        }

        let drained = table.drain_all_with_state(&state, STATE_DISCONNECTED);
        assert_eq!(drained.len(), 20);
        assert_eq!(table.in_flight(), 0);

        // New registrations now fail fast under the stored state.
        assert!(matches!(
            table.register(21, None, &state),
            Err(Error::ConnectionNotReady)
        ));
    }
}
