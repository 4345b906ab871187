use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::envelope::MessageEnvelope;

/// Dequeue priority. Lower discriminant is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

const LEVELS: usize = 3;

impl Priority {
    pub const ALL: [Self; LEVELS] = [Self::High, Self::Medium, Self::Low];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue closed")]
    Closed,
}

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutPolicy {
    /// Discard the item and log a warning.
    #[default]
    DropAndLog,
    /// Sleep `interval` and try again until it fits or shutdown is signalled.
    RetryUntilShutdown { interval: Duration },
}

/// An envelope waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub envelope: MessageEnvelope,
    pub priority: Priority,
    pub seq: u64,
}

struct Inner {
    levels: [VecDeque<QueueItem>; LEVELS],
    len: usize,
    next_seq: u64,
    closed: bool,
}

/// Bounded multi-priority queue between producers and the transmitter.
///
/// `put` never blocks. `get` blocks until an item is available or the
/// queue is closed. Items are served highest priority first, FIFO within
/// a priority level.
pub struct ProtocolQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    available: Condvar,
}

impl ProtocolQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                levels: std::array::from_fn(|_| VecDeque::new()),
                len: 0,
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Enqueues without blocking. A full queue is left unchanged.
    pub fn put(&self, envelope: MessageEnvelope, priority: Priority) -> Result<(), QueueError> {
        self.try_put(envelope, priority).map_err(|(e, _)| e)
    }

    fn try_put(
        &self,
        envelope: MessageEnvelope,
        priority: Priority,
    ) -> Result<(), (QueueError, MessageEnvelope)> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err((QueueError::Closed, envelope));
        }
        if inner.len >= self.capacity {
            return Err((QueueError::Full, envelope));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.levels[priority as usize].push_back(QueueItem {
            envelope,
            priority,
            seq,
        });
        inner.len += 1;
        drop(inner);

        self.available.notify_one();
        Ok(())
    }

    /// Enqueues following `policy` when the queue is full.
    ///
    /// With [`PutPolicy::RetryUntilShutdown`] this blocks the caller, checking
    /// `shutdown` once per interval.
    pub fn put_with_policy(
        &self,
        envelope: MessageEnvelope,
        priority: Priority,
        policy: PutPolicy,
        shutdown: &CancellationToken,
    ) -> Result<(), QueueError> {
        let message_type = envelope.message_type.as_str();
        match policy {
            PutPolicy::DropAndLog => self.try_put(envelope, priority).map_err(|(e, _)| {
                warn!(
                    message_type,
                    priority = priority.as_str(),
                    error = %e,
                    "discarding sample"
                );
                e
            }),
            PutPolicy::RetryUntilShutdown { interval } => {
                let mut envelope = envelope;
                loop {
                    match self.try_put(envelope, priority) {
                        Ok(()) => return Ok(()),
                        Err((QueueError::Full, returned)) => {
                            if shutdown.is_cancelled() {
                                return Err(QueueError::Full);
                            }
                            debug!(message_type, "queue full, retrying");
                            envelope = returned;
                            std::thread::sleep(interval);
                        }
                        Err((e, _)) => return Err(e),
                    }
                }
            }
        }
    }

    fn pop(inner: &mut Inner) -> Option<QueueItem> {
        let item = inner.levels.iter_mut().find_map(VecDeque::pop_front)?;
        inner.len -= 1;
        Some(item)
    }

    /// Blocks until an item is available. Returns `None` once the queue has
    /// been closed.
    pub fn get(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(item) = Self::pop(&mut inner) {
                return Some(item);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(item) = Self::pop(&mut inner) {
                return Some(item);
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                if inner.closed {
                    return None;
                }
                return Self::pop(&mut inner);
            }
        }
    }

    /// Rejects further puts and wakes every blocked consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    /// Removes and returns everything still queued, in dequeue order.
    pub fn drain(&self) -> Vec<QueueItem> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.len);
        while let Some(item) = Self::pop(&mut inner) {
            out.push(item);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::compress::Compression;
    use crate::protocol::envelope::MessageType;

    fn envelope(tag: u8) -> MessageEnvelope {
        MessageEnvelope {
            message_type: MessageType::Metrics,
            timestamp_ns: u64::from(tag),
            compression: Compression::None,
            payload: vec![tag],
        }
    }

    #[test]
    fn test_capacity_is_enforced() {
        let q = ProtocolQueue::new(3);
        for i in 0..3 {
            q.put(envelope(i), Priority::Medium).expect("put within capacity");
        }
        assert_eq!(q.put(envelope(9), Priority::High), Err(QueueError::Full));
        assert_eq!(q.len(), 3);

        q.get().expect("item");
        q.put(envelope(9), Priority::High).expect("put after get");
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_priority_order() {
        let q = ProtocolQueue::new(8);
        q.put(envelope(1), Priority::Low).expect("low");
        q.put(envelope(2), Priority::Medium).expect("medium");
        q.put(envelope(3), Priority::High).expect("high");

        let order: Vec<Priority> = (0..3).map(|_| q.get().expect("item").priority).collect();
        assert_eq!(order, vec![Priority::High, Priority::Medium, Priority::Low]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fifo_within_level() {
        let q = ProtocolQueue::new(8);
        for i in 0..4 {
            q.put(envelope(i), Priority::Medium).expect("put");
        }
        let tags: Vec<u8> = (0..4)
            .map(|_| q.get().expect("item").envelope.payload[0])
            .collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_close_unblocks_consumer() {
        let q = Arc::new(ProtocolQueue::new(1));
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.get())
        };

        std::thread::sleep(Duration::from_millis(20));
        q.close();

        assert!(consumer.join().expect("consumer thread").is_none());
        assert_eq!(q.put(envelope(0), Priority::High), Err(QueueError::Closed));
    }

    #[test]
    fn test_get_wakes_on_put() {
        let q = Arc::new(ProtocolQueue::new(1));
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.get())
        };

        std::thread::sleep(Duration::from_millis(20));
        q.put(envelope(5), Priority::Low).expect("put");

        let item = consumer.join().expect("consumer thread").expect("item");
        assert_eq!(item.envelope.payload, vec![5]);
    }

    #[test]
    fn test_get_timeout_on_empty_queue() {
        let q = ProtocolQueue::new(1);
        assert!(q.get_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_drop_policy_reports_full() {
        let q = ProtocolQueue::new(1);
        let shutdown = CancellationToken::new();
        q.put(envelope(0), Priority::Low).expect("fill");

        let result = q.put_with_policy(envelope(1), Priority::High, PutPolicy::DropAndLog, &shutdown);
        assert_eq!(result, Err(QueueError::Full));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_retry_policy_succeeds_after_space_frees() {
        let q = Arc::new(ProtocolQueue::new(1));
        let shutdown = CancellationToken::new();
        q.put(envelope(0), Priority::Low).expect("fill");

        let producer = {
            let q = Arc::clone(&q);
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                q.put_with_policy(
                    envelope(1),
                    Priority::High,
                    PutPolicy::RetryUntilShutdown {
                        interval: Duration::from_millis(5),
                    },
                    &shutdown,
                )
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.get().expect("first").envelope.payload, vec![0]);

        producer.join().expect("producer thread").expect("retried put");
        assert_eq!(q.get().expect("second").priority, Priority::High);
    }

    #[test]
    fn test_retry_policy_stops_on_shutdown() {
        let q = ProtocolQueue::new(1);
        let shutdown = CancellationToken::new();
        q.put(envelope(0), Priority::Low).expect("fill");
        shutdown.cancel();

        let result = q.put_with_policy(
            envelope(1),
            Priority::High,
            PutPolicy::RetryUntilShutdown {
                interval: Duration::from_secs(1),
            },
            &shutdown,
        );
        assert_eq!(result, Err(QueueError::Full));
    }

    #[test]
    fn test_drain_returns_remaining_in_order() {
        let q = ProtocolQueue::new(4);
        q.put(envelope(1), Priority::Low).expect("low");
        q.put(envelope(2), Priority::High).expect("high");
        q.close();

        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].priority, Priority::High);
        assert!(q.is_empty());
    }
}
