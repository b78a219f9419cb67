//! In-memory priority queue for voxqueue.
//!
//! Entries are kept in one FIFO band per priority:
//! - critical: served first
//! - high
//! - normal
//! - low: served only when every other band is empty
//!
//! There is no aging between bands: sustained high-priority traffic can keep
//! low-priority entries waiting indefinitely.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{Error, Result};

use super::message::{Message, Priority, QueuedEntry};

/// Number of recent dequeues the wait-time average covers.
const WAIT_WINDOW: usize = 256;

struct QueueState {
    bands: [VecDeque<QueuedEntry>; 4],
    next_sequence: u64,
    total_enqueued: u64,
    total_dequeued: u64,
    recent_waits: VecDeque<Duration>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    fn record_wait(&mut self, wait: Duration) {
        if self.recent_waits.len() == WAIT_WINDOW {
            self.recent_waits.pop_front();
        }
        self.recent_waits.push_back(wait);
    }

    fn average_wait(&self) -> Option<Duration> {
        if self.recent_waits.is_empty() {
            return None;
        }
        let total: Duration = self.recent_waits.iter().sum();
        Some(total / self.recent_waits.len() as u32)
    }
}

/// Bounded, priority-ordered, FIFO-within-band queue.
///
/// All methods take `&self`; share it behind an `Arc`.
pub struct PriorityQueue {
    /// Capacity; 0 means unbounded
    max_size: usize,
    state: Mutex<QueueState>,
    /// Signalled once per stored entry
    available: Notify,
    /// Signalled once per removed entry
    space: Notify,
}

impl PriorityQueue {
    /// Create a queue. `max_size == 0` disables the capacity check.
    pub fn new(max_size: usize) -> Self {
        tracing::info!(max_size, "Priority queue initialized");
        Self {
            max_size,
            state: Mutex::new(QueueState {
                bands: Default::default(),
                next_sequence: 0,
                total_enqueued: 0,
                total_dequeued: 0,
                recent_waits: VecDeque::with_capacity(WAIT_WINDOW),
            }),
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entry or hand the message back when the queue is at capacity.
    fn push(&self, mut message: Message, priority: Priority) -> std::result::Result<u64, Message> {
        let mut state = self.lock();
        if self.max_size > 0 && state.len() >= self.max_size {
            return Err(message);
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.total_enqueued += 1;

        message.priority = priority;
        tracing::debug!(
            message_id = %message.id,
            %priority,
            sequence,
            size = state.len() + 1,
            "Enqueued message"
        );
        state.bands[priority.rank()].push_back(QueuedEntry {
            message,
            sequence,
            enqueued_at: Instant::now(),
        });
        drop(state);

        self.available.notify_one();
        Ok(sequence)
    }

    /// Enqueue without waiting. Fails with `QueueFull` at capacity.
    ///
    /// Returns the entry's sequence number.
    pub fn try_enqueue(&self, message: Message, priority: Priority) -> Result<u64> {
        self.push(message, priority).map_err(|message| {
            tracing::warn!(message_id = %message.id, "Queue is full, cannot enqueue message");
            Error::QueueFull {
                capacity: self.max_size,
            }
        })
    }

    /// Enqueue, waiting for capacity when the queue is full.
    pub async fn enqueue(&self, message: Message, priority: Priority) -> u64 {
        let mut message = message;
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.push(message, priority) {
                Ok(sequence) => return sequence,
                Err(rejected) => {
                    message = rejected;
                    space.await;
                }
            }
        }
    }

    /// Wait until there is room for at least one more entry.
    pub async fn wait_for_space(&self) {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if !self.is_full() {
                return;
            }
            space.await;
        }
    }

    /// Re-insert a message for another attempt.
    ///
    /// The retry count goes up by one and the ID is kept. With `demote` the
    /// message lands in the low band so retries do not crowd out fresh work.
    pub fn requeue(&self, mut message: Message, demote: bool) -> Result<u64> {
        message.retry_count = message.retry_count.saturating_add(1);
        let priority = if demote {
            Priority::Low
        } else {
            message.priority
        };
        let retry_count = message.retry_count;
        let message_id = message.id.clone();

        let sequence = self.try_enqueue(message, priority)?;
        tracing::info!(
            message_id = %message_id,
            %priority,
            retry_count,
            "Message requeued"
        );
        Ok(sequence)
    }

    /// Remove the next entry without waiting.
    pub fn try_dequeue(&self) -> Option<QueuedEntry> {
        let mut state = self.lock();
        let entry = state.bands.iter_mut().find_map(VecDeque::pop_front)?;

        state.total_dequeued += 1;
        state.record_wait(entry.enqueued_at.elapsed());
        tracing::debug!(
            message_id = %entry.message.id,
            priority = %entry.priority(),
            size = state.len(),
            "Dequeued message"
        );
        drop(state);

        self.space.notify_one();
        Some(entry)
    }

    /// Remove the next entry, waiting while the queue is empty.
    ///
    /// Cancel-safe: an entry is only removed when the future completes.
    pub async fn dequeue(&self) -> QueuedEntry {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(entry) = self.try_dequeue() {
                return entry;
            }
            available.await;
        }
    }

    /// Look at the next message without removing it.
    pub fn peek(&self) -> Option<Message> {
        let state = self.lock();
        state
            .bands
            .iter()
            .find_map(|band| band.front())
            .map(|entry| entry.message.clone())
    }

    /// Messages waiting in one band, oldest first.
    pub fn entries_by_priority(&self, priority: Priority) -> Vec<Message> {
        let state = self.lock();
        state.bands[priority.rank()]
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Remove and return every waiting entry, in dequeue order.
    pub fn clear(&self) -> Vec<QueuedEntry> {
        let mut state = self.lock();
        let drained: Vec<QueuedEntry> = state
            .bands
            .iter_mut()
            .flat_map(|band| band.drain(..))
            .collect();
        drop(state);

        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Cleared messages from queue");
            self.space.notify_waiters();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.max_size > 0 && self.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Get queue statistics.
    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let count = |p: Priority| state.bands[p.rank()].len();

        QueueStats {
            size: state.len(),
            max_size: self.max_size,
            critical: count(Priority::Critical),
            high: count(Priority::High),
            normal: count(Priority::Normal),
            low: count(Priority::Low),
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            avg_wait_ms: state
                .average_wait()
                .map(|wait| wait.as_secs_f64() * 1000.0),
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    /// Rolling average of enqueue-to-dequeue time
    pub avg_wait_ms: Option<f64>,
}

impl QueueStats {
    /// Waiting entries in one band.
    pub fn count(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let capacity = if self.max_size == 0 {
            "unbounded".to_string()
        } else {
            self.max_size.to_string()
        };
        writeln!(f, "Queue Stats:")?;
        writeln!(f, "  Size:      {} / {}", self.size, capacity)?;
        writeln!(f, "  Critical:  {}", self.critical)?;
        writeln!(f, "  High:      {}", self.high)?;
        writeln!(f, "  Normal:    {}", self.normal)?;
        writeln!(f, "  Low:       {}", self.low)?;
        writeln!(f, "  Enqueued:  {}", self.total_enqueued)?;
        writeln!(f, "  Dequeued:  {}", self.total_dequeued)?;
        match self.avg_wait_ms {
            Some(ms) => write!(f, "  Avg wait:  {:.1}ms", ms),
            None => write!(f, "  Avg wait:  n/a"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn msg(id: &str) -> Message {
        Message::new("speech.created", json!({})).with_id(id)
    }

    fn drain_ids(queue: &PriorityQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.try_dequeue())
            .map(|entry| entry.message.id)
            .collect()
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let queue = PriorityQueue::new(0);
        queue.try_enqueue(msg("low"), Priority::Low).unwrap();
        queue.try_enqueue(msg("critical-1"), Priority::Critical).unwrap();
        queue.try_enqueue(msg("normal"), Priority::Normal).unwrap();
        queue.try_enqueue(msg("critical-2"), Priority::Critical).unwrap();

        assert_eq!(
            drain_ids(&queue),
            vec!["critical-1", "critical-2", "normal", "low"]
        );
    }

    #[test]
    fn test_mixed_interleaving_keeps_bands_fifo() {
        let queue = PriorityQueue::new(0);
        let plan = [
            ("n1", Priority::Normal),
            ("h1", Priority::High),
            ("l1", Priority::Low),
            ("n2", Priority::Normal),
            ("h2", Priority::High),
            ("c1", Priority::Critical),
            ("l2", Priority::Low),
        ];
        for (id, priority) in plan {
            queue.try_enqueue(msg(id), priority).unwrap();
        }

        assert_eq!(queue.try_dequeue().unwrap().message.id, "c1");
        // A later critical arrival overtakes everything still waiting.
        queue.try_enqueue(msg("c2"), Priority::Critical).unwrap();

        assert_eq!(
            drain_ids(&queue),
            vec!["c2", "h1", "h2", "n1", "n2", "l1", "l2"]
        );
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let queue = PriorityQueue::new(0);
        let a = queue.try_enqueue(msg("a"), Priority::Low).unwrap();
        let b = queue.try_enqueue(msg("b"), Priority::High).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_capacity_rejects_and_recovers() {
        let queue = PriorityQueue::new(2);
        queue.try_enqueue(msg("a"), Priority::Normal).unwrap();
        queue.try_enqueue(msg("b"), Priority::Normal).unwrap();
        assert!(queue.is_full());

        let err = queue.try_enqueue(msg("c"), Priority::Normal).unwrap_err();
        assert!(err.is_queue_full());

        queue.try_dequeue().unwrap();
        assert!(queue.try_enqueue(msg("c"), Priority::Normal).is_ok());
    }

    #[test]
    fn test_unbounded_never_full() {
        let queue = PriorityQueue::new(0);
        for i in 0..5000 {
            queue.try_enqueue(msg(&i.to_string()), Priority::Low).unwrap();
        }
        assert!(!queue.is_full());
        assert_eq!(queue.len(), 5000);
    }

    #[test]
    fn test_requeue_increments_retry_and_keeps_id() {
        let queue = PriorityQueue::new(0);
        queue.try_enqueue(msg("job"), Priority::Critical).unwrap();

        let entry = queue.try_dequeue().unwrap();
        assert_eq!(entry.message.retry_count, 0);
        queue.requeue(entry.message, true).unwrap();

        let entry = queue.try_dequeue().unwrap();
        assert_eq!(entry.message.id, "job");
        assert_eq!(entry.message.retry_count, 1);
        assert_eq!(entry.priority(), Priority::Low);

        queue.requeue(entry.message, false).unwrap();
        let entry = queue.try_dequeue().unwrap();
        assert_eq!(entry.message.retry_count, 2);
        assert_eq!(entry.priority(), Priority::Low);

        queue.requeue(msg("worn").with_retry_count(u32::MAX), true).unwrap();
        let entry = queue.try_dequeue().unwrap();
        assert_eq!(entry.message.retry_count, u32::MAX);
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let queue = PriorityQueue::new(1);
        queue.try_enqueue(msg("a"), Priority::Normal).unwrap();
        assert!(queue.requeue(msg("b"), true).unwrap_err().is_queue_full());
    }

    #[test]
    fn test_peek_clear_and_band_listing() {
        let queue = PriorityQueue::new(0);
        assert!(queue.peek().is_none());

        queue.try_enqueue(msg("n1"), Priority::Normal).unwrap();
        queue.try_enqueue(msg("h1"), Priority::High).unwrap();
        queue.try_enqueue(msg("n2"), Priority::Normal).unwrap();

        assert_eq!(queue.peek().unwrap().id, "h1");
        let normal: Vec<String> = queue
            .entries_by_priority(Priority::Normal)
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(normal, vec!["n1", "n2"]);

        let cleared = queue.clear();
        assert_eq!(cleared.len(), 3);
        assert_eq!(cleared[0].message.id, "h1");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stats() {
        let queue = PriorityQueue::new(10);
        queue.try_enqueue(msg("a"), Priority::High).unwrap();
        queue.try_enqueue(msg("b"), Priority::Low).unwrap();
        queue.try_enqueue(msg("c"), Priority::Low).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.count(Priority::High), 1);
        assert_eq!(stats.count(Priority::Low), 2);
        assert_eq!(stats.count(Priority::Critical), 0);
        assert!(stats.avg_wait_ms.is_none());

        queue.try_dequeue().unwrap();
        let stats = queue.stats();
        assert_eq!(stats.total_enqueued, 3);
        assert_eq!(stats.total_dequeued, 1);
        assert!(stats.avg_wait_ms.is_some());
        assert!(stats.to_string().contains("Size:      2 / 10"));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(PriorityQueue::new(0));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.try_enqueue(msg("late"), Priority::Normal).unwrap();
        let entry = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message.id, "late");
    }

    #[tokio::test]
    async fn test_many_waiters_each_get_one_entry() {
        let queue = Arc::new(PriorityQueue::new(0));
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move { queue.dequeue().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..4 {
            queue.try_enqueue(msg(&i.to_string()), Priority::Normal).unwrap();
        }

        let mut ids = Vec::new();
        for waiter in waiters {
            let entry = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            ids.push(entry.message.id);
        }
        ids.sort();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_capacity() {
        let queue = Arc::new(PriorityQueue::new(1));
        queue.try_enqueue(msg("first"), Priority::Normal).unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(msg("second"), Priority::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.try_dequeue().unwrap().message.id, "first");
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.try_dequeue().unwrap().message.id, "second");
    }

    #[tokio::test]
    async fn test_cancelled_dequeue_loses_nothing() {
        let queue = PriorityQueue::new(0);
        let attempt = tokio::time::timeout(Duration::from_millis(10), queue.dequeue()).await;
        assert!(attempt.is_err());

        queue.try_enqueue(msg("kept"), Priority::Normal).unwrap();
        assert_eq!(queue.dequeue().await.message.id, "kept");
    }

    #[tokio::test]
    async fn test_wait_for_space() {
        let queue = Arc::new(PriorityQueue::new(1));
        queue.wait_for_space().await;
        queue.try_enqueue(msg("only"), Priority::Normal).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_space().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.try_dequeue().unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
