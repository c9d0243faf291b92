//! Bounded delivery queue between the frame reader and user callbacks.
//!
//! The frame reader must never run user code: a slow callback would stall
//! frame reading, miss pings and get the connection declared dead. Instead
//! the reader enqueues `(subscription, event)` pairs here and a dedicated
//! consumer task drains them in FIFO order, so per-subscription delivery
//! order matches server send order.
//!
//! The queue is bounded; when full, [`enqueue`](EventQueue::enqueue)
//! applies the configured [`OverflowPolicy`]. Counters for enqueued,
//! processed and dropped items are readable at any time without touching
//! the queue lock.

use crate::config::{OverflowPolicy, QueueOptions};
use crate::events::Event;
use crate::subscription::Subscription;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One queued delivery.
pub type QueueItem = (Arc<Subscription>, Event);

/// Consumer callback invoked for every drained item.
pub type Processor = Arc<dyn Fn(Arc<Subscription>, Event) + Send + Sync>;

/// Optional callback reporting items discarded under a drop policy.
pub type DropCallback = Arc<dyn Fn(&Subscription, &Event) + Send + Sync>;

/// Bound on how long the consumer sleeps before re-checking for shutdown.
const CONSUMER_IDLE_WAIT: Duration = Duration::from_secs(1);

/// Bound on how long a blocked producer waits before re-checking state.
const BLOCKED_RECHECK: Duration = Duration::from_millis(200);

/// Monotonic queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently queued.
    pub size: usize,
    /// Items accepted by `enqueue` since construction.
    pub enqueued: u64,
    /// Items handed to the processor.
    pub processed: u64,
    /// Items discarded under a drop policy.
    pub dropped: u64,
}

struct QueueInner {
    buf: VecDeque<QueueItem>,
    stopped: bool,
}

/// Bounded multi-producer / single-consumer event buffer.
pub struct EventQueue {
    max_size: usize,
    policy: OverflowPolicy,
    inner: Mutex<QueueInner>,
    /// Signalled when an item is queued.
    items: Notify,
    /// Signalled when a slot frees up.
    space: Notify,
    enqueued: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    processor: Mutex<Option<Processor>>,
    on_drop: Mutex<Option<DropCallback>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Create a queue with the given sizing and overflow policy.
    pub fn new(options: QueueOptions) -> Arc<Self> {
        Arc::new(Self {
            max_size: options.max_size.max(1),
            policy: options.policy,
            inner: Mutex::new(QueueInner { buf: VecDeque::new(), stopped: false }),
            items: Notify::new(),
            space: Notify::new(),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processor: Mutex::new(None),
            on_drop: Mutex::new(None),
            consumer: Mutex::new(None),
        })
    }

    /// Register a callback invoked (outside the queue lock) for every
    /// dropped item.
    pub fn set_drop_callback(&self, callback: impl Fn(&Subscription, &Event) + Send + Sync + 'static) {
        *self.on_drop.lock() = Some(Arc::new(callback));
    }

    /// Start the consumer task. Idempotent while a consumer is running.
    pub fn start(self: &Arc<Self>, processor: Processor) {
        let mut consumer = self.consumer.lock();
        if consumer.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        *self.processor.lock() = Some(processor.clone());
        self.inner.lock().stopped = false;
        let queue = self.clone();
        *consumer = Some(tokio::spawn(async move {
            queue.consume(processor).await;
        }));
    }

    /// `true` while the consumer task is alive.
    pub fn is_running(&self) -> bool {
        self.consumer.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Queue one delivery, applying the overflow policy when full.
    ///
    /// Returns `false` when the item was not accepted: queue stopped,
    /// `DropNewest` rejection, or a `Block` wait cut short by shutdown.
    pub async fn enqueue(&self, subscription: Arc<Subscription>, event: Event) -> bool {
        let mut item = (subscription, event);
        loop {
            let evicted = {
                let mut inner = self.inner.lock();
                if inner.stopped {
                    return false;
                }
                if inner.buf.len() < self.max_size {
                    inner.buf.push_back(item);
                    self.enqueued.fetch_add(1, Ordering::Relaxed);
                    self.items.notify_one();
                    return true;
                }
                match self.policy {
                    OverflowPolicy::Block => None,
                    OverflowPolicy::DropOldest => {
                        let evicted = inner.buf.pop_front();
                        inner.buf.push_back(item);
                        self.enqueued.fetch_add(1, Ordering::Relaxed);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.items.notify_one();
                        item = evicted.expect("full queue has a head");
                        Some(true)
                    }
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        Some(false)
                    }
                }
            };
            match evicted {
                Some(accepted) => {
                    // `item` now holds the discarded delivery; report it
                    // outside the lock.
                    self.report_drop(&item);
                    return accepted;
                }
                None => {
                    // Block policy: wait for a slot or for shutdown. The
                    // bounded wait guards against a missed wakeup.
                    let _ = tokio::time::timeout(BLOCKED_RECHECK, self.space.notified()).await;
                }
            }
        }
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            size: self.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the consumer.
    ///
    /// Blocked producers are released (their `enqueue` returns `false`).
    /// With `drain`, items still queued after the consumer exits are
    /// processed synchronously before returning; otherwise they are
    /// discarded. The consumer join is bounded by `timeout`.
    pub async fn stop(&self, drain: bool, timeout: Duration) {
        self.inner.lock().stopped = true;
        self.items.notify_waiters();
        self.items.notify_one();
        self.space.notify_waiters();

        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                log::warn!("[livequery] queue consumer did not stop within {:?}", timeout);
            }
        }

        let remaining: Vec<QueueItem> = self.inner.lock().buf.drain(..).collect();
        if remaining.is_empty() {
            return;
        }
        if drain {
            let processor = self.processor.lock().clone();
            match processor {
                Some(processor) => {
                    for (subscription, event) in remaining {
                        self.run_processor(&processor, subscription, event);
                    }
                }
                None => log::debug!(
                    "[livequery] discarding {} queued events, no processor installed",
                    remaining.len()
                ),
            }
        } else {
            log::debug!("[livequery] discarding {} queued events on stop", remaining.len());
        }
    }

    async fn consume(self: Arc<Self>, processor: Processor) {
        enum Step {
            Item(QueueItem),
            Empty,
            Stopped,
        }
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if inner.stopped {
                    Step::Stopped
                } else if let Some(item) = inner.buf.pop_front() {
                    self.space.notify_one();
                    Step::Item(item)
                } else {
                    Step::Empty
                }
            };
            match step {
                Step::Stopped => return,
                Step::Item((subscription, event)) => {
                    self.run_processor(&processor, subscription, event);
                }
                Step::Empty => {
                    let _ = tokio::time::timeout(CONSUMER_IDLE_WAIT, self.items.notified()).await;
                }
            }
        }
    }

    fn run_processor(&self, processor: &Processor, subscription: Arc<Subscription>, event: Event) {
        let result = catch_unwind(AssertUnwindSafe(|| processor(subscription, event)));
        self.processed.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = result {
            log::error!(
                "[livequery] event processor panicked: {}",
                describe_panic(payload.as_ref())
            );
        }
    }

    fn report_drop(&self, item: &QueueItem) {
        let callback = self.on_drop.lock().clone();
        if let Some(callback) = callback {
            callback(&item.0, &item.1);
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }
    }
}

/// Best-effort rendering of a panic payload for logs.
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
