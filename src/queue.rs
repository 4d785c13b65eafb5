//! A deduplicating, rate-limited FIFO of pending work.
//!
//! An item is in at most one of three places at a time:
//! waiting in the FIFO (dirty), held by a worker (processing),
//! or held by a worker and changed again since (dirty and processing).
//! In the last case the item only becomes available again once the worker calls [`WorkQueue::done`],
//! so no two workers ever hold the same item and no change is lost.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future,
    hash::Hash,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::{
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};

mod rate_limiter;
pub use rate_limiter::{ItemExponentialFailure, RateLimiter};

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Notify,
    delayed: Mutex<Delayed<T>>,
    rate_limiter: Box<dyn RateLimiter<T>>,
    shutdown: CancellationToken,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // stops the delay driver once the last handle is gone
        self.shutdown.cancel();
    }
}

struct State<T> {
    /// FIFO order of dirty items that are not being processed.
    order: VecDeque<T>,
    /// Items that need processing. Holds the latest value added for each item.
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Items waiting for [`WorkQueue::add_after`] to release them.
struct Delayed<T> {
    entries: DelayQueue<T>,
    /// At most one timer per item, keyed by the item itself.
    pending: HashMap<T, (delay_queue::Key, Instant)>,
    /// The driver task, parked while nothing has expired.
    waker: Option<Waker>,
    driving: bool,
}

impl<T: Clone + Eq + Hash> Delayed<T> {
    /// Schedules `item` for `deadline`, unless it is already due no later than that.
    fn schedule(&mut self, item: T, deadline: Instant) {
        if let Some((key, due)) = self.pending.get(&item) {
            if *due <= deadline {
                return;
            }
            self.entries.remove(key);
        }
        let key = self.entries.insert_at(item.clone(), deadline);
        self.pending.insert(item, (key, deadline));
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<T> {
        match self.entries.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let item = expired.into_inner();
                self.pending.remove(&item);
                Poll::Ready(item)
            }
            // an empty DelayQueue does not register the waker
            Poll::Ready(None) | Poll::Pending => {
                self.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.waker = None;
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue with the default per-item exponential backoff.
    pub fn new() -> Self {
        Self::with_rate_limiter(ItemExponentialFailure::default())
    }

    pub fn with_rate_limiter(rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    order: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                delayed: Mutex::new(Delayed {
                    entries: DelayQueue::new(),
                    pending: HashMap::new(),
                    waker: None,
                    driving: false,
                }),
                rate_limiter: Box::new(rate_limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Marks `item` as needing processing.
    ///
    /// A no-op if the item is already pending, apart from replacing the stored value.
    /// If the item is being processed, it is queued again once [`done`](Self::done) is called.
    /// Ignored after [`shut_down`](Self::shut_down).
    pub fn add(&self, item: T) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if state.dirty.replace(item.clone()).is_some() {
                return;
            }
            if state.processing.contains(&item) {
                return;
            }
            state.order.push_back(item);
        }
        self.inner.available.notify_one();
    }

    /// Waits for the next item and marks it as processing.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.order.pop_front() {
                    let item = state.dirty.take(&item).unwrap_or(item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
                notified.as_mut().enable();
            }

            notified.await;
        }
    }

    /// Releases an item returned by [`get`](Self::get).
    ///
    /// If the item was added again while it was processing, it is queued immediately.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(item);
            match state.dirty.get(item).cloned() {
                Some(dirty) => {
                    state.order.push_back(dirty);
                    true
                }
                None => false,
            }
        };
        if requeued {
            self.inner.available.notify_one();
        }
    }

    /// Clears the retry history of `item`. Call after it was processed successfully.
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    /// How many times `item` has been requeued by [`add_rate_limited`](Self::add_rate_limited).
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Adds `item` again after its backoff delay.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Adds `item` once `delay` has elapsed, unless the queue is shut down first.
    ///
    /// An item holds at most one pending timer: adding it again with a later deadline is a no-op,
    /// and an earlier deadline replaces the pending one.
    /// Must be called within a Tokio runtime when `delay` is non-zero.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let mut delayed = self.inner.delayed.lock();
        delayed.schedule(item, Instant::now() + delay);
        if !delayed.driving {
            delayed.driving = true;
            tokio::spawn(drive_delayed(
                Arc::downgrade(&self.inner),
                self.inner.shutdown.clone(),
            ));
        }
    }

    /// The number of items waiting to be picked up.
    pub fn len(&self) -> usize {
        self.inner.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items.
    ///
    /// Pending items are still handed out;
    /// once they are drained, every [`get`](Self::get) returns `None` immediately.
    /// Calling this more than once has no further effect.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.delayed.lock().clear();
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

/// Moves expired items from the delay queue into the FIFO until shutdown.
async fn drive_delayed<T>(inner: Weak<Inner<T>>, shutdown: CancellationToken)
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    loop {
        let expired = future::poll_fn(|cx| match inner.upgrade() {
            Some(inner) => {
                let mut delayed = inner.delayed.lock();
                delayed.poll_expired(cx).map(Some)
            }
            None => Poll::Ready(None),
        });
        let item = tokio::select! {
            () = shutdown.cancelled() => return,
            item = expired => item,
        };
        match (item, inner.upgrade()) {
            (Some(item), Some(inner)) => WorkQueue { inner }.add(item),
            _ => return,
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex as PlMutex;

    use super::*;

    #[tokio::test]
    async fn collapses_duplicate_adds() {
        let queue = WorkQueue::new();
        for _ in 0..5 {
            queue.add("a");
        }
        queue.add("b");
        queue.add("a");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));

        queue.shut_down();
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn holds_back_item_added_while_processing() {
        let queue = WorkQueue::new();
        queue.add("a");
        let item = queue.get().await.unwrap();

        queue.add("a");
        assert!(queue.is_empty(), "must not hand out an item that is processing");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[derive(Debug, Clone)]
    struct Tagged(&'static str, u32);

    impl PartialEq for Tagged {
        fn eq(&self, other: &Self) -> bool {
            self.0 == other.0
        }
    }
    impl Eq for Tagged {}
    impl Hash for Tagged {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.0.hash(state);
        }
    }

    #[tokio::test]
    async fn hands_out_latest_value() {
        let queue = WorkQueue::new();
        queue.add(Tagged("a", 1));
        queue.add(Tagged("a", 2));
        assert_eq!(queue.get().await.map(|t| t.1), Some(2));

        queue.add(Tagged("a", 3));
        queue.add(Tagged("a", 4));
        queue.done(&Tagged("a", 0));
        assert_eq!(queue.get().await.map(|t| t.1), Some(4));
    }

    #[tokio::test]
    async fn drains_before_signalling_shutdown() {
        let queue = WorkQueue::new();
        queue.add(1);
        queue.add(2);
        queue.shut_down();
        queue.shut_down();
        queue.add(3);

        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, None);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let queue = WorkQueue::<u32>::new();
        let getters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        queue.shut_down();
        for getter in getters {
            assert_eq!(getter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn dirty_item_done_after_shutdown_is_still_returned() {
        let queue = WorkQueue::new();
        queue.add("a");
        let item = queue.get().await.unwrap();
        queue.add("a");
        queue.shut_down();

        queue.done(&item);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_items_return_after_backoff() {
        let queue = WorkQueue::with_rate_limiter(ItemExponentialFailure::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        ));
        queue.add("a");
        let item = queue.get().await.unwrap();

        let start = tokio::time::Instant::now();
        queue.add_rate_limited(item);
        queue.done(&item);
        assert!(queue.is_empty());

        assert_eq!(queue.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(queue.num_requeues(&"a"), 1);

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_delayed_items() {
        let queue = WorkQueue::new();
        queue.add_after("a", Duration::from_secs(10));
        queue.shut_down();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_delayed_adds_share_one_timer() {
        let queue = WorkQueue::new();
        let start = tokio::time::Instant::now();
        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(1));
        queue.add_after("a", Duration::from_secs(5));

        assert_eq!(queue.get().await, Some("a"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(5));
        queue.done(&"a");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(queue.is_empty(), "superseded timers must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_items_keep_their_own_deadlines() {
        let queue = WorkQueue::new();
        queue.add_after("b", Duration::from_secs(2));
        queue.add_after("a", Duration::from_secs(1));

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_processes_a_key_concurrently() {
        const KEYS: usize = 4;
        let queue = WorkQueue::<usize>::new();
        let in_flight: Arc<Vec<AtomicUsize>> =
            Arc::new((0..KEYS).map(|_| AtomicUsize::new(0)).collect());
        let violations = Arc::new(PlMutex::new(Vec::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                let in_flight = Arc::clone(&in_flight);
                let violations = Arc::clone(&violations);
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        if in_flight[key].fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.lock().push(key);
                        }
                        tokio::task::yield_now().await;
                        in_flight[key].fetch_sub(1, Ordering::SeqCst);
                        queue.done(&key);
                    }
                })
            })
            .collect();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..500 {
                        queue.add((i + p) % KEYS);
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }
        assert!(violations.lock().is_empty());
    }
}
