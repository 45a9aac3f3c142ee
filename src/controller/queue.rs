//! Rate-limited work queue
//!
//! Same contract as the client-go work queue the reconcilers were designed
//! around, applied per resource key:
//! - a resource already waiting is not queued twice; a second request for it
//!   is merged into the waiting one
//! - a resource is never handed to two workers at once; a request arriving
//!   while it is being processed is deferred until [`WorkQueue::done`]
//! - failures are requeued with per-key exponential backoff until
//!   [`WorkQueue::forget`] clears the history

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::types::{QueuedWorkItem, ResourceKey};
use crate::telemetry;

/// First retry delay of a failing item
pub const BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound of the retry delay
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Something the queue can hold
pub trait QueueItem: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    /// Identity used for dedup, exclusivity and backoff
    fn queue_key(&self) -> Self::Key;

    /// Fold a newer request into the one already waiting for the same key
    fn merge(self, newer: Self) -> Self;
}

impl QueueItem for QueuedWorkItem {
    type Key = ResourceKey;

    fn queue_key(&self) -> ResourceKey {
        self.key.clone()
    }

    fn merge(self, newer: Self) -> Self {
        QueuedWorkItem::merge(self, newer)
    }
}

struct Failures {
    backoff: ExponentialBackoff,
    requeues: usize,
}

struct Inner<T: QueueItem> {
    queue: VecDeque<T::Key>,
    dirty: HashMap<T::Key, T>,
    processing: HashSet<T::Key>,
    failures: HashMap<T::Key, Failures>,
    shutting_down: bool,
}

/// Work queue shared by the informer and the workers of one reconciler
pub struct WorkQueue<T: QueueItem> {
    name: String,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

fn item_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(BASE_DELAY)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(MAX_DELAY)
        .with_max_elapsed_time(None)
        .build()
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashMap::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an item, merging it into a request already waiting for its key
    pub fn add(&self, item: T) {
        let depth = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            let key = item.queue_key();
            if let Some(waiting) = inner.dirty.remove(&key) {
                inner.dirty.insert(key, waiting.merge(item));
                return;
            }
            inner.dirty.insert(key.clone(), item);
            if inner.processing.contains(&key) {
                return;
            }
            inner.queue.push_back(key);
            inner.queue.len()
        };
        telemetry::set_queue_depth(&self.name, depth);
        self.notify.notify_one();
    }

    /// Queue an item once `delay` has passed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Requeue a failed item after its next backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.next_delay(&item);
        self.add_after(item, delay);
    }

    fn next_delay(&self, item: &T) -> Duration {
        let mut inner = self.inner.lock();
        let failures = inner
            .failures
            .entry(item.queue_key())
            .or_insert_with(|| Failures {
                backoff: item_backoff(),
                requeues: 0,
            });
        failures.requeues += 1;
        failures.backoff.next_backoff().unwrap_or(MAX_DELAY)
    }

    /// Drop the failure history of an item's key
    pub fn forget(&self, item: &T) {
        self.inner.lock().failures.remove(&item.queue_key());
    }

    /// Times the item's key was requeued since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> usize {
        self.inner
            .lock()
            .failures
            .get(&item.queue_key())
            .map(|f| f.requeues)
            .unwrap_or(0)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return None;
                }
                while let Some(key) = inner.queue.pop_front() {
                    let Some(item) = inner.dirty.remove(&key) else {
                        continue;
                    };
                    inner.processing.insert(key);
                    let depth = inner.queue.len();
                    drop(inner);

                    telemetry::set_queue_depth(&self.name, depth);
                    if depth > 0 {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark an item as processed; a request deferred meanwhile is queued now
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut inner = self.inner.lock();
            let key = item.queue_key();
            inner.processing.remove(&key);
            if inner.dirty.contains_key(&key) && !inner.shutting_down {
                inner.queue.push_back(key);
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::QueueOperation;

    impl QueueItem for &'static str {
        type Key = &'static str;

        fn queue_key(&self) -> &'static str {
            self
        }

        fn merge(self, _newer: Self) -> Self {
            self
        }
    }

    fn work(op: QueueOperation) -> QueuedWorkItem {
        QueuedWorkItem::new(ResourceKey::cluster("pool-a"), op)
    }

    #[tokio::test]
    async fn test_deduplicates_waiting_items() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_get_waits_for_an_item() {
        let queue = WorkQueue::new("test");
        let mut get = tokio_test::task::spawn(queue.get());
        tokio_test::assert_pending!(get.poll());

        queue.add("a");
        assert!(get.is_woken());
        assert_eq!(tokio_test::assert_ready!(get.poll()), Some("a"));
    }

    #[tokio::test]
    async fn test_readd_while_processing_is_deferred() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let item = queue.get().await.unwrap();

        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_operations_on_one_resource_are_merged() {
        let queue = WorkQueue::new("test");
        queue.add(work(QueueOperation::Add));
        queue.add(work(QueueOperation::Destroy));
        queue.add(work(QueueOperation::Modify));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get().await, Some(work(QueueOperation::Destroy)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_second_operation_waits_for_done() {
        let queue = WorkQueue::new("test");
        queue.add(work(QueueOperation::Add));
        let first = {
            let mut get = tokio_test::task::spawn(queue.get());
            tokio_test::assert_ready!(get.poll())
        };
        assert_eq!(first, Some(work(QueueOperation::Add)));

        queue.add(work(QueueOperation::Destroy));
        let mut second = tokio_test::task::spawn(queue.get());
        tokio_test::assert_pending!(second.poll());

        queue.done(&work(QueueOperation::Add));
        assert!(second.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(second.poll()),
            Some(work(QueueOperation::Destroy))
        );
    }

    #[tokio::test]
    async fn test_backoff_is_shared_by_a_resource() {
        let queue = WorkQueue::new("test");
        queue.next_delay(&work(QueueOperation::Add));
        assert_eq!(queue.num_requeues(&work(QueueOperation::Sync)), 1);

        queue.forget(&work(QueueOperation::Modify));
        assert_eq!(queue.num_requeues(&work(QueueOperation::Add)), 0);
    }

    #[tokio::test]
    async fn test_backoff_bookkeeping() {
        let queue = WorkQueue::new("test");
        assert_eq!(queue.next_delay(&"a"), Duration::from_millis(5));
        assert_eq!(queue.next_delay(&"a"), Duration::from_millis(10));
        assert_eq!(queue.next_delay(&"a"), Duration::from_millis(20));
        assert_eq!(queue.num_requeues(&"a"), 3);
        assert_eq!(queue.num_requeues(&"b"), 0);

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
        assert_eq!(queue.next_delay(&"a"), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let queue = WorkQueue::new("test");
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = queue.next_delay(&"a");
        }
        assert_eq!(last, MAX_DELAY);
    }

    #[tokio::test]
    async fn test_rate_limited_item_comes_back() {
        let queue = WorkQueue::new("test");
        queue.add_rate_limited("a");
        let item = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(item, Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let queue = WorkQueue::<&'static str>::new("test");
                let waiter = {
                    let queue = queue.clone();
                    tokio::task::spawn_local(async move { queue.get().await })
                };
                tokio::time::sleep(Duration::from_millis(10)).await;

                queue.shut_down();
                let got = tokio::time::timeout(Duration::from_secs(1), waiter)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(got, None);

                queue.add("late");
                assert!(queue.is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_workers_get_distinct_items() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let queue = WorkQueue::new("test");
                let workers: Vec<_> = (0..2)
                    .map(|_| {
                        let queue = queue.clone();
                        tokio::task::spawn_local(async move { queue.get().await })
                    })
                    .collect();
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.add("a");
                queue.add("b");

                let mut got = Vec::new();
                for worker in workers {
                    got.push(
                        tokio::time::timeout(Duration::from_secs(1), worker)
                            .await
                            .unwrap()
                            .unwrap()
                            .unwrap(),
                    );
                }
                got.sort();
                assert_eq!(got, vec!["a", "b"]);
            })
            .await;
    }
}
