//! Informer bridge
//!
//! Turns watcher events into typed work items:
//! - first sight of an object queues `Add`
//! - a deletion timestamp queues `Destroy` once
//! - a generation change queues `Modify`
//! - every resync tick queues `Sync` for each live object
//!
//! Status-only writes do not bump the generation, so the reconcilers' own
//! status updates never feed back into the queue.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::WorkQueue;
use crate::domain::types::{QueueOperation, QueuedWorkItem, ResourceKey};
use crate::error::Result;

/// Predicate selecting which objects this process manages
pub type ResourceFilter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    generation: Option<i64>,
    deleting: bool,
}

/// Remembers what was last seen of every watched object
pub struct EventTracker<K> {
    seen: HashMap<ResourceKey, Seen>,
    filter: Option<ResourceFilter<K>>,
}

impl<K> EventTracker<K>
where
    K: Resource,
{
    pub fn new(filter: Option<ResourceFilter<K>>) -> Self {
        Self {
            seen: HashMap::new(),
            filter,
        }
    }

    fn wanted(&self, obj: &K) -> bool {
        self.filter.as_ref().map(|f| f(obj)).unwrap_or(true)
    }

    /// Work items produced by one watcher event
    pub fn observe(&mut self, event: watcher::Event<K>) -> Vec<QueuedWorkItem> {
        match event {
            watcher::Event::Applied(obj) => self.classify(&obj).into_iter().collect(),
            watcher::Event::Deleted(obj) => {
                self.seen.remove(&ResourceKey::from_resource(&obj));
                Vec::new()
            }
            watcher::Event::Restarted(objs) => {
                let mut items = Vec::new();
                let mut present = Vec::with_capacity(objs.len());
                for obj in &objs {
                    present.push(ResourceKey::from_resource(obj));
                    items.extend(self.classify(obj));
                }
                self.seen.retain(|key, _| present.contains(key));
                items
            }
        }
    }

    fn classify(&mut self, obj: &K) -> Option<QueuedWorkItem> {
        if !self.wanted(obj) {
            return None;
        }
        let key = ResourceKey::from_resource(obj);
        let meta = obj.meta();
        let next = Seen {
            generation: meta.generation,
            deleting: meta.deletion_timestamp.is_some(),
        };
        let previous = self.seen.insert(key.clone(), next);

        let operation = match previous {
            _ if next.deleting => {
                if previous.map(|p| p.deleting).unwrap_or(false) {
                    return None;
                }
                QueueOperation::Destroy
            }
            None => QueueOperation::Add,
            Some(p) if p.generation != next.generation => QueueOperation::Modify,
            Some(_) => return None,
        };
        Some(QueuedWorkItem::new(key, operation))
    }

    /// `Sync` items for every known object that is not being deleted
    pub fn resync(&self) -> Vec<QueuedWorkItem> {
        let mut keys: Vec<&ResourceKey> = self
            .seen
            .iter()
            .filter(|(_, seen)| !seen.deleting)
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys.into_iter()
            .map(|key| QueuedWorkItem::new(key.clone(), QueueOperation::Sync))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Watch `api` and feed the queue until shutdown
pub async fn run_informer<K>(
    api: Api<K>,
    config: watcher::Config,
    queue: Arc<WorkQueue<QueuedWorkItem>>,
    resync: Duration,
    filter: Option<ResourceFilter<K>>,
    shutdown: CancellationToken,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    let mut tracker = EventTracker::new(filter);
    let stream = watcher(api, config).default_backoff();
    tokio::pin!(stream);

    let mut ticker = interval_at(Instant::now() + resync, resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(kind = %kind, resync = ?resync, "Starting informer");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(kind = %kind, "Informer stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                for item in tracker.resync() {
                    queue.add(item);
                }
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for item in tracker.observe(event) {
                        debug!(kind = %kind, item = %item, "Queueing work item");
                        queue.add(item);
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Watch stream error");
                }
                None => {
                    warn!(kind = %kind, "Watch stream ended");
                    return Ok(());
                }
            }
        }
    }
}
