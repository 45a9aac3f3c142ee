//! In-memory resource store
//!
//! Behaves like the API server for the calls the reconcilers make:
//! resource versions are checked on every write, `update` leaves the status
//! alone while `update_status` only touches it, and deleting an object that
//! still carries finalizers only stamps its deletion timestamp. Every stored
//! revision is kept so tests can replay the history of an object.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::ports::ResourceStore;
use crate::domain::types::ResourceKey;
use crate::error::{Error, Result};

/// Thread-safe map of resources with API-server-like write semantics
pub struct MemoryStore<K> {
    objects: DashMap<ResourceKey, K>,
    history: Mutex<Vec<K>>,
    version: AtomicU64,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            history: Mutex::new(Vec::new()),
            version: AtomicU64::new(1),
        }
    }
}

/// Whether `labels` satisfy an equality selector (`a=b,c=d`, `a==b`, `a!=b`
/// or a bare `a` for existence)
pub fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| {
            let value_of = |key: &str| labels.and_then(|l| l.get(key.trim()));
            if let Some((key, value)) = term.split_once("!=") {
                value_of(key).map(|v| v != value.trim()).unwrap_or(true)
            } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
                value_of(key).map(|v| v == value.trim()).unwrap_or(false)
            } else {
                value_of(term).is_some()
            }
        })
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object as-is, assigning a resource version
    pub fn insert(&self, mut obj: K) -> K {
        self.stamp(&mut obj);
        self.objects.insert(ResourceKey::from_resource(&obj), obj.clone());
        self.history.lock().push(obj.clone());
        obj
    }

    /// Every revision written so far, oldest first
    pub fn history(&self) -> Vec<K> {
        self.history.lock().clone()
    }

    /// Revisions of one object, oldest first
    pub fn history_of(&self, name: &str) -> Vec<K> {
        self.history
            .lock()
            .iter()
            .filter(|o| o.meta().name.as_deref() == Some(name))
            .cloned()
            .collect()
    }

    pub fn contains(&self, namespace: Option<&str>, name: &str) -> bool {
        self.objects.contains_key(&key(namespace, name))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn stamp(&self, obj: &mut K) {
        let version = self.version.fetch_add(1, Ordering::SeqCst);
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    fn conflict(obj: &K) -> Error {
        Error::Conflict {
            kind: K::kind(&()).to_string(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }

    fn not_found(obj: &K) -> Error {
        Error::ResourceNotFound {
            kind: K::kind(&()).to_string(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }

    /// Load the stored copy of `obj`, checking its resource version
    fn current(&self, obj: &K) -> Result<K> {
        let k = ResourceKey::from_resource(obj);
        let stored = self
            .objects
            .get(&k)
            .map(|o| o.value().clone())
            .ok_or_else(|| Self::not_found(obj))?;
        let expected = obj.meta().resource_version.as_deref();
        if expected.is_some() && expected != stored.meta().resource_version.as_deref() {
            return Err(Self::conflict(obj));
        }
        Ok(stored)
    }

    /// Copy the `status` field of `from` into `into`
    fn with_status_of(into: &K, from: &K) -> Result<K> {
        let mut target = serde_json::to_value(into)?;
        let source = serde_json::to_value(from)?;
        if let Some(map) = target.as_object_mut() {
            match source.get("status") {
                Some(status) => {
                    map.insert("status".to_string(), status.clone());
                }
                None => {
                    map.remove("status");
                }
            }
        }
        Ok(serde_json::from_value(target)?)
    }

    fn commit(&self, mut obj: K) -> K {
        let k = ResourceKey::from_resource(&obj);
        let finalized = obj.meta().deletion_timestamp.is_some()
            && obj.meta().finalizers.as_ref().map(Vec::is_empty).unwrap_or(true);

        self.stamp(&mut obj);
        self.history.lock().push(obj.clone());
        if finalized {
            self.objects.remove(&k);
        } else {
            self.objects.insert(k, obj.clone());
        }
        obj
    }
}

fn key(namespace: Option<&str>, name: &str) -> ResourceKey {
    ResourceKey {
        namespace: namespace.map(str::to_string),
        name: name.to_string(),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        Ok(self.objects.get(&key(namespace, name)).map(|o| o.value().clone()))
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>> {
        let mut items: Vec<K> = self
            .objects
            .iter()
            .filter(|o| {
                label_selector
                    .map(|s| matches_selector(o.value().meta().labels.as_ref(), s))
                    .unwrap_or(true)
            })
            .map(|o| o.value().clone())
            .collect();
        items.sort_by(|a, b| ResourceKey::from_resource(a).cmp(&ResourceKey::from_resource(b)));
        Ok(items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let k = ResourceKey::from_resource(obj);
        if self.objects.contains_key(&k) {
            return Err(Error::ResourceExists {
                kind: K::kind(&()).to_string(),
                name: k.name,
            });
        }
        Ok(self.insert(obj.clone()))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let stored = self.current(obj)?;
        let mut next = Self::with_status_of(obj, &stored)?;
        // Deletion is requested through delete, never through update.
        next.meta_mut().deletion_timestamp = stored.meta().deletion_timestamp.clone();
        Ok(self.commit(next))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let stored = self.current(obj)?;
        let next = Self::with_status_of(&stored, obj)?;
        Ok(self.commit(next))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let k = key(namespace, name);
        let Some(mut obj) = self.objects.get(&k).map(|o| o.value().clone()) else {
            return Ok(());
        };
        let has_finalizers = obj
            .meta()
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            if obj.meta().deletion_timestamp.is_none() {
                obj.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                self.commit(obj);
            }
        } else {
            self.objects.remove(&k);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CStorPool, CStorPoolStatus, PoolPhase, POOL_FINALIZER};
    use crate::domain::types::Topology;
    use crate::testing::pool_resource;
    use assert_matches::assert_matches;

    #[test]
    fn test_matches_selector() {
        let labels: BTreeMap<String, String> = [
            ("cstorpool.openebs.io/uid".to_string(), "abcd".to_string()),
            ("app".to_string(), "cstor".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(matches_selector(Some(&labels), "cstorpool.openebs.io/uid=abcd"));
        assert!(matches_selector(Some(&labels), "app==cstor, cstorpool.openebs.io/uid=abcd"));
        assert!(matches_selector(Some(&labels), "app"));
        assert!(matches_selector(Some(&labels), "app!=other"));
        assert!(!matches_selector(Some(&labels), "cstorpool.openebs.io/uid=efgh"));
        assert!(!matches_selector(None, "app=cstor"));
        assert!(matches_selector(None, ""));
    }

    #[tokio::test]
    async fn test_update_checks_resource_version() {
        let store = MemoryStore::<CStorPool>::new();
        let stored = store.insert(pool_resource("1", Topology::Striped, &["d1"]));

        let mut first = stored.clone();
        first.spec.pool_spec.read_only = true;
        store.update(&first).await.unwrap();

        let mut stale = stored;
        stale.spec.pool_spec.cache_file = "/tmp/other".into();
        assert_matches!(store.update(&stale).await, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_and_status_are_separate() {
        let store = MemoryStore::<CStorPool>::new();
        let stored = store.insert(pool_resource("1", Topology::Striped, &["d1"]));

        let mut with_status = stored.clone();
        with_status.status = Some(CStorPoolStatus {
            phase: PoolPhase::Available,
            ..Default::default()
        });
        with_status.spec.pool_spec.read_only = true;
        let written = store.update_status(&with_status).await.unwrap();
        assert_eq!(written.phase(), PoolPhase::Available);
        assert!(!written.spec.pool_spec.read_only);

        let mut spec_change = written.clone();
        spec_change.status = None;
        spec_change.spec.pool_spec.read_only = true;
        let written = store.update(&spec_change).await.unwrap();
        assert!(written.spec.pool_spec.read_only);
        assert_eq!(written.phase(), PoolPhase::Available);
        assert_eq!(store.history_of("pool-a").len(), 3);
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::<CStorPool>::new();
        let mut csp = pool_resource("1", Topology::Striped, &["d1"]);
        csp.metadata.finalizers = Some(vec![POOL_FINALIZER.to_string()]);
        store.insert(csp);

        store.delete(None, "pool-a").await.unwrap();
        let deleting = store.get(None, "pool-a").await.unwrap().unwrap();
        assert!(deleting.is_deleting());

        let mut released = deleting;
        released.metadata.finalizers = Some(vec![]);
        store.update(&released).await.unwrap();
        assert!(store.get(None, "pool-a").await.unwrap().is_none());

        // Deleting something that is gone is fine.
        store.delete(None, "pool-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_with_selector() {
        let store = MemoryStore::<CStorPool>::new();
        let mut a = pool_resource("1", Topology::Striped, &["d1"]);
        a.metadata.name = Some("a".into());
        a.metadata.labels = Some([("tier".to_string(), "fast".to_string())].into_iter().collect());
        let mut b = pool_resource("2", Topology::Striped, &["d1"]);
        b.metadata.name = Some("b".into());
        store.insert(a);
        store.insert(b);

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let fast = store.list(Some("tier=fast")).await.unwrap();
        assert_eq!(fast.len(), 1);
        assert_eq!(fast[0].name(), "a");

        assert_matches!(
            store.create(&fast[0]).await,
            Err(Error::ResourceExists { .. })
        );
    }
}
