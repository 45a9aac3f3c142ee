//! Resource store backed by the Kubernetes API

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::domain::ports::ResourceStore;
use crate::error::{Error, Result};

type ApiFactory<K> = fn(Client, Option<&str>) -> Api<K>;

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    Api::all(client)
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// [`ResourceStore`] over a kube [`Client`]
#[derive(Clone)]
pub struct KubeStore<K> {
    client: Client,
    api: ApiFactory<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    /// Store for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api: cluster_api::<K>,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    /// Store for a namespaced kind
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api: namespaced_api::<K>,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Api handle for one namespace, or for every namespace when `None`
    pub fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api)(self.client.clone(), namespace)
    }
}

fn name_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<&str> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::InvalidSpec(format!("{} without a name", kind_of::<K>())))
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

fn map_write_error<K: Resource<DynamicType = ()>>(name: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind_of::<K>(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.api(None).list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        self.api(obj.meta().namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(name, e))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        debug!(kind = %kind_of::<K>(), name, "Replacing resource");
        self.api(obj.meta().namespace.as_deref())
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(name, e))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        let body = serde_json::to_vec(obj)?;
        self.api(obj.meta().namespace.as_deref())
            .replace_status(name, &PostParams::default(), body)
            .await
            .map_err(|e| map_write_error::<K>(name, e))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
