//! Optimistic-concurrency persistence of versioned clusters
//!
//! Every write is conditioned on the version token read with the object.
//! [`update_cluster`] wraps the read-modify-write cycle and retries the
//! whole cycle when another writer got there first. No lock is held while
//! the mutation runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use parking_lot::RwLock;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use tessera_common::crd;
use tessera_common::retry::{retry_with_backoff_if, RetryConfig};
use tessera_common::{Error, FIELD_MANAGER};

use crate::{Cluster, ClusterError, Result};

/// Attempts [`update_cluster`] makes by default before giving up on conflicts
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 5;

/// An object together with the version token it was read at
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    /// The stored object
    pub object: T,
    /// Opaque version token; writes must present it
    pub version: String,
}

/// Storage of versioned cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read a cluster and its version token
    async fn get(&self, name: &str) -> std::result::Result<Option<Versioned<crd::Cluster>>, Error>;

    /// Every stored cluster
    async fn list(&self) -> std::result::Result<Vec<crd::Cluster>, Error>;

    /// Store a new cluster, returning its version token
    async fn create(&self, cluster: &crd::Cluster) -> std::result::Result<String, Error>;

    /// Overwrite a cluster if it is still at `version`, returning the new
    /// version token. Fails with a conflict otherwise.
    async fn replace(
        &self,
        cluster: &crd::Cluster,
        version: &str,
    ) -> std::result::Result<String, Error>;
}

fn object_name(cluster: &crd::Cluster) -> std::result::Result<String, Error> {
    cluster
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::validation_for("Cluster", "metadata.name is not set"))
}

/// Persist a newly created cluster
pub async fn create_cluster<S>(store: &S, cluster: &Cluster) -> Result<String>
where
    S: ClusterStore + ?Sized,
{
    let version = store.create(&cluster.export()).await?;
    debug!(cluster = %cluster.name(), %version, "cluster stored");
    Ok(version)
}

/// Read-modify-write a stored cluster.
///
/// `mutate` runs against a freshly read cluster on every attempt, so it
/// must derive its result from that cluster alone. The write is skipped
/// when `mutate` leaves the object unchanged.
#[instrument(skip(store, config, mutate))]
pub async fn update_cluster<S, F, T>(
    store: &S,
    name: &str,
    config: &RetryConfig,
    mutate: F,
) -> Result<T>
where
    S: ClusterStore + ?Sized,
    F: Fn(&mut Cluster) -> Result<T> + Send + Sync,
    T: Send,
{
    let mutate = &mutate;
    retry_with_backoff_if(
        config,
        "update_cluster",
        || update_once(store, name, mutate),
        ClusterError::is_conflict,
    )
    .await
}

async fn update_once<S, F, T>(store: &S, name: &str, mutate: &F) -> Result<T>
where
    S: ClusterStore + ?Sized,
    F: Fn(&mut Cluster) -> Result<T> + Send + Sync,
{
    let current = store
        .get(name)
        .await?
        .ok_or_else(|| Error::not_found("Cluster", name))?;

    let mut cluster = Cluster::from_versioned(&current.object)?;
    let output = mutate(&mut cluster)?;

    let mut updated = cluster.export();
    if updated.spec == current.object.spec && updated.status == current.object.status {
        return Ok(output);
    }
    updated.metadata = current.object.metadata.clone();

    let version = store.replace(&updated, &current.version).await?;
    debug!(cluster = %name, %version, "cluster updated");
    Ok(output)
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, crd::Cluster>,
    revision: u64,
}

/// Process-local store, versioned by a global revision counter
#[derive(Clone, Debug, Default)]
pub struct InMemoryClusterStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryClusterStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn stored_version(cluster: &crd::Cluster) -> &str {
    cluster.metadata.resource_version.as_deref().unwrap_or_default()
}

#[async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn get(&self, name: &str) -> std::result::Result<Option<Versioned<crd::Cluster>>, Error> {
        let state = self.state.read();
        Ok(state.objects.get(name).map(|object| Versioned {
            version: stored_version(object).to_string(),
            object: object.clone(),
        }))
    }

    async fn list(&self) -> std::result::Result<Vec<crd::Cluster>, Error> {
        Ok(self.state.read().objects.values().cloned().collect())
    }

    async fn create(&self, cluster: &crd::Cluster) -> std::result::Result<String, Error> {
        let name = object_name(cluster)?;
        let mut state = self.state.write();
        if state.objects.contains_key(&name) {
            return Err(Error::validation_for(
                format!("Cluster/{name}"),
                "already exists",
            ));
        }

        state.revision += 1;
        let version = state.revision.to_string();
        let mut object = cluster.clone();
        object.metadata.resource_version = Some(version.clone());
        state.objects.insert(name, object);
        Ok(version)
    }

    async fn replace(
        &self,
        cluster: &crd::Cluster,
        version: &str,
    ) -> std::result::Result<String, Error> {
        let name = object_name(cluster)?;
        let mut state = self.state.write();
        let current = state
            .objects
            .get(&name)
            .ok_or_else(|| Error::not_found("Cluster", &name))?;
        if stored_version(current) != version {
            return Err(Error::conflict(
                format!("Cluster/{name}"),
                format!(
                    "version {version} is stale, stored version is {}",
                    stored_version(current)
                ),
            ));
        }

        state.revision += 1;
        let new_version = state.revision.to_string();
        let mut object = cluster.clone();
        object.metadata.resource_version = Some(new_version.clone());
        state.objects.insert(name, object);
        Ok(new_version)
    }
}

/// Store backed by the Kubernetes API, versioned by `resourceVersion`
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<crd::Cluster> {
        Api::all(self.client.clone())
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    /// Write `status` onto `object`, conditioned on `object`'s resourceVersion
    async fn write_status(
        &self,
        mut object: crd::Cluster,
        status: Option<crd::ClusterStatus>,
    ) -> std::result::Result<String, Error> {
        let name = object_name(&object)?;
        object.status = status;
        let body = serde_json::to_vec(&object)
            .map_err(|e| Error::serialization_for_kind("Cluster", e.to_string()))?;
        let written = self
            .api()
            .replace_status(&name, &Self::post_params(), body)
            .await?;
        written.metadata.resource_version.ok_or_else(|| {
            Error::internal_with_context("write_status", "API returned no resourceVersion")
        })
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, name: &str) -> std::result::Result<Option<Versioned<crd::Cluster>>, Error> {
        let Some(object) = self.api().get_opt(name).await? else {
            return Ok(None);
        };
        let version = object.metadata.resource_version.clone().ok_or_else(|| {
            Error::internal_with_context("get", "API returned no resourceVersion")
        })?;
        Ok(Some(Versioned { object, version }))
    }

    async fn list(&self) -> std::result::Result<Vec<crd::Cluster>, Error> {
        Ok(self.api().list(&ListParams::default()).await?.items)
    }

    async fn create(&self, cluster: &crd::Cluster) -> std::result::Result<String, Error> {
        // The status subresource is ignored on create and written separately
        let created = self.api().create(&Self::post_params(), cluster).await?;
        self.write_status(created, cluster.status.clone()).await
    }

    async fn replace(
        &self,
        cluster: &crd::Cluster,
        version: &str,
    ) -> std::result::Result<String, Error> {
        let name = object_name(cluster)?;
        let mut object = cluster.clone();
        object.metadata.resource_version = Some(version.to_string());

        // A stale resourceVersion is rejected with 409 Conflict
        let replaced = self
            .api()
            .replace(&name, &Self::post_params(), &object)
            .await?;
        self.write_status(replaced, cluster.status.clone()).await
    }
}
