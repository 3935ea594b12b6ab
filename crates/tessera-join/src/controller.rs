//! NodeJoinRequest controller
//!
//! Reconciles pending join requests: the target cluster is named by the
//! `tessera.dev/cluster` label, the node's VPN peer is allocated through the
//! cluster store, and the sealed status is written with `Issued=True` in a
//! single status patch. Issued requests are terminal and never touched again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use tessera_cluster::store::DEFAULT_UPDATE_ATTEMPTS;
use tessera_cluster::{update_cluster, Cluster, ClusterStore};
use tessera_common::crd::{NodeJoinRequest, NodeJoinRequestStatus};
use tessera_common::retry::RetryConfig;
use tessera_common::{Error, CLUSTER_LABEL_KEY, FIELD_MANAGER};

use crate::authority::JoinAuthority;
use crate::JoinError;

/// Status writes for NodeJoinRequests
///
/// Abstracted so the reconciler can be tested without an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoinRequestClient: Send + Sync {
    /// Merge `status` into the request's status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeJoinRequestStatus,
    ) -> Result<(), Error>;
}

/// [`JoinRequestClient`] backed by the Kubernetes API
pub struct KubeJoinRequestClient {
    client: Client,
}

impl KubeJoinRequestClient {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JoinRequestClient for KubeJoinRequestClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeJoinRequestStatus,
    ) -> Result<(), Error> {
        let api: Api<NodeJoinRequest> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared state for the join controller
pub struct Context {
    /// Status writer for join requests
    pub kube: Arc<dyn JoinRequestClient>,
    /// Where managed clusters live
    pub store: Arc<dyn ClusterStore>,
    /// Issues join material
    pub authority: JoinAuthority,
    /// Retry policy for contended cluster updates
    pub retry: RetryConfig,
}

impl Context {
    /// Context that retries contended updates a bounded number of times
    pub fn new(
        kube: Arc<dyn JoinRequestClient>,
        store: Arc<dyn ClusterStore>,
        authority: JoinAuthority,
    ) -> Self {
        Self {
            kube,
            store,
            authority,
            retry: RetryConfig::with_max_attempts(DEFAULT_UPDATE_ATTEMPTS),
        }
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Reconcile one NodeJoinRequest
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn reconcile(
    request: Arc<NodeJoinRequest>,
    ctx: Arc<Context>,
) -> Result<Action, JoinError> {
    if request.is_issued() {
        debug!("join request already issued");
        return Ok(Action::await_change());
    }

    let node = request.name_any();
    let Some(cluster_name) = request.labels().get(CLUSTER_LABEL_KEY).cloned() else {
        // Nothing to do until the label is added
        warn!(label = CLUSTER_LABEL_KEY, "join request does not name a cluster");
        return Ok(Action::await_change());
    };

    // Unwrap the key before allocating so a malformed request costs no address
    let stored = ctx
        .store
        .get(&cluster_name)
        .await?
        .ok_or_else(|| Error::not_found("Cluster", &cluster_name))?;
    let current = Cluster::from_versioned(&stored.object)?;
    let key = ctx
        .authority
        .unwrap_symmetric_key(&current, &request.spec)?;

    let (peer, cluster) = update_cluster(
        ctx.store.as_ref(),
        &cluster_name,
        &ctx.retry,
        |cluster: &mut Cluster| {
            let peer = JoinAuthority::allocate_peer(cluster, &node)?;
            Ok((peer, cluster.clone()))
        },
    )
    .await?;

    let status = ctx.authority.issue(&cluster, &request, &key, &peer)?;
    let namespace = request.namespace().unwrap_or_default();
    ctx.kube.patch_status(&namespace, &node, &status).await?;

    info!(cluster = %cluster_name, address = %peer.address(), "join request fulfilled");
    Ok(Action::await_change())
}

/// Requeue policy for failed reconciliations
pub fn error_policy(request: Arc<NodeJoinRequest>, error: &JoinError, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(%error, request = %request.name_any(), "join reconciliation failed, retrying");
        Action::requeue(Duration::from_secs(5))
    } else {
        error!(%error, request = %request.name_any(), "join reconciliation failed");
        Action::requeue(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tessera_cluster::{create_cluster, InMemoryClusterStore};
    use tessera_common::crd::{Condition, ConditionStatus, ISSUED_CONDITION};

    use crate::node::JoinSession;

    const CONTAINERD: &str = "unix:///run/containerd/containerd.sock";

    async fn store_with_demo() -> (Arc<InMemoryClusterStore>, Cluster) {
        let store = Arc::new(InMemoryClusterStore::new());
        let cluster = Cluster::new("demo", "10.0.0.0/16", vec![], vec![]).unwrap();
        create_cluster(store.as_ref(), &cluster).await.unwrap();
        (store, cluster)
    }

    fn join_request(session: &JoinSession, cluster: &Cluster) -> NodeJoinRequest {
        let spec = session
            .spec(cluster.join_key().unwrap().public_key(), CONTAINERD, CONTAINERD, None)
            .unwrap();
        let mut request = session.request(cluster.name(), spec);
        request.metadata.namespace = Some("nodes".to_string());
        request
    }

    fn context(kube: MockJoinRequestClient, store: Arc<InMemoryClusterStore>) -> Arc<Context> {
        Arc::new(
            Context::new(Arc::new(kube), store, JoinAuthority::default())
                .with_retry(RetryConfig::with_max_attempts(3)),
        )
    }

    // =========================================================================
    // Story: a pending request is fulfilled exactly once
    // =========================================================================

    #[tokio::test]
    async fn pending_request_is_issued_in_one_status_write() {
        let (store, cluster) = store_with_demo().await;
        let session = JoinSession::new("node-a").unwrap();
        let request = join_request(&session, &cluster);

        let written: Arc<Mutex<Option<NodeJoinRequestStatus>>> = Arc::new(Mutex::new(None));
        let capture = written.clone();
        let mut kube = MockJoinRequestClient::new();
        kube.expect_patch_status()
            .withf(|namespace, name, status| {
                namespace == "nodes" && name == "node-a" && status.is_issued()
            })
            .times(1)
            .returning(move |_, _, status| {
                *capture.lock().unwrap() = Some(status.clone());
                Ok(())
            });

        let action = reconcile(Arc::new(request.clone()), context(kube, store.clone()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        let mut issued = request;
        issued.status = written.lock().unwrap().take();
        let bootstrap = session.decrypt_status(&issued).unwrap();
        assert_eq!(bootstrap.vpn_address.to_string(), "10.0.0.2/32");

        let stored = store.get("demo").await.unwrap().unwrap();
        let restored = Cluster::from_versioned(&stored.object).unwrap();
        assert_eq!(
            restored.vpn_peer("node-a").unwrap().address().to_string(),
            "10.0.0.2/32"
        );
    }

    #[tokio::test]
    async fn issued_request_is_left_alone() {
        let (store, cluster) = store_with_demo().await;
        let session = JoinSession::new("node-a").unwrap();
        let mut request = join_request(&session, &cluster);
        request.status = Some(NodeJoinRequestStatus {
            conditions: vec![Condition::new(
                ISSUED_CONDITION,
                ConditionStatus::True,
                "Issued",
                "",
            )],
            ..Default::default()
        });

        let mut kube = MockJoinRequestClient::new();
        kube.expect_patch_status().times(0);

        let action = reconcile(Arc::new(request), context(kube, store.clone()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        let stored = store.get("demo").await.unwrap().unwrap();
        assert_eq!(Cluster::from_versioned(&stored.object).unwrap().vpn_peers().len(), 1);
    }

    #[tokio::test]
    async fn unlabelled_request_waits_for_a_label() {
        let (store, cluster) = store_with_demo().await;
        let session = JoinSession::new("node-a").unwrap();
        let mut request = join_request(&session, &cluster);
        request.metadata.labels = None;

        let mut kube = MockJoinRequestClient::new();
        kube.expect_patch_status().times(0);

        let action = reconcile(Arc::new(request), context(kube, store))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Story: failures leave the request pending
    // =========================================================================

    #[tokio::test]
    async fn unknown_cluster_is_not_retried_quickly() {
        let store = Arc::new(InMemoryClusterStore::new());
        let cluster = Cluster::new("elsewhere", "10.0.0.0/16", vec![], vec![]).unwrap();
        let session = JoinSession::new("node-a").unwrap();
        let request = Arc::new(join_request(&session, &cluster));

        let mut kube = MockJoinRequestClient::new();
        kube.expect_patch_status().times(0);
        let ctx = context(kube, store);

        let err = reconcile(request.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, JoinError::Api(Error::NotFound { .. })));
        assert_eq!(
            error_policy(request, &err, ctx),
            Action::requeue(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn failed_status_write_is_retried_with_the_same_address() {
        let (store, cluster) = store_with_demo().await;
        let session = JoinSession::new("node-a").unwrap();
        let request = Arc::new(join_request(&session, &cluster));

        let addresses: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let capture = addresses.clone();
        let key = session.key().clone();
        let mut seq = mockall::Sequence::new();
        let mut kube = MockJoinRequestClient::new();
        kube.expect_patch_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Err(Error::internal_with_context(
                    "patch_status",
                    "apiserver unavailable",
                ))
            });
        kube.expect_patch_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, status| {
                let address = key.open_string("vpnAddress", &status.vpn_address).unwrap();
                capture.lock().unwrap().push(address.as_str().to_string());
                Ok(())
            });
        let ctx = context(kube, store.clone());

        let err = reconcile(request.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            error_policy(request.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );

        reconcile(request, ctx).await.unwrap();
        assert_eq!(*addresses.lock().unwrap(), vec!["10.0.0.2/32".to_string()]);

        let stored = store.get("demo").await.unwrap().unwrap();
        let restored = Cluster::from_versioned(&stored.object).unwrap();
        assert_eq!(restored.vpn_peers().len(), 2);
        assert_eq!(restored.vpn_allocation_counter(), 2);
    }
}
