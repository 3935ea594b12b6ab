//! Node join handshake, end to end
//!
//! A node builds its request from the cluster's public join key, the
//! authority fulfils it against the stored cluster, and the node opens the
//! result with nothing but its own symmetric key.

use tessera_cluster::{create_cluster, update_cluster, Cluster, ClusterStore, InMemoryClusterStore};
use tessera_common::retry::RetryConfig;
use tessera_common::CONTROL_PLANE_INGRESS_PEER;
use tessera_join::{AuthorityConfig, JoinAuthority, JoinError, JoinSession};
use tessera_pki::{verify_issued_by, CaRole, CertificateInfo};

const CONTAINERD: &str = "unix:///run/containerd/containerd.sock";

// =============================================================================
// Story: worker-1 joins the demo cluster
// =============================================================================

#[tokio::test]
async fn worker_joins_through_the_store() {
    let store = InMemoryClusterStore::new();
    let cluster = Cluster::new("demo", "10.0.0.0/16", vec![], vec![]).unwrap();
    create_cluster(&store, &cluster).await.unwrap();

    // Node side: only the public join key is known
    let join_key = cluster.join_key().unwrap().public_key().clone();
    let session = JoinSession::new("worker-1").unwrap();
    let spec = session.spec(&join_key, CONTAINERD, CONTAINERD, None).unwrap();
    let mut request = session.request("demo", spec);

    // Before fulfilment the node refuses to read anything
    assert!(matches!(
        session.decrypt_status(&request),
        Err(JoinError::NotIssued { .. })
    ));

    // Authority side: unwrap first, allocate through the store, then issue
    let authority = JoinAuthority::default();
    let key = authority
        .unwrap_symmetric_key(&cluster, &request.spec)
        .unwrap();
    let (peer, current) = update_cluster(
        &store,
        "demo",
        &RetryConfig::with_max_attempts(3),
        |cluster: &mut Cluster| {
            let peer = JoinAuthority::allocate_peer(cluster, "worker-1")?;
            Ok((peer, cluster.clone()))
        },
    )
    .await
    .unwrap();
    let status = authority.issue(&current, &request, &key, &peer).unwrap();
    assert!(status.is_issued());
    request.status = Some(status);

    // Node side again
    let bootstrap = session.decrypt_status(&request).unwrap();
    assert_eq!(bootstrap.kubernetes_version, "1.32.2");
    assert!(bootstrap.vpn_enabled);
    assert_eq!(bootstrap.vpn_address.to_string(), "10.0.0.2/32");
    assert_eq!(bootstrap.vpn_peers.len(), 1);
    assert_eq!(bootstrap.vpn_peers[0].name, CONTROL_PLANE_INGRESS_PEER);
    assert_eq!(bootstrap.vpn_peers[0].address.to_string(), "10.0.0.1/32");

    let stored = store.get("demo").await.unwrap().unwrap();
    let stored = Cluster::from_versioned(&stored.object).unwrap();
    let peer = stored.vpn_peer("worker-1").unwrap();
    assert_eq!(
        bootstrap.vpn_private_key.as_str(),
        peer.keys().private_key_base64()
    );
    assert_eq!(
        bootstrap.vpn_peers[0].public_key,
        stored
            .vpn_peer(CONTROL_PLANE_INGRESS_PEER)
            .unwrap()
            .keys()
            .public_key_base64()
    );

    // The kubelet serving certificate chains to the kubelet authority
    let kubelet_ca = stored.certificate_authorities().get(CaRole::Kubelet);
    assert!(verify_issued_by(&bootstrap.kubelet_server_certificate, kubelet_ca).unwrap());

    // The kubeconfig's client certificate identifies the node
    let kubeconfig: serde_json::Value = serde_yaml::from_str(&bootstrap.kube_config).unwrap();
    let client_cert = kubeconfig["users"][0]["user"]["client-certificate-data"]
        .as_str()
        .unwrap();
    let client_cert = String::from_utf8(
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, client_cert).unwrap(),
    )
    .unwrap();
    let info = CertificateInfo::from_pem(&client_cert).unwrap();
    assert_eq!(info.common_name, "system:node:worker-1");
    assert_eq!(info.organization.as_deref(), Some("system:nodes"));
    assert!(verify_issued_by(
        &client_cert,
        stored.certificate_authorities().get(CaRole::CertificateSigner)
    )
    .unwrap());
}

// =============================================================================
// Story: someone else's key cannot open the status
// =============================================================================

#[test]
fn eavesdropper_cannot_open_the_status() {
    let mut cluster = Cluster::new("demo", "10.0.0.0/16", vec![], vec![]).unwrap();
    let session = JoinSession::new("worker-1").unwrap();
    let spec = session
        .spec(cluster.join_key().unwrap().public_key(), CONTAINERD, CONTAINERD, None)
        .unwrap();
    let mut request = session.request("demo", spec);
    request.status = Some(JoinAuthority::default().fulfill(&mut cluster, &request).unwrap());

    let eavesdropper = JoinSession::new("worker-1").unwrap();
    assert!(matches!(
        eavesdropper.decrypt_status(&request),
        Err(JoinError::Open { .. })
    ));
}

// =============================================================================
// Story: a cluster joined without VPN
// =============================================================================

#[test]
fn vpn_disabled_cluster_still_issues_a_complete_status() {
    let mut cluster = Cluster::new("plain", "10.8.0.0/24", vec![], vec![]).unwrap();
    let authority = JoinAuthority::new(AuthorityConfig {
        vpn_enabled: false,
        api_server_endpoint: "https://plain.example.com:6443".to_string(),
        ..Default::default()
    });

    let session = JoinSession::new("worker-1").unwrap();
    let spec = session
        .spec(cluster.join_key().unwrap().public_key(), CONTAINERD, CONTAINERD, None)
        .unwrap();
    let mut request = session.request("plain", spec);
    let status = authority.fulfill(&mut cluster, &request).unwrap();

    assert!(!status.vpn_enabled);
    assert!(status.is_complete());
    request.status = Some(status);

    let bootstrap = session.decrypt_status(&request).unwrap();
    assert!(!bootstrap.vpn_enabled);
    let info = CertificateInfo::from_pem(&bootstrap.kubelet_server_certificate).unwrap();
    assert_eq!(info.subject_alt_names, vec!["worker-1".to_string()]);
    assert!(bootstrap
        .kube_config
        .contains("https://plain.example.com:6443"));
}
