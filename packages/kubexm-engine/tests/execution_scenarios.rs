//! End-to-end execution scenarios over the in-memory transport:
//! happy-path create, abort with rollback, and the join-credential
//! hand-off between control-plane nodes.

use kubexm_api::ClusterConfig;
use kubexm_engine::{
    run_pipeline_with, MemoryConnectorFactory, NodeId, NodeStatus, PipelineOptions,
    PipelineStatus,
};
use std::sync::Arc;

const JOIN_LINE: &str = "You can now join any number of machines:\n\
    kubeadm join lb.kubexm.local:6443 --token abcdef.0123456789abcdef \\\n\
    --discovery-token-ca-cert-hash sha256:1234abcd";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn single_node_config() -> ClusterConfig {
    ClusterConfig::from_yaml(
        r#"
metadata:
  name: demo
spec:
  hosts:
    - name: n1
      address: 10.0.0.1
  roles:
    master: [n1]
    worker: [n1]
    etcd: [n1]
  kubernetes:
    version: v1.29.2
  network:
    plugin: calico
"#,
    )
    .unwrap()
}

fn ha_config() -> ClusterConfig {
    ClusterConfig::from_yaml(
        r#"
metadata:
  name: prod
spec:
  hosts:
    - name: "m[1:3]"
      address: "10.0.0.[1:3]"
    - name: "w[1:2]"
      address: "10.0.1.[1:2]"
  roles:
    master: ["m[1:3]"]
    etcd: ["m[1:3]"]
    worker: ["w[1:2]"]
  kubernetes:
    version: v1.29.2
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn single_node_create_succeeds_end_to_end() {
    init_tracing();
    let factory = Arc::new(MemoryConnectorFactory::new());
    factory.respond(Some("n1"), "kubeadm init", JOIN_LINE, 0);

    let report = run_pipeline_with(
        "create-cluster",
        single_node_config(),
        PipelineOptions::default(),
        factory.clone(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, PipelineStatus::Success);
    assert!(report
        .records
        .iter()
        .all(|r| r.status == NodeStatus::Success));
    assert!(report.rollback_records.is_empty());

    let commands = factory.log().commands_for("n1");
    assert!(commands.iter().any(|c| c.contains("kubeadm init")));
    assert!(commands.iter().any(|c| c.contains("apt-get install -y containerd")));
    assert!(commands.iter().any(|c| c.contains("apply -f") && c.contains("calico")));
    // The sole node never joins anything.
    assert!(!commands.iter().any(|c| c.contains("kubeadm join")));
}

#[tokio::test]
async fn etcd_failure_aborts_and_rolls_back_in_reverse_order() {
    init_tracing();
    let factory = Arc::new(MemoryConnectorFactory::new());
    factory.fail_command("m2", "install -y etcd", None);

    let report = run_pipeline_with(
        "create-cluster",
        ha_config(),
        PipelineOptions::default(),
        factory.clone(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("install -y etcd"));

    // The failing member exhausted its three attempts.
    let failed = report.node(&NodeId::from("etcd-install-run-m2")).unwrap();
    assert_eq!(failed.status, NodeStatus::Failed);
    assert_eq!(failed.attempts, 3);

    // Nothing downstream was dispatched.
    for id in [
        "etcd-pki-client-certs-m1",
        "init-master-run-m1",
        "join-master-run-m2",
        "join-worker-run-w1",
    ] {
        assert_eq!(
            report.node(&NodeId::from(id)).unwrap().status,
            NodeStatus::Cancelled,
            "expected {} cancelled",
            id
        );
    }
    assert_eq!(factory.log().count_matching("kubeadm init"), 0);

    // Rollback touched the successful members and runtimes, members
    // first (reverse topological order), and succeeded everywhere.
    let rollback_ids: Vec<String> = report
        .rollback_records
        .iter()
        .map(|r| r.id.to_string())
        .collect();
    assert!(rollback_ids.contains(&"etcd-install-run-m1".to_string()));
    assert!(rollback_ids.contains(&"containerd-install-m1".to_string()));
    let etcd_pos = rollback_ids
        .iter()
        .position(|id| id == "etcd-install-run-m1")
        .unwrap();
    let runtime_pos = rollback_ids
        .iter()
        .position(|id| id == "containerd-install-m1")
        .unwrap();
    assert!(etcd_pos < runtime_pos);
    assert!(report
        .rollback_records
        .iter()
        .all(|r| r.status == NodeStatus::Success));

    let m1_commands = factory.log().commands_for("m1");
    assert!(m1_commands.iter().any(|c| c.contains("systemctl stop etcd")));
    assert!(m1_commands.iter().any(|c| c.contains("apt-get remove -y containerd")));
}

#[tokio::test]
async fn retain_on_failure_keeps_partial_state() {
    let factory = Arc::new(MemoryConnectorFactory::new());
    factory.fail_command("m2", "install -y etcd", None);

    let options = PipelineOptions {
        retain_on_failure: true,
        ..Default::default()
    };
    let report = run_pipeline_with("create-cluster", ha_config(), options, factory.clone())
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert!(report.rollback_records.is_empty());
    assert_eq!(factory.log().count_matching("systemctl stop etcd"), 0);
}

#[tokio::test]
async fn join_nodes_read_the_credentials_init_published() {
    let config = ClusterConfig::from_yaml(
        r#"
metadata:
  name: demo
spec:
  hosts:
    - name: "m[1:2]"
      address: "10.0.0.[1:2]"
    - name: w1
      address: 10.0.0.3
  roles:
    master: ["m[1:2]"]
    etcd: ["m[1:2]"]
    worker: [w1]
  kubernetes:
    version: v1.29.2
"#,
    )
    .unwrap();

    let factory = Arc::new(MemoryConnectorFactory::new());
    factory.respond(Some("m1"), "kubeadm init", JOIN_LINE, 0);

    let report = run_pipeline_with(
        "create-cluster",
        config,
        PipelineOptions::default(),
        factory.clone(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, PipelineStatus::Success);

    // The second master joined as control plane with the token and CA
    // hash parsed out of the init output on m1.
    let m2_join = factory
        .log()
        .commands_for("m2")
        .into_iter()
        .find(|c| c.contains("kubeadm join"))
        .expect("m2 joined the control plane");
    assert!(m2_join.contains("--token abcdef.0123456789abcdef"));
    assert!(m2_join.contains("--discovery-token-ca-cert-hash sha256:1234abcd"));
    assert!(m2_join.contains("--control-plane"));

    // The worker joined with the same credentials, without the
    // control-plane flag.
    let w1_join = factory
        .log()
        .commands_for("w1")
        .into_iter()
        .find(|c| c.contains("kubeadm join"))
        .expect("w1 joined as worker");
    assert!(w1_join.contains("--token abcdef.0123456789abcdef"));
    assert!(!w1_join.contains("--control-plane"));

    // The hand-off is sound only because of the dependency edge: the
    // join record started after the init record ended.
    let init = report.node(&NodeId::from("init-master-run-m1")).unwrap();
    let join = report.node(&NodeId::from("join-master-run-m2")).unwrap();
    assert!(init.ended_at.unwrap() <= join.started_at.unwrap());
}

#[tokio::test]
async fn delete_cluster_resets_every_host_despite_failures() {
    let factory = Arc::new(MemoryConnectorFactory::new());
    // One host is already unreachable mid-teardown.
    factory.fail_command("n2", "kubeadm reset", None);

    let config = ClusterConfig::from_yaml(
        r#"
metadata:
  name: demo
spec:
  hosts:
    - name: "n[1:3]"
      address: "10.0.0.[1:3]"
  roles:
    master: [n1]
    worker: ["n[2:3]"]
"#,
    )
    .unwrap();

    let report = run_pipeline_with(
        "delete-cluster",
        config,
        PipelineOptions::default(),
        factory.clone(),
    )
    .await
    .unwrap();

    // The failing host is recorded but does not sink the teardown.
    assert_eq!(report.status, PipelineStatus::Success);
    assert_eq!(
        report.node(&NodeId::from("kubeadm-reset-run-n2")).unwrap().status,
        NodeStatus::Skipped
    );
    assert_eq!(factory.log().count_matching("kubeadm reset"), 3);
    // Workspace cleanup still ran on the control node.
    assert_eq!(
        report
            .node(&NodeId::from("cleanup-workspace-run"))
            .unwrap()
            .status,
        NodeStatus::Success
    );
}
