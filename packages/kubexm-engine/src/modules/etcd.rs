use crate::action::{Action, Backoff, PrecheckOutcome, RetryPolicy};
use crate::context::{ExecutionContext, TaskContext};
use crate::error::Result;
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::task::{fan_out, fan_out_with, Task};
use async_trait::async_trait;
use kubexm_api::{ClusterConfig, EtcdKind, Host, Role};
use std::path::Path;
use std::sync::Arc;

const ETCD_DATA_DIR: &str = "/var/lib/etcd";
const ETCD_CLIENT_CERT: &str = "/etc/kubernetes/pki/etcd/client.crt";

/// Deploys the etcd cluster and distributes client credentials. With
/// `etcd.type = kubeadm` the control plane owns etcd and this module
/// stays out entirely; with `external` only the client PKI remains.
pub struct EtcdModule;

impl Module for EtcdModule {
    fn name(&self) -> &str {
        "etcd"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![Arc::new(EtcdInstallTask), Arc::new(EtcdClientPkiTask)]
    }

    fn is_enabled(&self, config: &ClusterConfig) -> bool {
        config.etcd_type() != EtcdKind::Kubeadm
    }
}

fn peer_url(host: &Host) -> String {
    format!("https://{}:2380", host.address)
}

fn client_url(host: &Host) -> String {
    format!("https://{}:2379", host.address)
}

/// Binary etcd deployment on the etcd-role hosts.
pub struct EtcdInstallTask;

#[async_trait]
impl Task for EtcdInstallTask {
    fn name(&self) -> &str {
        "etcd-install"
    }

    async fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.config().etcd_type() == EtcdKind::Internal)
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts = ctx.hosts_by_role(Role::Etcd);
        let initial_cluster: Vec<String> = hosts
            .iter()
            .map(|h| format!("{}={}", h.name, peer_url(h)))
            .collect();
        let action = EtcdInstallAction {
            initial_cluster: initial_cluster.join(","),
        };
        // Cluster bootstrap is sensitive to transient peer races; give
        // every member a few attempts.
        let retry = RetryPolicy::attempts(3).with_backoff(Backoff::Exponential { base_ms: 500 });
        fan_out_with(ctx, "run", &hosts, Arc::new(action), retry)
    }
}

struct EtcdInstallAction {
    initial_cluster: String,
}

#[async_trait]
impl Action for EtcdInstallAction {
    fn describe(&self) -> String {
        "install etcd member and start the service".to_string()
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let runner = ctx.runner().await?;
        match runner.service_active("etcd").await {
            Ok(true) => Ok(PrecheckOutcome::Satisfied),
            Ok(false) => Ok(PrecheckOutcome::NotSatisfied),
            Err(_) => Ok(PrecheckOutcome::Indeterminate),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        let host = ctx.current_host();

        runner.mkdir_p(Path::new(ETCD_DATA_DIR)).await?;
        runner.install_package("etcd").await?;

        let conf = format!(
            "ETCD_NAME={}\n\
             ETCD_DATA_DIR={}\n\
             ETCD_LISTEN_PEER_URLS={}\n\
             ETCD_LISTEN_CLIENT_URLS={}\n\
             ETCD_INITIAL_ADVERTISE_PEER_URLS={}\n\
             ETCD_ADVERTISE_CLIENT_URLS={}\n\
             ETCD_INITIAL_CLUSTER={}\n\
             ETCD_INITIAL_CLUSTER_STATE=new\n",
            host.name,
            ETCD_DATA_DIR,
            peer_url(host),
            client_url(host),
            peer_url(host),
            client_url(host),
            self.initial_cluster,
        );
        runner
            .write_file(&conf, Path::new("/etc/etcd/etcd.conf"), "0644", None)
            .await?;
        runner.daemon_reload().await?;
        runner.enable_service("etcd").await?;
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.stop_service("etcd").await?;
        runner.remove_path(Path::new(ETCD_DATA_DIR)).await?;
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        true
    }
}

/// Client certificates for the apiserver, on the masters. Runs for both
/// internal and external etcd; with external etcd the endpoints come
/// from the config.
pub struct EtcdClientPkiTask;

#[async_trait]
impl Task for EtcdClientPkiTask {
    fn name(&self) -> &str {
        "etcd-pki"
    }

    async fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(matches!(
            ctx.config().etcd_type(),
            EtcdKind::Internal | EtcdKind::External
        ))
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let masters = ctx.hosts_by_role(Role::Master);
        let endpoints = match ctx.config().etcd_type() {
            EtcdKind::External => ctx.config().external_etcd_endpoints().to_vec(),
            _ => ctx
                .hosts_by_role(Role::Etcd)
                .iter()
                .map(client_url)
                .collect(),
        };
        let action = EtcdClientPkiAction {
            endpoints: endpoints.join(","),
        };
        fan_out(ctx, "client-certs", &masters, Arc::new(action))
    }
}

struct EtcdClientPkiAction {
    endpoints: String,
}

#[async_trait]
impl Action for EtcdClientPkiAction {
    fn describe(&self) -> String {
        "issue etcd client certificates".to_string()
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let runner = ctx.runner().await?;
        match runner.file_exists(Path::new(ETCD_CLIENT_CERT)).await {
            Ok(true) => Ok(PrecheckOutcome::Satisfied),
            Ok(false) => Ok(PrecheckOutcome::NotSatisfied),
            Err(_) => Ok(PrecheckOutcome::Indeterminate),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner
            .mkdir_p(Path::new("/etc/kubernetes/pki/etcd"))
            .await?;
        runner
            .raw(
                "openssl req -x509 -newkey rsa:2048 -nodes \
                 -keyout /etc/kubernetes/pki/etcd/client.key \
                 -out /etc/kubernetes/pki/etcd/client.crt \
                 -days 3650 -subj /CN=kube-apiserver-etcd-client",
                true,
            )
            .await?;
        runner
            .write_file(
                &self.endpoints,
                Path::new("/etc/kubernetes/pki/etcd/endpoints"),
                "0644",
                None,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnectorFactory;
    use crate::context::PipelineContext;
    use crate::registry::HostRegistry;
    use pretty_assertions::assert_eq;

    fn module_ctx(etcd_type: &str) -> crate::context::ModuleContext {
        let etcd_block = if etcd_type.is_empty() {
            String::new()
        } else {
            format!("  etcd:\n    type: {}\n", etcd_type)
        };
        let config = ClusterConfig::from_yaml(&format!(
            r#"
metadata:
  name: demo
spec:
  hosts:
    - name: "m[1:3]"
      address: "10.0.0.[1:3]"
  roles:
    master: ["m[1:3]"]
    etcd: ["m[1:3]"]
{etcd_block}"#
        ))
        .unwrap();
        let registry = Arc::new(HostRegistry::from_config(&config).unwrap());
        PipelineContext::new(
            Arc::new(config),
            registry,
            Arc::new(MemoryConnectorFactory::new()),
        )
        .module_ctx("etcd")
    }

    #[tokio::test]
    async fn test_internal_etcd_plans_install_and_pki() {
        let mctx = module_ctx("");
        let install_ctx = mctx.task_ctx("etcd-install");
        assert!(EtcdInstallTask.is_required(&install_ctx).await.unwrap());

        let frag = EtcdInstallTask.plan(&install_ctx).await.unwrap();
        assert_eq!(frag.len(), 3);
        let node = frag.get(&"etcd-install-run-m1".into()).unwrap();
        assert_eq!(node.retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_external_etcd_skips_install_but_keeps_pki() {
        let mctx = module_ctx("external");
        assert!(
            !EtcdInstallTask
                .is_required(&mctx.task_ctx("etcd-install"))
                .await
                .unwrap()
        );
        assert!(
            EtcdClientPkiTask
                .is_required(&mctx.task_ctx("etcd-pki"))
                .await
                .unwrap()
        );

        let frag = EtcdClientPkiTask
            .plan(&mctx.task_ctx("etcd-pki"))
            .await
            .unwrap();
        assert_eq!(frag.len(), 3); // one per master
    }

    #[test]
    fn test_kubeadm_etcd_disables_module() {
        let config = module_ctx("kubeadm");
        assert!(!EtcdModule.is_enabled(config.config()));
    }
}
