use crate::action::{Action, PrecheckOutcome};
use crate::context::{ExecutionContext, TaskContext};
use crate::error::{EngineError, Result};
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::task::{fan_out, Task};
use async_trait::async_trait;
use kubexm_api::Role;
use std::path::Path;
use std::sync::Arc;

const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";

/// Module-cache keys carrying the join credentials from init to join.
pub const CACHE_JOIN_TOKEN: &str = "join-token";
pub const CACHE_CA_CERT_HASH: &str = "ca-cert-hash";

/// Control plane bring-up: the first master initialises the cluster and
/// publishes the join credentials through the module cache; the other
/// masters and the workers consume them. The sequential task order
/// produces the init -> join-masters -> join-workers edges.
pub struct ControlPlaneModule;

impl Module for ControlPlaneModule {
    fn name(&self) -> &str {
        "control-plane"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![
            Arc::new(InitMasterTask),
            Arc::new(JoinMastersTask),
            Arc::new(JoinWorkersTask),
        ]
    }
}

fn control_plane_endpoint(ctx: &TaskContext) -> String {
    format!(
        "{}:{}",
        ctx.config().control_plane_domain(),
        ctx.config().control_plane_port()
    )
}

/// `kubeadm init` on the first master.
pub struct InitMasterTask;

#[async_trait]
impl Task for InitMasterTask {
    fn name(&self) -> &str {
        "init-master"
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let first = ctx.registry().first_master()?;
        let action = InitMasterAction {
            version: ctx.config().kubernetes_version().to_string(),
            pod_cidr: ctx.config().pod_cidr().to_string(),
            endpoint: control_plane_endpoint(ctx),
        };
        let mut fragment = ExecutionFragment::new();
        fragment.add_node(ctx.node("run", &first, Arc::new(action)))?;
        fragment.calculate_frontiers();
        Ok(fragment)
    }
}

struct InitMasterAction {
    version: String,
    pod_cidr: String,
    endpoint: String,
}

#[async_trait]
impl Action for InitMasterAction {
    fn describe(&self) -> String {
        format!("kubeadm init {}", self.version)
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let runner = ctx.runner().await?;
        match runner.file_exists(Path::new(ADMIN_CONF)).await {
            Ok(true) => Ok(PrecheckOutcome::Satisfied),
            Ok(false) => Ok(PrecheckOutcome::NotSatisfied),
            Err(_) => Ok(PrecheckOutcome::Indeterminate),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        let output = runner
            .raw(
                &format!(
                    "kubeadm init --kubernetes-version {} \
                     --pod-network-cidr {} \
                     --control-plane-endpoint {} \
                     --upload-certs",
                    self.version, self.pod_cidr, self.endpoint
                ),
                true,
            )
            .await?;

        let token = parse_flag_value(&output.stdout, "--token");
        let ca_hash = parse_flag_value(&output.stdout, "--discovery-token-ca-cert-hash");
        let (Some(token), Some(ca_hash)) = (token, ca_hash) else {
            return Err(EngineError::Precondition(
                "kubeadm init output carries no join credentials".to_string(),
            ));
        };

        // Published before the node completes; the executor's
        // happens-before guarantee makes them visible to the join nodes.
        let cache = ctx.module_cache();
        cache.put_as(CACHE_JOIN_TOKEN, &token)?;
        cache.put_as(CACHE_CA_CERT_HASH, &ca_hash)?;
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.raw("kubeadm reset -f", true).await?;
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        true
    }
}

/// Pull a flag's value out of a kubeadm join command line.
fn parse_flag_value(output: &str, flag: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == flag {
            return words
                .next()
                .map(|v| v.trim_end_matches('\\').to_string())
                .filter(|v| !v.is_empty());
        }
    }
    None
}

/// `kubeadm join --control-plane` on the remaining masters.
pub struct JoinMastersTask;

#[async_trait]
impl Task for JoinMastersTask {
    fn name(&self) -> &str {
        "join-master"
    }

    async fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.hosts_by_role(Role::Master).len() > 1)
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let others: Vec<_> = ctx
            .hosts_by_role(Role::Master)
            .into_iter()
            .skip(1)
            .collect();
        let action = JoinNodeAction {
            endpoint: control_plane_endpoint(ctx),
            control_plane: true,
        };
        fan_out(ctx, "run", &others, Arc::new(action))
    }
}

/// `kubeadm join` on worker-only hosts. Dual-role hosts already joined
/// with the control plane.
pub struct JoinWorkersTask;

#[async_trait]
impl Task for JoinWorkersTask {
    fn name(&self) -> &str {
        "join-worker"
    }

    async fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(!ctx.registry().worker_only_hosts().is_empty())
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let workers = ctx.registry().worker_only_hosts();
        let action = JoinNodeAction {
            endpoint: control_plane_endpoint(ctx),
            control_plane: false,
        };
        fan_out(ctx, "run", &workers, Arc::new(action))
    }
}

struct JoinNodeAction {
    endpoint: String,
    control_plane: bool,
}

#[async_trait]
impl Action for JoinNodeAction {
    fn describe(&self) -> String {
        if self.control_plane {
            "kubeadm join (control plane)".to_string()
        } else {
            "kubeadm join (worker)".to_string()
        }
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let runner = ctx.runner().await?;
        match runner.file_exists(Path::new(KUBELET_CONF)).await {
            Ok(true) => Ok(PrecheckOutcome::Satisfied),
            Ok(false) => Ok(PrecheckOutcome::NotSatisfied),
            Err(_) => Ok(PrecheckOutcome::Indeterminate),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let cache = ctx.module_cache();
        let token: Option<String> = cache.get_as(CACHE_JOIN_TOKEN);
        let ca_hash: Option<String> = cache.get_as(CACHE_CA_CERT_HASH);
        let (Some(token), Some(ca_hash)) = (token, ca_hash) else {
            return Err(EngineError::Precondition(
                "join credentials missing from the control-plane cache".to_string(),
            ));
        };

        let mut command = format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            self.endpoint, token, ca_hash
        );
        if self.control_plane {
            command.push_str(" --control-plane");
        }

        let runner = ctx.runner().await?;
        runner.raw(&command, true).await?;
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.raw("kubeadm reset -f", true).await?;
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        true
    }
}
