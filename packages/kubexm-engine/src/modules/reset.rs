use crate::action::CommandAction;
use crate::context::TaskContext;
use crate::error::Result;
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::task::{single_local, Task};
use async_trait::async_trait;
use std::sync::Arc;

/// Tears the cluster down: `kubeadm reset` everywhere, then the local
/// workspace cleanup. Reset keeps going past partially-provisioned
/// hosts, so its nodes tolerate failure.
pub struct ResetModule;

impl Module for ResetModule {
    fn name(&self) -> &str {
        "reset"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![Arc::new(ResetNodesTask), Arc::new(CleanupWorkspaceTask)]
    }
}

pub struct ResetNodesTask;

#[async_trait]
impl Task for ResetNodesTask {
    fn name(&self) -> &str {
        "kubeadm-reset"
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let action: Arc<CommandAction> = Arc::new(
            CommandAction::new(
                "kubeadm reset -f && rm -rf /etc/kubexm /var/lib/etcd /etc/etcd",
            )
            .sudo(),
        );
        let mut fragment = ExecutionFragment::new();
        for host in ctx.registry().hosts() {
            fragment.add_node(
                ctx.node("run", host, action.clone()).ignoring_failure(),
            )?;
        }
        fragment.calculate_frontiers();
        Ok(fragment)
    }
}

pub struct CleanupWorkspaceTask;

#[async_trait]
impl Task for CleanupWorkspaceTask {
    fn name(&self) -> &str {
        "cleanup-workspace"
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let root = ctx.module().pipeline().layout().root().to_path_buf();
        let action = CommandAction::new(format!("rm -rf {}", root.display()));
        single_local(ctx, "run", Arc::new(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnectorFactory;
    use crate::context::PipelineContext;
    use crate::registry::HostRegistry;
    use kubexm_api::ClusterConfig;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_reset_tolerates_host_failures() {
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
        let registry = Arc::new(HostRegistry::from_config(&config).unwrap());
        let ctx = PipelineContext::new(
            Arc::new(config),
            registry,
            Arc::new(MemoryConnectorFactory::new()),
        )
        .module_ctx("reset")
        .task_ctx("kubeadm-reset");

        let frag = ResetNodesTask.plan(&ctx).await.unwrap();
        assert_eq!(frag.len(), 3);
        for id in frag.node_ids() {
            assert!(frag.get(id).unwrap().ignore_failure);
        }
    }
}
