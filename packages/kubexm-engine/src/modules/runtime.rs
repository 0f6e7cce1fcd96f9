use crate::action::{Action, PrecheckOutcome};
use crate::context::{ExecutionContext, TaskContext};
use crate::error::Result;
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::task::{fan_out, Task};
use async_trait::async_trait;
use kubexm_api::RuntimeKind;
use std::sync::Arc;

/// Installs the configured container runtime on every kubernetes node.
/// Exactly one of the runtime tasks is required per cluster; the others
/// plan empty.
pub struct ContainerRuntimeModule;

impl Module for ContainerRuntimeModule {
    fn name(&self) -> &str {
        "container-runtime"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![
            Arc::new(ContainerdTask),
            Arc::new(DockerTask),
            Arc::new(CrioTask),
        ]
    }
}

/// Package install + config + service unit for one runtime flavour.
struct RuntimeInstallAction {
    package: &'static str,
    service: &'static str,
    configure: Option<&'static str>,
}

#[async_trait]
impl Action for RuntimeInstallAction {
    fn describe(&self) -> String {
        format!("install and enable {}", self.package)
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let runner = ctx.runner().await?;
        match runner.service_active(self.service).await {
            Ok(true) => Ok(PrecheckOutcome::Satisfied),
            Ok(false) => Ok(PrecheckOutcome::NotSatisfied),
            Err(_) => Ok(PrecheckOutcome::Indeterminate),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.install_package(self.package).await?;
        if let Some(configure) = self.configure {
            runner.raw(configure, true).await?;
        }
        runner.enable_service(self.service).await?;
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.stop_service(self.service).await?;
        runner.remove_package(self.package).await?;
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        true
    }
}

pub struct ContainerdTask;

#[async_trait]
impl Task for ContainerdTask {
    fn name(&self) -> &str {
        "containerd"
    }

    async fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.config().container_runtime_type() == RuntimeKind::Containerd)
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts = ctx.registry().kubernetes_hosts();
        let action = RuntimeInstallAction {
            package: "containerd",
            service: "containerd",
            configure: Some(
                "mkdir -p /etc/containerd && containerd config default > /etc/containerd/config.toml",
            ),
        };
        fan_out(ctx, "install", &hosts, Arc::new(action))
    }
}

pub struct DockerTask;

#[async_trait]
impl Task for DockerTask {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.config().container_runtime_type() == RuntimeKind::Docker)
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts = ctx.registry().kubernetes_hosts();
        let action = RuntimeInstallAction {
            package: "docker.io",
            service: "docker",
            configure: None,
        };
        fan_out(ctx, "install", &hosts, Arc::new(action))
    }
}

pub struct CrioTask;

#[async_trait]
impl Task for CrioTask {
    fn name(&self) -> &str {
        "crio"
    }

    async fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.config().container_runtime_type() == RuntimeKind::Crio)
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts = ctx.registry().kubernetes_hosts();
        let action = RuntimeInstallAction {
            package: "cri-o",
            service: "crio",
            configure: None,
        };
        fan_out(ctx, "install", &hosts, Arc::new(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnectorFactory;
    use crate::context::PipelineContext;
    use crate::registry::HostRegistry;
    use kubexm_api::ClusterConfig;

    fn task_ctx(runtime: &str) -> TaskContext {
        let runtime_block = if runtime.is_empty() {
            String::new()
        } else {
            format!("    containerRuntime:\n      type: {}\n", runtime)
        };
        let config = ClusterConfig::from_yaml(&format!(
            r#"
metadata:
  name: demo
spec:
  hosts:
    - name: n1
      address: 10.0.0.1
  roles:
    master: [n1]
  kubernetes:
    version: v1.29.2
{runtime_block}"#
        ))
        .unwrap();
        let registry = Arc::new(HostRegistry::from_config(&config).unwrap());
        PipelineContext::new(
            Arc::new(config),
            registry,
            Arc::new(MemoryConnectorFactory::new()),
        )
        .module_ctx("container-runtime")
        .task_ctx("containerd")
    }

    #[tokio::test]
    async fn test_containerd_is_default() {
        let ctx = task_ctx("");
        assert!(ContainerdTask.is_required(&ctx).await.unwrap());
        assert!(!DockerTask.is_required(&ctx).await.unwrap());
        assert!(!CrioTask.is_required(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_docker_config_disables_containerd() {
        let ctx = task_ctx("docker");
        assert!(!ContainerdTask.is_required(&ctx).await.unwrap());
        assert!(DockerTask.is_required(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_containerd_fans_out_to_kubernetes_hosts() {
        let ctx = task_ctx("");
        let frag = ContainerdTask.plan(&ctx).await.unwrap();
        assert_eq!(frag.len(), 1);
        assert!(frag.get(&"containerd-install-n1".into()).is_some());
    }
}
