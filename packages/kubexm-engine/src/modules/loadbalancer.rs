use crate::action::{Action, PrecheckOutcome};
use crate::context::{ExecutionContext, TaskContext};
use crate::error::Result;
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::task::{fan_out, Task};
use async_trait::async_trait;
use kubexm_api::{ClusterConfig, Role};
use std::path::Path;
use std::sync::Arc;

/// Local haproxy in front of the apiservers, one instance per master.
/// Only meaningful for HA control planes.
pub struct InternalLoadBalancerModule;

impl Module for InternalLoadBalancerModule {
    fn name(&self) -> &str {
        "internal-loadbalancer"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![Arc::new(HaproxyDeployTask)]
    }

    fn is_enabled(&self, config: &ClusterConfig) -> bool {
        config.internal_lb_type() == Some("haproxy") && config.master_count() > 1
    }
}

pub struct HaproxyDeployTask;

#[async_trait]
impl Task for HaproxyDeployTask {
    fn name(&self) -> &str {
        "haproxy"
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let masters = ctx.hosts_by_role(Role::Master);
        let backends: Vec<String> = masters
            .iter()
            .map(|m| {
                format!(
                    "    server {} {}:{} check",
                    m.name,
                    m.address,
                    ctx.config().control_plane_port()
                )
            })
            .collect();
        let config = format!(
            "frontend apiserver\n    bind *:{}\n    default_backend control-plane\n\
             backend control-plane\n    balance roundrobin\n{}\n",
            ctx.config().control_plane_port(),
            backends.join("\n"),
        );
        fan_out(ctx, "deploy", &masters, Arc::new(HaproxyDeployAction { config }))
    }
}

struct HaproxyDeployAction {
    config: String,
}

#[async_trait]
impl Action for HaproxyDeployAction {
    fn describe(&self) -> String {
        "deploy haproxy for the control plane endpoint".to_string()
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let runner = ctx.runner().await?;
        match runner.service_active("haproxy").await {
            Ok(true) => Ok(PrecheckOutcome::Satisfied),
            Ok(false) => Ok(PrecheckOutcome::NotSatisfied),
            Err(_) => Ok(PrecheckOutcome::Indeterminate),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.install_package("haproxy").await?;
        runner
            .write_file(
                &self.config,
                Path::new("/etc/haproxy/haproxy.cfg"),
                "0644",
                Some("root:root"),
            )
            .await?;
        runner.enable_service("haproxy").await?;
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.stop_service("haproxy").await?;
        runner.remove_package("haproxy").await?;
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        true
    }
}
