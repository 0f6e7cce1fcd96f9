use crate::action::{Action, CommandAction, PrecheckOutcome};
use crate::context::{ExecutionContext, TaskContext};
use crate::error::{EngineError, Result};
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::task::{fan_out, Task};
use async_trait::async_trait;
use kubexm_api::{ClusterConfig, PackageManager};
use std::sync::Arc;

/// Host sanity checks and node preparation, fanned out to every roster
/// host before anything is installed.
pub struct PreflightModule;

impl Module for PreflightModule {
    fn name(&self) -> &str {
        "preflight"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![Arc::new(SystemCheckTask), Arc::new(NodePrepTask)]
    }

    fn is_enabled(&self, config: &ClusterConfig) -> bool {
        !config.skip_preflight()
    }
}

/// Verifies the host is something we can manage at all.
pub struct SystemCheckTask;

#[async_trait]
impl Task for SystemCheckTask {
    fn name(&self) -> &str {
        "preflight-check"
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts: Vec<_> = ctx.registry().hosts().to_vec();
        fan_out(ctx, "system", &hosts, Arc::new(SystemCheckAction))
    }
}

struct SystemCheckAction;

#[async_trait]
impl Action for SystemCheckAction {
    fn describe(&self) -> String {
        "verify host OS, package manager and swap state".to_string()
    }

    async fn precheck(&self, _ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        // Checks are cheap and must run on every create.
        Ok(PrecheckOutcome::NotSatisfied)
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;

        if runner.facts().package_manager == PackageManager::Unknown {
            return Err(EngineError::Precondition(format!(
                "host {} has no supported package manager",
                ctx.current_host().name
            )));
        }

        let swap = runner.raw("swapon --noheadings 2>/dev/null || true", true).await?;
        if !swap.stdout.trim().is_empty() {
            // node-prep turns it off; flag it so the operator knows.
            tracing::warn!(host = %ctx.current_host().name, "swap is enabled");
        }
        Ok(())
    }
}

/// Kernel modules, sysctl and swap, with a marker file so re-runs skip.
pub struct NodePrepTask;

#[async_trait]
impl Task for NodePrepTask {
    fn name(&self) -> &str {
        "node-prep"
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts: Vec<_> = ctx.registry().hosts().to_vec();
        let action = CommandAction::new(
            "swapoff -a \
             && modprobe overlay && modprobe br_netfilter \
             && sysctl -w net.ipv4.ip_forward=1 \
             && mkdir -p /etc/kubexm && touch /etc/kubexm/.node-prep-done",
        )
        .sudo()
        .with_check("test -f /etc/kubexm/.node-prep-done");
        fan_out(ctx, "apply", &hosts, Arc::new(action))
    }
}
