use crate::action::CommandAction;
use crate::context::{ModuleContext, TaskContext};
use crate::error::Result;
use crate::graph::ExecutionFragment;
use crate::module::{compose_parallel, Module};
use crate::task::Task;
use async_trait::async_trait;
use kubexm_api::ClusterConfig;
use std::sync::Arc;

/// Applies the configured addons from the first master. Addons have no
/// ordering relationship with each other, so this module overrides the
/// sequential composer and fans its tasks out in parallel.
pub struct AddonsModule;

#[async_trait]
impl Module for AddonsModule {
    fn name(&self) -> &str {
        "addons"
    }

    // Tasks are derived from the config at plan time.
    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        Vec::new()
    }

    fn is_enabled(&self, config: &ClusterConfig) -> bool {
        !config.addons().is_empty()
    }

    async fn plan(&self, ctx: &ModuleContext) -> Result<ExecutionFragment> {
        let tasks: Vec<Arc<dyn Task>> = ctx
            .config()
            .addons()
            .iter()
            .map(|addon| Arc::new(AddonApplyTask::new(addon)) as Arc<dyn Task>)
            .collect();
        compose_parallel(&tasks, ctx).await
    }
}

pub struct AddonApplyTask {
    task_name: String,
    addon: String,
}

impl AddonApplyTask {
    pub fn new(addon: &str) -> Self {
        Self {
            task_name: format!("addon-{}", addon),
            addon: addon.to_string(),
        }
    }
}

#[async_trait]
impl Task for AddonApplyTask {
    fn name(&self) -> &str {
        &self.task_name
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let first = ctx.registry().first_master()?;
        let manifest = ctx
            .module()
            .pipeline()
            .layout()
            .host_dir(&first.name)
            .join("addons")
            .join(format!("{}.yaml", self.addon));
        let action = CommandAction::new(format!(
            "kubectl --kubeconfig /etc/kubernetes/admin.conf apply -f {}",
            manifest.display()
        ))
        .sudo();

        let mut fragment = ExecutionFragment::new();
        fragment.add_node(ctx.node("apply", &first, Arc::new(action)))?;
        fragment.calculate_frontiers();
        Ok(fragment)
    }
}
