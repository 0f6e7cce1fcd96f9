use crate::context::ModuleContext;
use crate::error::Result;
use crate::graph::{ExecutionFragment, NodeId};
use crate::task::Task;
use async_trait::async_trait;
use kubexm_api::ClusterConfig;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Middle planner level: an ordered list of tasks composed into one
/// fragment. The default composition is sequential frontier linking;
/// modules with parallel internals override `plan` (usually through
/// `compose_parallel`).
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn tasks(&self) -> Vec<Arc<dyn Task>>;

    /// Short-circuits planning entirely when the module does not apply
    /// to this cluster.
    fn is_enabled(&self, _config: &ClusterConfig) -> bool {
        true
    }

    async fn plan(&self, ctx: &ModuleContext) -> Result<ExecutionFragment> {
        compose_sequential(&self.tasks(), ctx).await
    }
}

/// The canonical sequential composer: each effective task's entry nodes
/// are linked onto the previous effective task's exit nodes. Skipped and
/// empty tasks contribute nothing; the first effective task's entries
/// become the module's entries.
pub async fn compose_sequential(
    tasks: &[Arc<dyn Task>],
    ctx: &ModuleContext,
) -> Result<ExecutionFragment> {
    let mut plan = ExecutionFragment::new();
    let mut prev_exits: BTreeSet<NodeId> = BTreeSet::new();

    for task in tasks {
        let tctx = ctx.task_ctx(task.name());
        if !task.is_required(&tctx).await? {
            debug!(module = ctx.module_name(), task = task.name(), "task not required");
            continue;
        }
        let fragment = task.plan(&tctx).await?;
        if fragment.is_empty() {
            debug!(module = ctx.module_name(), task = task.name(), "task planned empty");
            continue;
        }

        let task_entries = fragment.entry_nodes.clone();
        let task_exits = fragment.exit_nodes.clone();
        plan = ExecutionFragment::merge(plan, fragment)?;

        // The first effective task keeps no inbound edges, so its nodes
        // stay on the entry frontier when it is recomputed below.
        if !prev_exits.is_empty() {
            plan.link(&prev_exits, &task_entries)?;
        }
        prev_exits = task_exits;
    }

    plan.calculate_frontiers();
    plan.validate()?;
    Ok(plan)
}

/// Parallel composer override: all effective tasks run side by side;
/// entry and exit frontiers are the unions.
pub async fn compose_parallel(
    tasks: &[Arc<dyn Task>],
    ctx: &ModuleContext,
) -> Result<ExecutionFragment> {
    let mut plan = ExecutionFragment::new();

    for task in tasks {
        let tctx = ctx.task_ctx(task.name());
        if !task.is_required(&tctx).await? {
            debug!(module = ctx.module_name(), task = task.name(), "task not required");
            continue;
        }
        let fragment = task.plan(&tctx).await?;
        if fragment.is_empty() {
            continue;
        }
        plan = ExecutionFragment::merge(plan, fragment)?;
    }

    plan.calculate_frontiers();
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::tests_support::NoopAction;
    use crate::connector::MemoryConnectorFactory;
    use crate::context::{PipelineContext, TaskContext};
    use crate::registry::HostRegistry;
    use crate::task::fan_out;
    use kubexm_api::Role;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct FanOutTask {
        name: String,
        required: bool,
    }

    #[async_trait]
    impl Task for FanOutTask {
        fn name(&self) -> &str {
            &self.name
        }

        async fn is_required(&self, _ctx: &TaskContext) -> Result<bool> {
            Ok(self.required)
        }

        async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
            let hosts = ctx.hosts_by_role(Role::Master);
            fan_out(ctx, "run", &hosts, NoopAction::arc(&self.name))
        }
    }

    struct EmptyTask;

    #[async_trait]
    impl Task for EmptyTask {
        fn name(&self) -> &str {
            "empty"
        }

        async fn plan(&self, _ctx: &TaskContext) -> Result<ExecutionFragment> {
            Ok(ExecutionFragment::new())
        }
    }

    fn module_ctx() -> ModuleContext {
        let config = kubexm_api::ClusterConfig::from_yaml(
            r#"
metadata:
  name: demo
spec:
  hosts:
    - name: "m[1:2]"
      address: "10.0.0.[1:2]"
  roles:
    master: ["m[1:2]"]
"#,
        )
        .unwrap();
        let registry = Arc::new(HostRegistry::from_config(&config).unwrap());
        PipelineContext::new(
            Arc::new(config),
            registry,
            Arc::new(MemoryConnectorFactory::new()),
        )
        .module_ctx("test-module")
    }

    fn task(name: &str) -> Arc<dyn Task> {
        Arc::new(FanOutTask {
            name: name.to_string(),
            required: true,
        })
    }

    #[tokio::test]
    async fn test_sequential_composition_links_frontiers() {
        let ctx = module_ctx();
        let plan = compose_sequential(&[task("alpha"), task("beta")], &ctx)
            .await
            .unwrap();

        assert_eq!(plan.len(), 4);
        // Entries are alpha's fan-out, exits are beta's.
        assert!(plan.entry_nodes.iter().all(|id| id.as_str().starts_with("alpha")));
        assert!(plan.exit_nodes.iter().all(|id| id.as_str().starts_with("beta")));
        // Every beta node depends on every alpha node.
        for id in ["beta-run-m1", "beta-run-m2"] {
            let deps = &plan.get(&id.into()).unwrap().dependencies;
            assert_eq!(deps.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_not_required_tasks_are_skipped() {
        let ctx = module_ctx();
        let skipped: Arc<dyn Task> = Arc::new(FanOutTask {
            name: "skipped".to_string(),
            required: false,
        });
        let plan = compose_sequential(&[skipped, task("beta")], &ctx)
            .await
            .unwrap();

        assert_eq!(plan.len(), 2);
        // Beta became the first effective task: its nodes are the entries.
        assert!(plan.entry_nodes.iter().all(|id| id.as_str().starts_with("beta")));
        for id in plan.node_ids() {
            assert!(plan.get(id).unwrap().dependencies.is_empty());
        }
    }

    #[tokio::test]
    async fn test_empty_fragments_are_skipped() {
        let ctx = module_ctx();
        let plan = compose_sequential(
            &[task("alpha"), Arc::new(EmptyTask), task("beta")],
            &ctx,
        )
        .await
        .unwrap();

        // Beta still links onto alpha, not onto the empty task.
        let deps = &plan.get(&"beta-run-m1".into()).unwrap().dependencies;
        assert!(deps.contains(&"alpha-run-m1".into()));
        assert!(deps.contains(&"alpha-run-m2".into()));
    }

    #[tokio::test]
    async fn test_parallel_composition_unions_frontiers() {
        let ctx = module_ctx();
        let plan = compose_parallel(&[task("alpha"), task("beta")], &ctx)
            .await
            .unwrap();

        assert_eq!(plan.len(), 4);
        assert_eq!(plan.entry_nodes.len(), 4);
        assert_eq!(plan.exit_nodes.len(), 4);
    }

    #[tokio::test]
    async fn test_all_tasks_skipped_yields_empty_plan() {
        let ctx = module_ctx();
        let skipped: Arc<dyn Task> = Arc::new(FanOutTask {
            name: "skipped".to_string(),
            required: false,
        });
        let plan = compose_sequential(&[skipped], &ctx).await.unwrap();
        assert!(plan.is_empty());
    }
}
