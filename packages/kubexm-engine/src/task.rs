use crate::action::{Action, RetryPolicy};
use crate::context::TaskContext;
use crate::error::Result;
use crate::graph::ExecutionFragment;
use async_trait::async_trait;
use kubexm_api::Host;
use std::sync::Arc;

/// Smallest planner level: turns cluster state into one execution
/// fragment. A task is free to emit a single node, a parallel fan-out,
/// a chain, or any DAG, as long as its frontiers are honest. An empty
/// fragment is valid and skipped during composition.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Checked before `plan`; a non-required task contributes nothing.
    async fn is_required(&self, _ctx: &TaskContext) -> Result<bool> {
        Ok(true)
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment>;
}

/// One node per host, no mutual dependencies.
pub fn fan_out(
    ctx: &TaskContext,
    step: &str,
    hosts: &[Host],
    action: Arc<dyn Action>,
) -> Result<ExecutionFragment> {
    fan_out_with(ctx, step, hosts, action, RetryPolicy::default())
}

/// One node per host with a shared retry policy.
pub fn fan_out_with(
    ctx: &TaskContext,
    step: &str,
    hosts: &[Host],
    action: Arc<dyn Action>,
    retry: RetryPolicy,
) -> Result<ExecutionFragment> {
    let mut fragment = ExecutionFragment::new();
    for host in hosts {
        fragment.add_node(ctx.node(step, host, action.clone()).with_retry(retry))?;
    }
    fragment.calculate_frontiers();
    Ok(fragment)
}

/// A single control-node node.
pub fn single_local(
    ctx: &TaskContext,
    step: &str,
    action: Arc<dyn Action>,
) -> Result<ExecutionFragment> {
    let mut fragment = ExecutionFragment::new();
    fragment.add_node(ctx.local_node(step, action))?;
    fragment.calculate_frontiers();
    Ok(fragment)
}

/// Sequential steps on one host: each node depends on the previous.
pub fn chain_on_host(
    ctx: &TaskContext,
    steps: &[(&str, Arc<dyn Action>)],
    host: &Host,
) -> Result<ExecutionFragment> {
    let mut fragment = ExecutionFragment::new();
    let mut prev = None;
    for (step, action) in steps {
        let mut node = ctx.node(step, host, action.clone());
        if let Some(prev_id) = prev {
            node = node.after([prev_id]);
        }
        prev = Some(node.id.clone());
        fragment.add_node(node)?;
    }
    fragment.calculate_frontiers();
    Ok(fragment)
}
