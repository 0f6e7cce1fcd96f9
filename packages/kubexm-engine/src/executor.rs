use crate::context::{ExecutionContext, PipelineContext};
use crate::error::{EngineError, Result};
use crate::graph::{ExecutionFragment, ExecutionNode, NodeId};
use crate::report::{NodeRecord, NodeStatus, PipelineStatus, Reporter};
use chrono::Utc;
use dashmap::DashMap;
use kubexm_api::Host;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 10;

/// Rollback runs outside the pipeline cancellation scope with its own,
/// shorter per-node deadline.
const ROLLBACK_NODE_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Global worker cap; ready nodes beyond it wait their turn.
    pub concurrency: usize,
    /// Stop dispatching after the first fatal node failure.
    pub abort_on_error: bool,
    /// Invoke rollback on successful nodes after a failure abort.
    pub rollback_on_abort: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            abort_on_error: true,
            rollback_on_abort: true,
        }
    }
}

impl ExecutorOptions {
    /// Cap scaled to the control node instead of the fixed default.
    pub fn auto() -> Self {
        Self {
            concurrency: num_cpus::get().clamp(2, DEFAULT_CONCURRENCY),
            ..Self::default()
        }
    }
}

/// Outcome of one executor run, folded into the pipeline report.
#[derive(Debug)]
pub struct ExecutionSummary {
    pub status: PipelineStatus,
    pub first_error: Option<String>,
    pub rollback_records: Vec<NodeRecord>,
}

struct NodeOutcome {
    id: NodeId,
    status: NodeStatus,
    error: Option<String>,
}

/// Concurrent scheduler over a frozen execution graph. Honours
/// dependency edges strictly, serialises per host, bounds global
/// concurrency, and drives retries, timeouts, cancellation and the
/// abort/rollback policy.
pub struct DagExecutor {
    options: ExecutorOptions,
}

impl DagExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    pub async fn execute(
        &self,
        graph: &ExecutionFragment,
        ctx: &PipelineContext,
        reporter: Arc<Reporter>,
    ) -> Result<ExecutionSummary> {
        graph.validate()?;

        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        let mut downstream: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut state: HashMap<NodeId, NodeStatus> = HashMap::new();
        for (id, node) in &graph.nodes {
            indegree.insert(id.clone(), node.dependencies.len());
            state.insert(id.clone(), NodeStatus::Pending);
            reporter.register(node);
            for dep in &node.dependencies {
                downstream.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        let mut ready: BTreeSet<NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let cap = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let host_locks: Arc<DashMap<String, Arc<Semaphore>>> = Arc::new(DashMap::new());
        let cancel = ctx.cancel_token().clone();
        let mut in_flight: JoinSet<NodeOutcome> = JoinSet::new();
        let mut aborting = false;
        let mut user_cancelled = false;
        let mut first_error: Option<String> = None;

        info!(
            nodes = graph.len(),
            concurrency = self.options.concurrency,
            "executing plan"
        );

        loop {
            if cancel.is_cancelled() && !aborting {
                warn!("pipeline cancelled; draining in-flight nodes");
                aborting = true;
                user_cancelled = true;
            }

            if !aborting {
                let mut blocked = Vec::new();
                while let Some(id) = ready.iter().next().cloned() {
                    ready.remove(&id);
                    let Ok(cap_permit) = cap.clone().try_acquire_owned() else {
                        blocked.push(id);
                        break;
                    };

                    // A node that would violate the per-host serial limit
                    // is requeued; the next ready node gets its turn.
                    let node = graph.get(&id).expect("ready node is in the graph").clone();
                    let Some(host_permits) = try_lock_hosts(&node, &host_locks) else {
                        drop(cap_permit);
                        blocked.push(id);
                        continue;
                    };

                    state.insert(id.clone(), NodeStatus::Running);
                    debug!(node = %id, "dispatching");
                    let node_ctx = ctx.clone();
                    let node_reporter = reporter.clone();
                    let node_cancel = cancel.clone();
                    in_flight.spawn(async move {
                        let outcome =
                            run_node(node, node_ctx, node_reporter, node_cancel).await;
                        drop(host_permits);
                        drop(cap_permit);
                        outcome
                    });
                }
                ready.extend(blocked);
            }

            if in_flight.is_empty() {
                if aborting || ready.is_empty() {
                    break;
                }
                continue;
            }

            let Some(joined) = in_flight.join_next().await else {
                continue;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!("node task panicked: {}", join_err);
                    first_error.get_or_insert(format!("node task panicked: {}", join_err));
                    aborting = true;
                    continue;
                }
            };

            state.insert(outcome.id.clone(), outcome.status);

            if outcome.status.unblocks_downstream() {
                if let Some(dependents) = downstream.get(&outcome.id) {
                    for dependent in dependents {
                        let d = indegree
                            .get_mut(dependent)
                            .expect("dependent is in the graph");
                        *d -= 1;
                        if *d == 0
                            && state[dependent] == NodeStatus::Pending
                            && !aborting
                        {
                            ready.insert(dependent.clone());
                        }
                    }
                }
            } else {
                if first_error.is_none() {
                    first_error = outcome.error.clone();
                }
                if outcome.status == NodeStatus::Cancelled {
                    // Cancellation is not a fresh failure; the abort (or
                    // the user) that caused it is already accounted for.
                } else if self.options.abort_on_error {
                    warn!(node = %outcome.id, "node failed; aborting pipeline");
                    aborting = true;
                } else {
                    cancel_dependents(&outcome.id, &downstream, &mut state, &reporter);
                }
            }
        }

        // Everything never dispatched ends as Cancelled.
        for (id, status) in &state {
            if *status == NodeStatus::Pending {
                reporter.mark_finished(id, NodeStatus::Cancelled, None);
            }
        }

        let mut rollback_records = Vec::new();
        if aborting && !user_cancelled && self.options.rollback_on_abort {
            rollback_records = self.rollback(graph, ctx, &state, reporter.clone()).await?;
        }

        let status = if user_cancelled {
            PipelineStatus::Cancelled
        } else if first_error.is_some() {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Success
        };

        Ok(ExecutionSummary {
            status,
            first_error,
            rollback_records,
        })
    }

    /// Invoke rollback on every successful node in reverse topological
    /// order. Actions without rollback support are skipped; failures are
    /// recorded, never propagated.
    async fn rollback(
        &self,
        graph: &ExecutionFragment,
        ctx: &PipelineContext,
        state: &HashMap<NodeId, NodeStatus>,
        reporter: Arc<Reporter>,
    ) -> Result<Vec<NodeRecord>> {
        let order: Vec<NodeId> = graph.topo_order()?.into_iter().flatten().collect();
        let mut records = Vec::new();

        info!("rolling back successful nodes");
        for id in order.iter().rev() {
            if state.get(id) != Some(&NodeStatus::Success) {
                continue;
            }
            let node = graph.get(id).expect("node is in the graph");
            if !node.action.supports_rollback() {
                debug!(node = %id, "no rollback support; skipping");
                continue;
            }

            let started = Utc::now();
            let targets = node_targets(node, ctx);
            let mut failure: Option<String> = None;
            for host in targets {
                // Fresh token: rollback runs outside the pipeline
                // cancellation scope.
                let rb_cancel = CancellationToken::new();
                let ectx =
                    ExecutionContext::new(ctx, node, host, reporter.clone(), rb_cancel);
                let result =
                    tokio::time::timeout(ROLLBACK_NODE_DEADLINE, node.action.rollback(&ectx))
                        .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(node = %id, "rollback failed: {}", e);
                        failure.get_or_insert(e.to_string());
                    }
                    Err(_) => {
                        warn!(node = %id, "rollback deadline exceeded");
                        failure.get_or_insert("rollback deadline exceeded".to_string());
                    }
                }
            }

            records.push(NodeRecord {
                id: id.clone(),
                name: node.name.clone(),
                hosts: node.host_names(),
                status: if failure.is_none() {
                    NodeStatus::Success
                } else {
                    NodeStatus::Failed
                },
                started_at: Some(started),
                ended_at: Some(Utc::now()),
                attempts: 1,
                stdout: String::new(),
                stderr: String::new(),
                error: failure,
            });
        }
        Ok(records)
    }
}

fn cancel_dependents(
    failed: &NodeId,
    downstream: &HashMap<NodeId, Vec<NodeId>>,
    state: &mut HashMap<NodeId, NodeStatus>,
    reporter: &Reporter,
) {
    let mut queue = vec![failed.clone()];
    while let Some(id) = queue.pop() {
        if let Some(dependents) = downstream.get(&id) {
            for dependent in dependents {
                if state.get(dependent) == Some(&NodeStatus::Pending) {
                    state.insert(dependent.clone(), NodeStatus::Cancelled);
                    reporter.mark_finished(dependent, NodeStatus::Cancelled, None);
                    queue.push(dependent.clone());
                }
            }
        }
    }
}

fn node_targets(node: &ExecutionNode, ctx: &PipelineContext) -> Vec<Host> {
    if node.hosts.is_empty() {
        vec![ctx.registry().control_node()]
    } else {
        node.hosts.clone()
    }
}

/// All-or-nothing acquisition of a node's host permits, in lexicographic
/// host-name order (deadlock-free). `None` means some host is busy.
fn try_lock_hosts(
    node: &ExecutionNode,
    host_locks: &DashMap<String, Arc<Semaphore>>,
) -> Option<Vec<tokio::sync::OwnedSemaphorePermit>> {
    let mut lock_order: Vec<String> = node.hosts.iter().map(|h| h.name.clone()).collect();
    lock_order.sort();
    lock_order.dedup();

    let mut permits = Vec::with_capacity(lock_order.len());
    for host_name in &lock_order {
        let sem = host_locks
            .entry(host_name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        match sem.try_acquire_owned() {
            Ok(permit) => permits.push(permit),
            // Drops the permits taken so far.
            Err(_) => return None,
        }
    }
    Some(permits)
}

async fn run_node(
    node: ExecutionNode,
    ctx: PipelineContext,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
) -> NodeOutcome {
    let id = node.id.clone();

    fn cancelled(reporter: &Reporter, id: &NodeId) -> NodeOutcome {
        reporter.mark_finished(id, NodeStatus::Cancelled, Some("cancelled".to_string()));
        NodeOutcome {
            id: id.clone(),
            status: NodeStatus::Cancelled,
            error: Some("cancelled".to_string()),
        }
    }

    reporter.mark_running(&id, 1);

    let targets = node_targets(&node, &ctx);
    let contexts: Vec<ExecutionContext> = targets
        .into_iter()
        .map(|host| ExecutionContext::new(&ctx, &node, host, reporter.clone(), cancel.clone()))
        .collect();

    // Precheck once per host; never re-invoked across retries. A probe
    // error downgrades to indeterminate and the action runs.
    let mut run_set: Vec<ExecutionContext> = Vec::new();
    for ectx in contexts {
        match node.action.precheck(&ectx).await {
            Ok(crate::action::PrecheckOutcome::Satisfied) => {
                debug!(node = %id, host = %ectx.current_host(), "precheck satisfied");
            }
            Ok(_) => run_set.push(ectx),
            Err(EngineError::Cancelled) => return cancelled(&reporter, &id),
            Err(e) => {
                warn!(node = %id, "precheck error, treating as indeterminate: {}", e);
                run_set.push(ectx);
            }
        }
    }

    if run_set.is_empty() {
        reporter.mark_finished(&id, NodeStatus::Success, None);
        return NodeOutcome {
            id,
            status: NodeStatus::Success,
            error: None,
        };
    }

    let max_attempts = node.retry.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        reporter.mark_running(&id, attempt);
        match run_attempt(&node, &run_set, &cancel).await {
            Ok(()) => {
                reporter.mark_finished(&id, NodeStatus::Success, None);
                return NodeOutcome {
                    id,
                    status: NodeStatus::Success,
                    error: None,
                };
            }
            Err(EngineError::Cancelled) => return cancelled(&reporter, &id),
            Err(e) => {
                let retryable = e.is_retryable()
                    || (matches!(e, EngineError::Precondition(_))
                        && node.action.precondition_retryable());
                if attempt < max_attempts && retryable {
                    let delay = node.retry.backoff.delay(attempt);
                    debug!(node = %id, attempt, ?delay, "attempt failed, retrying: {}", e);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return cancelled(&reporter, &id),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    attempt += 1;
                    continue;
                }

                let status = if node.ignore_failure {
                    NodeStatus::Skipped
                } else if matches!(e, EngineError::Timeout(_)) {
                    NodeStatus::TimedOut
                } else {
                    NodeStatus::Failed
                };
                let message = e.to_string();
                reporter.mark_finished(&id, status, Some(message.clone()));
                return NodeOutcome {
                    id,
                    status,
                    error: Some(message),
                };
            }
        }
    }
}

/// One attempt: fan out to every unsatisfied host concurrently, bounded
/// by the node's deadline and the pipeline cancel signal. Timeouts count
/// against retry attempts.
async fn run_attempt(
    node: &ExecutionNode,
    contexts: &[ExecutionContext],
    cancel: &CancellationToken,
) -> Result<()> {
    let attempt = async {
        let results =
            futures::future::join_all(contexts.iter().map(|ectx| node.action.run(ectx))).await;
        for result in results {
            result?;
        }
        Ok(())
    };
    let guarded = async {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = attempt => result,
        }
    };
    match node.timeout {
        Some(deadline) => match tokio::time::timeout(deadline, guarded).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "node {} exceeded {:?}",
                node.id, deadline
            ))),
        },
        None => guarded.await,
    }
}
