use crate::action::Action;
use crate::cache::{CacheRegistry, ScopedCache};
use crate::connector::{Connector, ConnectorFactory};
use crate::error::Result;
use crate::graph::{ExecutionNode, NodeId};
use crate::registry::HostRegistry;
use crate::report::{NodeOutputSink, Reporter};
use crate::runner::Runner;
use kubexm_api::{ClusterConfig, Host, HostFacts, Role, WorkspaceLayout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pipeline-scoped state: config, roster, caches, work dirs, connector
/// factory and the run-wide cancel signal. Cloning is cheap; everything
/// inside is shared. Narrower contexts are built from this one, never
/// the other way around.
#[derive(Clone)]
pub struct PipelineContext {
    config: Arc<ClusterConfig>,
    registry: Arc<HostRegistry>,
    layout: Arc<WorkspaceLayout>,
    caches: Arc<CacheRegistry>,
    connectors: Arc<dyn ConnectorFactory>,
    cancel: CancellationToken,
    run_id: Uuid,
}

impl PipelineContext {
    pub fn new(
        config: Arc<ClusterConfig>,
        registry: Arc<HostRegistry>,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Self {
        let layout = Arc::new(WorkspaceLayout::new(
            &config.work_dir(),
            config.cluster_name(),
        ));
        Self {
            config,
            registry,
            layout,
            caches: Arc::new(CacheRegistry::new()),
            connectors,
            cancel: CancellationToken::new(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn global_work_dir(&self) -> &Path {
        self.layout.root()
    }

    pub fn pipeline_cache(&self) -> ScopedCache {
        self.caches.pipeline()
    }

    pub fn connectors(&self) -> &Arc<dyn ConnectorFactory> {
        &self.connectors
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// Narrow to a module scope.
    pub fn module_ctx(&self, module_name: &str) -> ModuleContext {
        ModuleContext {
            module_cache: self.caches.module(module_name),
            module_name: module_name.to_string(),
            pipeline: self.clone(),
        }
    }
}

/// Module-scoped view: pipeline context plus the module cache.
#[derive(Clone)]
pub struct ModuleContext {
    pipeline: PipelineContext,
    module_name: String,
    module_cache: ScopedCache,
}

impl ModuleContext {
    pub fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn module_cache(&self) -> ScopedCache {
        self.module_cache.clone()
    }

    pub fn config(&self) -> &ClusterConfig {
        self.pipeline.config()
    }

    pub fn registry(&self) -> &HostRegistry {
        self.pipeline.registry()
    }

    pub fn pipeline_cache(&self) -> ScopedCache {
        self.pipeline.pipeline_cache()
    }

    /// Narrow to a task scope.
    pub fn task_ctx(&self, task_name: &str) -> TaskContext {
        TaskContext {
            task_cache: self
                .pipeline
                .caches()
                .task(&self.module_name, task_name),
            task_name: task_name.to_string(),
            module: self.clone(),
        }
    }
}

/// Task-scoped view used during planning. Adds roster lookups, the task
/// cache and the node-building helpers that stamp the naming convention
/// and cache-scope labels.
#[derive(Clone)]
pub struct TaskContext {
    module: ModuleContext,
    task_name: String,
    task_cache: ScopedCache,
}

impl TaskContext {
    pub fn module(&self) -> &ModuleContext {
        &self.module
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn task_cache(&self) -> ScopedCache {
        self.task_cache.clone()
    }

    pub fn module_cache(&self) -> ScopedCache {
        self.module.module_cache()
    }

    pub fn pipeline_cache(&self) -> ScopedCache {
        self.module.pipeline_cache()
    }

    pub fn config(&self) -> &ClusterConfig {
        self.module.config()
    }

    pub fn registry(&self) -> &HostRegistry {
        self.module.registry()
    }

    pub fn control_node(&self) -> Host {
        self.module.registry().control_node()
    }

    pub fn hosts_by_role(&self, role: Role) -> Vec<Host> {
        self.module.registry().hosts_by_role(role)
    }

    pub async fn host_facts(&self, host: &Host) -> Result<HostFacts> {
        let pipeline = self.module.pipeline();
        pipeline
            .registry()
            .facts(host, pipeline.connectors().as_ref(), pipeline.cancel_token())
            .await
    }

    /// Build a node for one host: id `<task>-<step>-<host>`.
    pub fn node(&self, step: &str, host: &Host, action: Arc<dyn Action>) -> ExecutionNode {
        let id = format!("{}-{}-{}", self.task_name, step, host.name);
        ExecutionNode::new(id, format!("{}: {}", self.task_name, step), action)
            .on_hosts(vec![host.clone()])
            .in_scope(self.module.module_name.clone(), self.task_name.clone())
    }

    /// Build a control-node node: id `<task>-<step>`, empty host set.
    pub fn local_node(&self, step: &str, action: Arc<dyn Action>) -> ExecutionNode {
        let id = format!("{}-{}", self.task_name, step);
        ExecutionNode::new(id, format!("{}: {}", self.task_name, step), action)
            .in_scope(self.module.module_name.clone(), self.task_name.clone())
    }
}

/// Run-time context handed to actions, bound to one (node, host) pair.
/// Exposes the same caches the planner used plus the transport for the
/// current host.
#[derive(Clone)]
pub struct ExecutionContext {
    pipeline: PipelineContext,
    module_cache: ScopedCache,
    task_cache: ScopedCache,
    node_id: NodeId,
    host: Host,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn new(
        pipeline: &PipelineContext,
        node: &ExecutionNode,
        host: Host,
        reporter: Arc<Reporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            module_cache: pipeline.caches().module(&node.module),
            task_cache: pipeline.caches().task(&node.module, &node.task),
            pipeline: pipeline.clone(),
            node_id: node.id.clone(),
            host,
            reporter,
            cancel,
        }
    }

    pub fn current_host(&self) -> &Host {
        &self.host
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        self.pipeline.config()
    }

    pub fn registry(&self) -> &HostRegistry {
        self.pipeline.registry()
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        self.pipeline.layout()
    }

    pub fn pipeline_cache(&self) -> ScopedCache {
        self.pipeline.pipeline_cache()
    }

    pub fn module_cache(&self) -> ScopedCache {
        self.module_cache.clone()
    }

    pub fn task_cache(&self) -> ScopedCache {
        self.task_cache.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Per-host staging directory on the control node.
    pub fn host_work_dir(&self) -> PathBuf {
        self.pipeline.layout().host_dir(&self.host.name)
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.host_work_dir()
    }

    pub fn connector(&self) -> Result<Arc<dyn Connector>> {
        self.connector_for(&self.host)
    }

    /// Transport for an arbitrary roster host, for actions that push
    /// state to peers (certificate distribution and the like).
    pub fn connector_for(&self, host: &Host) -> Result<Arc<dyn Connector>> {
        self.pipeline.connectors().connect(host)
    }

    /// Runner for the current host. Probes facts on first use per host
    /// per run; output is mirrored into the node's report record.
    pub async fn runner(&self) -> Result<Runner> {
        let facts = self
            .pipeline
            .registry()
            .facts(
                &self.host,
                self.pipeline.connectors().as_ref(),
                &self.cancel,
            )
            .await?;
        let connector = self.connector()?;
        let sink = NodeOutputSink::new(self.reporter.clone(), self.node_id.clone());
        Ok(Runner::new(connector, facts, self.cancel.clone()).with_sink(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::tests_support::NoopAction;
    use crate::connector::MemoryConnectorFactory;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn pipeline_ctx() -> PipelineContext {
        let config = ClusterConfig::from_yaml(
            r#"
metadata:
  name: demo
spec:
  hosts:
    - name: m1
      address: 10.0.0.1
    - name: w1
      address: 10.0.0.2
  roles:
    master: [m1]
    worker: [w1]
"#,
        )
        .unwrap();
        let registry = Arc::new(HostRegistry::from_config(&config).unwrap());
        PipelineContext::new(
            Arc::new(config),
            registry,
            Arc::new(MemoryConnectorFactory::new()),
        )
    }

    #[test]
    fn test_narrowing_chain() {
        let ctx = pipeline_ctx();
        let mctx = ctx.module_ctx("control-plane");
        let tctx = mctx.task_ctx("init-master");

        assert_eq!(mctx.module_name(), "control-plane");
        assert_eq!(tctx.task_name(), "init-master");
        assert_eq!(tctx.config().cluster_name(), "demo");
        assert_eq!(tctx.hosts_by_role(Role::Master).len(), 1);
    }

    #[test]
    fn test_node_naming_convention() {
        let ctx = pipeline_ctx();
        let tctx = ctx.module_ctx("etcd").task_ctx("etcd-install");
        let host = tctx.hosts_by_role(Role::Master)[0].clone();

        let node = tctx.node("service", &host, NoopAction::arc("install"));
        assert_eq!(node.id.as_str(), "etcd-install-service-m1");
        assert_eq!(node.module, "etcd");
        assert_eq!(node.task, "etcd-install");
        assert_eq!(node.host_names(), vec!["m1"]);

        let local = tctx.local_node("render", NoopAction::arc("render"));
        assert_eq!(local.id.as_str(), "etcd-install-render");
        assert!(local.hosts.is_empty());
    }

    #[test]
    fn test_same_scope_shares_cache_between_planning_and_execution() {
        let ctx = pipeline_ctx();
        let tctx = ctx.module_ctx("control-plane").task_ctx("init-master");
        tctx.module_cache().put("join-token", Value::String("abc".into()));

        let host = tctx.hosts_by_role(Role::Master)[0].clone();
        let node = tctx.node("run", &host, NoopAction::arc("run"));
        let ectx = ExecutionContext::new(
            &ctx,
            &node,
            host,
            Arc::new(Reporter::new()),
            ctx.cancel_token().clone(),
        );

        assert_eq!(
            ectx.module_cache().get_as::<String>("join-token"),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_work_dirs_follow_layout() {
        let ctx = pipeline_ctx();
        let tctx = ctx.module_ctx("m").task_ctx("t");
        let host = tctx.hosts_by_role(Role::Worker)[0].clone();
        let node = tctx.node("s", &host, NoopAction::arc("a"));
        let ectx = ExecutionContext::new(
            &ctx,
            &node,
            host,
            Arc::new(Reporter::new()),
            ctx.cancel_token().clone(),
        );

        assert!(ectx
            .host_work_dir()
            .ends_with(Path::new(".kubexm/demo/w1")));
        assert_eq!(ectx.upload_dir(), ectx.host_work_dir());
    }
}
