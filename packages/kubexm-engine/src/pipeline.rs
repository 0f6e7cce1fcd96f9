use crate::connector::{ConnectorFactory, LocalConnectorFactory};
use crate::context::PipelineContext;
use crate::error::{EngineError, Result};
use crate::executor::{DagExecutor, ExecutorOptions, DEFAULT_CONCURRENCY};
use crate::graph::{ExecutionFragment, NodeId};
use crate::module::Module;
use crate::modules::addons::AddonsModule;
use crate::modules::control_plane::ControlPlaneModule;
use crate::modules::etcd::EtcdModule;
use crate::modules::loadbalancer::InternalLoadBalancerModule;
use crate::modules::network::{CalicoModule, FlannelModule};
use crate::modules::preflight::PreflightModule;
use crate::modules::reset::ResetModule;
use crate::modules::runtime::ContainerRuntimeModule;
use crate::registry::HostRegistry;
use crate::report::{PipelineReport, PipelineStatus, Reporter};
use kubexm_api::ClusterConfig;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Options of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub concurrency: usize,
    /// Plan and print, do not execute.
    pub dry_run: bool,
    pub abort_on_error: bool,
    /// Keep whatever succeeded in place; skip rollback after an abort.
    pub retain_on_failure: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            dry_run: false,
            abort_on_error: true,
            retain_on_failure: false,
        }
    }
}

/// Top planner level: an ordered list of modules composed into the
/// cluster-wide execution graph, then handed to the executor.
pub struct Pipeline {
    name: String,
    modules: Vec<Arc<dyn Module>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, modules: Vec<Arc<dyn Module>>) -> Self {
        Self {
            name: name.into(),
            modules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The standard cluster provisioning pipeline.
    pub fn create_cluster() -> Self {
        Self::new(
            "create-cluster",
            vec![
                Arc::new(PreflightModule) as Arc<dyn Module>,
                Arc::new(ContainerRuntimeModule),
                Arc::new(EtcdModule),
                Arc::new(InternalLoadBalancerModule),
                Arc::new(ControlPlaneModule),
                Arc::new(CalicoModule),
                Arc::new(FlannelModule),
                Arc::new(AddonsModule),
            ],
        )
    }

    /// Tears a cluster down and cleans the workspace.
    pub fn delete_cluster() -> Self {
        Self::new(
            "delete-cluster",
            vec![Arc::new(ResetModule) as Arc<dyn Module>],
        )
    }

    pub fn by_name(name: &str) -> Result<Self> {
        match name {
            "create-cluster" => Ok(Self::create_cluster()),
            "delete-cluster" => Ok(Self::delete_cluster()),
            _ => Err(EngineError::ConfigDefect(format!(
                "unknown pipeline {}",
                name
            ))),
        }
    }

    /// Compose module plans into one cluster-wide fragment, with the
    /// same sequential frontier-linking rule modules use for tasks.
    pub async fn plan(&self, ctx: &PipelineContext) -> Result<ExecutionFragment> {
        let mut plan = ExecutionFragment::new();
        let mut prev_exits: BTreeSet<NodeId> = BTreeSet::new();

        for module in &self.modules {
            if !module.is_enabled(ctx.config()) {
                debug!(module = module.name(), "module disabled");
                continue;
            }
            let mctx = ctx.module_ctx(module.name());
            let fragment = module.plan(&mctx).await?;
            if fragment.is_empty() {
                debug!(module = module.name(), "module planned empty");
                continue;
            }

            let module_entries = fragment.entry_nodes.clone();
            let module_exits = fragment.exit_nodes.clone();
            plan = ExecutionFragment::merge(plan, fragment)?;

            // The first effective module keeps no inbound edges; the
            // frontier recompute below leaves its nodes as the entries.
            if !prev_exits.is_empty() {
                plan.link(&prev_exits, &module_entries)?;
            }
            prev_exits = module_exits;
        }

        plan.calculate_frontiers();
        plan.validate()?;
        Ok(plan)
    }
}

/// Single entry point: plan the named pipeline against the config and
/// run it through the local connector factory. Real transports come in
/// through `run_pipeline_with`.
pub async fn run_pipeline(
    name: &str,
    config: ClusterConfig,
    options: PipelineOptions,
) -> Result<PipelineReport> {
    run_pipeline_with(name, config, options, Arc::new(LocalConnectorFactory::new())).await
}

pub async fn run_pipeline_with(
    name: &str,
    config: ClusterConfig,
    options: PipelineOptions,
    connectors: Arc<dyn ConnectorFactory>,
) -> Result<PipelineReport> {
    let pipeline = Pipeline::by_name(name)?;
    let registry = Arc::new(HostRegistry::from_config(&config)?);
    let ctx = PipelineContext::new(Arc::new(config), registry, connectors);
    let started = Instant::now();

    info!(pipeline = name, run_id = %ctx.run_id(), "planning pipeline");
    let plan = pipeline.plan(&ctx).await?;

    let report_base = |status, records, rollback_records, error| PipelineReport {
        run_id: ctx.run_id(),
        pipeline: name.to_string(),
        status,
        duration_ms: started.elapsed().as_millis() as u64,
        records,
        rollback_records,
        error,
    };

    if plan.is_empty() {
        info!(pipeline = name, "plan is empty; nothing to do");
        return Ok(report_base(PipelineStatus::Success, Vec::new(), Vec::new(), None));
    }

    info!("execution plan:\n{}", plan.render()?);

    let reporter = Arc::new(Reporter::new());
    if options.dry_run {
        for node in plan.nodes.values() {
            reporter.register(node);
        }
        return Ok(report_base(
            PipelineStatus::Success,
            reporter.snapshot(),
            Vec::new(),
            None,
        ));
    }

    let executor = DagExecutor::new(ExecutorOptions {
        concurrency: options.concurrency,
        abort_on_error: options.abort_on_error,
        rollback_on_abort: !options.retain_on_failure,
    });
    let summary = executor.execute(&plan, &ctx, reporter.clone()).await?;

    info!(
        pipeline = name,
        status = ?summary.status,
        "pipeline finished in {}ms",
        started.elapsed().as_millis()
    );

    Ok(report_base(
        summary.status,
        reporter.snapshot(),
        summary.rollback_records,
        summary.first_error,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnectorFactory;
    use crate::report::NodeStatus;

    const SINGLE_NODE: &str = r#"
metadata:
  name: demo
spec:
  hosts:
    - name: n1
      address: 10.0.0.1
  roles:
    master: [n1]
    worker: [n1]
    etcd: [n1]
  kubernetes:
    version: v1.29.2
  network:
    plugin: calico
"#;

    #[test]
    fn test_by_name_rejects_unknown_pipeline() {
        assert!(Pipeline::by_name("upgrade-cluster").is_err());
        assert_eq!(Pipeline::by_name("create-cluster").unwrap().name(), "create-cluster");
    }

    #[tokio::test]
    async fn test_dry_run_plans_but_does_not_execute() {
        let config = ClusterConfig::from_yaml(SINGLE_NODE).unwrap();
        let factory = Arc::new(MemoryConnectorFactory::new());
        let options = PipelineOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = run_pipeline_with("create-cluster", config, options, factory.clone())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(!report.records.is_empty());
        assert!(report
            .records
            .iter()
            .all(|r| r.status == NodeStatus::Pending));
        // Planning probes no hosts and runs no commands.
        assert_eq!(factory.log().all().len(), 0);
    }
}
