/*
 * kubexm-engine - cluster lifecycle plan/execute core
 *
 * Compiles a declarative cluster specification into a DAG of idempotent
 * per-host actions and runs it across the fleet.
 *
 * Architecture:
 * - Execution Graph (fragment algebra: merge, link, frontiers, validate)
 * - Action contract (precheck / run / rollback, retry policy)
 * - Three planner levels (Pipeline -> Module -> Task)
 * - Hierarchical contexts (pipeline -> module -> task -> execution)
 * - Concurrent DAG executor (worker cap, per-host serialisation,
 *   retries, cancellation, rollback on abort)
 * - Result reporter (per-node records, streaming events, summary)
 */

// Public modules
pub mod action;
pub mod cache;
pub mod connector;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod module;
pub mod modules;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod runner;
pub mod task;

// Re-exports
pub use action::{Action, Backoff, CommandAction, PrecheckOutcome, RetryPolicy};
pub use cache::{CacheRegistry, ScopedCache};
pub use connector::{
    CommandLog, Connector, ConnectorFactory, ExecOutput, LocalConnectorFactory,
    MemoryConnectorFactory,
};
pub use context::{ExecutionContext, ModuleContext, PipelineContext, TaskContext};
pub use error::{EngineError, ErrorKind, Result};
pub use executor::{DagExecutor, ExecutorOptions};
pub use graph::{ExecutionFragment, ExecutionNode, NodeId};
pub use module::{compose_parallel, compose_sequential, Module};
pub use pipeline::{run_pipeline, run_pipeline_with, Pipeline, PipelineOptions};
pub use registry::HostRegistry;
pub use report::{NodeEvent, NodeRecord, NodeStatus, PipelineReport, PipelineStatus, Reporter};
pub use runner::Runner;
pub use task::Task;
