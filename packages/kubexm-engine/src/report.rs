use crate::connector::ExecOutput;
use crate::graph::{ExecutionNode, NodeId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle of one execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Failed, but the node carries `ignore_failure`; downstream ran.
    Skipped,
    Cancelled,
    TimedOut,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    /// Whether downstream nodes may run after this outcome.
    pub fn unblocks_downstream(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-node outcome record.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub hosts: Vec<String>,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl NodeRecord {
    fn pending(node: &ExecutionNode) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            hosts: node.host_names(),
            status: NodeStatus::Pending,
            started_at: None,
            ended_at: None,
            attempts: 0,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Status change broadcast to live subscribers.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub id: NodeId,
    pub status: NodeStatus,
    pub attempt: u32,
}

/// Collects per-node status, wall time and output; streams changes to
/// subscribers and produces the final report.
pub struct Reporter {
    records: DashMap<NodeId, NodeRecord>,
    events: broadcast::Sender<NodeEvent>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: DashMap::new(),
            events,
        }
    }

    pub fn register(&self, node: &ExecutionNode) {
        self.records
            .insert(node.id.clone(), NodeRecord::pending(node));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn record(&self, id: &NodeId) -> Option<NodeRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub(crate) fn mark_running(&self, id: &NodeId, attempt: u32) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = NodeStatus::Running;
            record.attempts = attempt;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
        }
        self.emit(id, NodeStatus::Running, attempt);
    }

    pub(crate) fn mark_finished(&self, id: &NodeId, status: NodeStatus, error: Option<String>) {
        let mut attempt = 0;
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = status;
            record.error = error;
            record.ended_at = Some(Utc::now());
            attempt = record.attempts;
        }
        self.emit(id, status, attempt);
    }

    pub(crate) fn append_output(&self, id: &NodeId, output: &ExecOutput) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.stdout.push_str(&output.stdout);
            record.stderr.push_str(&output.stderr);
        }
    }

    fn emit(&self, id: &NodeId, status: NodeStatus, attempt: u32) {
        // No subscribers is fine.
        let _ = self.events.send(NodeEvent {
            id: id.clone(),
            status,
            attempt,
        });
    }

    /// All records sorted by node id.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

/// Mirrors a node's exec output into its report record.
#[derive(Clone)]
pub struct NodeOutputSink {
    reporter: Arc<Reporter>,
    node: NodeId,
}

impl NodeOutputSink {
    pub(crate) fn new(reporter: Arc<Reporter>, node: NodeId) -> Self {
        Self { reporter, node }
    }

    pub fn record(&self, output: &ExecOutput) {
        self.reporter.append_output(&self.node, output);
    }
}

/// Overall pipeline outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failed,
    Cancelled,
}

/// Final run report: per-node records, rollback outcomes, the first
/// fatal error.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: PipelineStatus,
    pub duration_ms: u64,
    pub records: Vec<NodeRecord>,
    pub rollback_records: Vec<NodeRecord>,
    pub error: Option<String>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<&NodeRecord> {
        self.records.iter().filter(|r| r.status == status).collect()
    }

    /// Plain-text outcome table, one line per node.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "pipeline {} [{}] {:?} in {}ms",
            self.pipeline, self.run_id, self.status, self.duration_ms
        )];
        for record in &self.records {
            let hosts = if record.hosts.is_empty() {
                "localhost".to_string()
            } else {
                record.hosts.join(",")
            };
            lines.push(format!(
                "  {:<12} {:<48} hosts={} attempts={}{}",
                record.status.as_str(),
                record.id,
                hosts,
                record.attempts,
                record
                    .error
                    .as_deref()
                    .map(|e| format!(" error={}", e))
                    .unwrap_or_default()
            ));
        }
        if !self.rollback_records.is_empty() {
            lines.push("rollback:".to_string());
            for record in &self.rollback_records {
                lines.push(format!(
                    "  {:<12} {}{}",
                    record.status.as_str(),
                    record.id,
                    record
                        .error
                        .as_deref()
                        .map(|e| format!(" error={}", e))
                        .unwrap_or_default()
                ));
            }
        }
        lines.join("\n")
    }
}
