use crate::context::ExecutionContext;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of the cheap idempotence probe run before an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecheckOutcome {
    /// The desired state already holds; the node succeeds without `run`.
    Satisfied,
    NotSatisfied,
    Indeterminate,
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Linear { step_ms: u64 },
    Exponential { base_ms: u64 },
}

/// Exponential backoff is capped so a badly-sized policy cannot stall a
/// pipeline for hours.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl Backoff {
    /// Delay after the given completed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self {
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Linear { step_ms } => step_ms.saturating_mul(attempt as u64),
            Backoff::Exponential { base_ms } => {
                base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            }
        };
        Duration::from_millis(ms).min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 0 }
    }
}

/// Per-node retry policy. The default is a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Abstract unit of work attached to an execution node. One action
/// instance may be shared by many nodes targeting different hosts; all
/// host state comes in through the `ExecutionContext`.
///
/// `run` must be idempotent when the node's retry policy allows more
/// than one attempt, and must return promptly with a `Cancelled` error
/// when the context's cancel token fires.
#[async_trait]
pub trait Action: Send + Sync {
    /// Stable human description used in logs and plan dumps.
    fn describe(&self) -> String;

    /// Cheap idempotence probe. Not re-invoked across retries.
    async fn precheck(&self, _ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        Ok(PrecheckOutcome::NotSatisfied)
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()>;

    /// Best-effort compensation, invoked in reverse topological order
    /// when the pipeline aborts with rollback enabled.
    async fn rollback(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Actions without a real rollback keep the default and are skipped
    /// during the rollback phase.
    fn supports_rollback(&self) -> bool {
        false
    }

    /// Opt a `Precondition` failure into this action's retry policy.
    fn precondition_retryable(&self) -> bool {
        false
    }
}

/// Generic remote-command action: the bread and butter of most tasks.
/// An optional check command drives `precheck` (exit 0 means satisfied),
/// an optional undo command makes the action rollback-capable.
#[derive(Debug, Clone)]
pub struct CommandAction {
    pub command: String,
    pub sudo: bool,
    pub check: Option<String>,
    pub undo: Option<String>,
}

impl CommandAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sudo: false,
            check: None,
            undo: None,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.check = Some(check.into());
        self
    }

    pub fn with_undo(mut self, undo: impl Into<String>) -> Self {
        self.undo = Some(undo.into());
        self
    }
}

#[async_trait]
impl Action for CommandAction {
    fn describe(&self) -> String {
        self.command.clone()
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let Some(check) = &self.check else {
            return Ok(PrecheckOutcome::NotSatisfied);
        };
        let runner = ctx.runner().await?;
        match runner.raw_status(check, self.sudo).await {
            Ok(output) if output.success() => Ok(PrecheckOutcome::Satisfied),
            Ok(_) => Ok(PrecheckOutcome::NotSatisfied),
            Err(_) => Ok(PrecheckOutcome::Indeterminate),
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner.raw(&self.command, self.sudo).await?;
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        if let Some(undo) = &self.undo {
            let runner = ctx.runner().await?;
            runner.raw(undo, self.sudo).await?;
        }
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        self.undo.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::sync::Arc;

    /// Inert action for graph-shape tests.
    pub struct NoopAction {
        label: String,
    }

    impl NoopAction {
        pub fn arc(label: &str) -> Arc<dyn Action> {
            Arc::new(Self {
                label: label.to_string(),
            })
        }
    }

    #[async_trait]
    impl Action for NoopAction {
        fn describe(&self) -> String {
            self.label.clone()
        }

        async fn run(&self, _ctx: &ExecutionContext) -> Result<()> {
            Ok(())
        }
    }
}
