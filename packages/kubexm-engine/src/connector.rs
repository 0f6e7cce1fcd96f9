use crate::error::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use kubexm_api::Host;
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote transport session for one host. The SSH implementation lives
/// outside this crate; shipped here are the local-process connector used
/// for the control node and the in-memory connector used by the test
/// suites.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run a command. Must return `Cancelled` promptly once the token
    /// fires; in-flight sessions are expected to be torn down within a
    /// couple of seconds on a healthy channel.
    async fn exec(
        &self,
        command: &str,
        sudo: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;

    async fn upload(&self, local: &Path, remote: &Path) -> Result<()>;

    async fn download(&self, remote: &Path, local: &Path) -> Result<()>;

    /// Whether a remote path exists.
    async fn stat(&self, path: &Path) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// Hands out one logical connector per host; implementations pool and
/// multiplex underneath. Planning never opens connectors.
pub trait ConnectorFactory: Send + Sync {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Connector>>;
}

// ---------------------------------------------------------------------------
// Local connector

/// Runs commands on the machine kubexm itself runs on, via a shell
/// subprocess. Used for control-node nodes and single-machine setups.
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn exec(
        &self,
        command: &str,
        sudo: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let shell_cmd = if sudo {
            format!("sudo sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        };

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&shell_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::transport("localhost", e))?;

        let output = tokio::select! {
            // Dropping the wait future drops the child, and
            // kill_on_drop reaps the process.
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = child.wait_with_output() => {
                result.map_err(|e| EngineError::transport("localhost", e))?
            }
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn upload(&self, local: &Path, remote: &Path) -> Result<()> {
        if let Some(parent) = remote.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn download(&self, remote: &Path, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(remote, local).await?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::metadata(path).await.is_ok())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory that serves the local connector for every host. Suitable for
/// dry runs and single-machine clusters; real deployments plug an SSH
/// factory in through `run_pipeline_with`.
#[derive(Default)]
pub struct LocalConnectorFactory {
    pool: DashMap<String, Arc<dyn Connector>>,
}

impl LocalConnectorFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectorFactory for LocalConnectorFactory {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Connector>> {
        let conn = self
            .pool
            .entry(host.name.clone())
            .or_insert_with(|| Arc::new(LocalConnector) as Arc<dyn Connector>)
            .clone();
        Ok(conn)
    }
}

pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// In-memory connector

/// One executed command with its wall-clock interval. The intervals let
/// tests assert serialisation and concurrency-cap invariants.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub host: String,
    pub command: String,
    pub sudo: bool,
    pub started: Instant,
    pub ended: Instant,
}

/// Shared log of every command the in-memory connectors executed.
#[derive(Default)]
pub struct CommandLog {
    records: Mutex<Vec<CommandRecord>>,
}

impl CommandLog {
    pub fn all(&self) -> Vec<CommandRecord> {
        self.records.lock().clone()
    }

    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.host == host)
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.command.contains(needle))
            .count()
    }

    /// Peak number of overlapping command intervals across all hosts.
    pub fn max_concurrent(&self) -> usize {
        Self::peak_overlap(self.all())
    }

    /// Peak number of overlapping command intervals on one host.
    pub fn max_concurrent_for_host(&self, host: &str) -> usize {
        Self::peak_overlap(
            self.all()
                .into_iter()
                .filter(|r| r.host == host)
                .collect(),
        )
    }

    fn peak_overlap(records: Vec<CommandRecord>) -> usize {
        let mut events: Vec<(Instant, i32)> = Vec::with_capacity(records.len() * 2);
        for r in &records {
            events.push((r.started, 1));
            events.push((r.ended, -1));
        }
        // Ends sort before starts at the same instant, so back-to-back
        // commands do not count as overlapping.
        events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut current = 0i32;
        let mut peak = 0i32;
        for (_, delta) in events {
            current += delta;
            peak = peak.max(current);
        }
        peak.max(0) as usize
    }

    fn record(&self, record: CommandRecord) {
        self.records.lock().push(record);
    }
}

struct ResponseRule {
    host: Option<String>,
    pattern: String,
    output: ExecOutput,
    /// Remaining matches before the rule expires; `None` never expires.
    times: Option<u32>,
}

/// Scripted in-process transport. Every command resolves against the
/// configured rules (most recent first) and falls back to defaults that
/// make OS probes and prechecks behave like a pristine host: facts
/// commands answer plausibly, state checks report "absent", everything
/// else succeeds silently.
pub struct MemoryConnectorFactory {
    log: Arc<CommandLog>,
    rules: Arc<Mutex<Vec<ResponseRule>>>,
    latency: Duration,
    pool: DashMap<String, Arc<dyn Connector>>,
}

impl Default for MemoryConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnectorFactory {
    pub fn new() -> Self {
        Self {
            log: Arc::new(CommandLog::default()),
            rules: Arc::new(Mutex::new(Vec::new())),
            latency: Duration::ZERO,
            pool: DashMap::new(),
        }
    }

    /// Add artificial per-command latency so interval-overlap assertions
    /// have something to measure.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn log(&self) -> Arc<CommandLog> {
        self.log.clone()
    }

    /// Script a response for commands containing `pattern`, optionally
    /// restricted to one host. Later rules win over earlier ones.
    pub fn respond(&self, host: Option<&str>, pattern: &str, stdout: &str, exit_code: i32) {
        self.rules.lock().push(ResponseRule {
            host: host.map(str::to_string),
            pattern: pattern.to_string(),
            output: ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
            },
            times: None,
        });
    }

    /// Make commands containing `pattern` on `host` fail. `times: None`
    /// fails forever; `Some(n)` fails n times and then falls through.
    pub fn fail_command(&self, host: &str, pattern: &str, times: Option<u32>) {
        self.rules.lock().push(ResponseRule {
            host: Some(host.to_string()),
            pattern: pattern.to_string(),
            output: ExecOutput {
                stdout: String::new(),
                stderr: format!("injected failure for `{}`", pattern),
                exit_code: 1,
            },
            times,
        });
    }
}

/// Pristine-host defaults for unscripted commands.
fn default_response(command: &str) -> ExecOutput {
    let ok = |stdout: &str| ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    };
    let absent = || ExecOutput {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: 1,
    };

    if command.contains("uname -m") {
        ok("x86_64\n")
    } else if command.contains("uname -r") {
        ok("5.15.0-generic\n")
    } else if command.contains("/etc/os-release") {
        ok("ID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n")
    } else if command.contains("/proc/1/comm") {
        ok("systemd\n")
    } else if command.contains("command -v apt-get") {
        ok("/usr/bin/apt-get\n")
    } else if command.contains("command -v") {
        absent()
    } else if command.contains("is-active") || command.contains("is-enabled") {
        // Nothing is installed or running yet.
        ExecOutput {
            stdout: "inactive\n".to_string(),
            stderr: String::new(),
            exit_code: 3,
        }
    } else if command.starts_with("test ") || command.contains("&& test ") {
        absent()
    } else if command.contains("kubectl") && command.contains(" get ") {
        // No cluster resources exist yet either.
        absent()
    } else {
        ok("")
    }
}

struct MemoryConnector {
    host: String,
    log: Arc<CommandLog>,
    factory_rules: Arc<Mutex<Vec<ResponseRule>>>,
    latency: Duration,
}

impl MemoryConnector {
    fn resolve(&self, command: &str) -> ExecOutput {
        let mut rules = self.factory_rules.lock();
        for idx in (0..rules.len()).rev() {
            let rule = &rules[idx];
            let host_matches = rule
                .host
                .as_deref()
                .map(|h| h == self.host)
                .unwrap_or(true);
            if host_matches && command.contains(&rule.pattern) {
                let output = rule.output.clone();
                if let Some(n) = &mut rules[idx].times {
                    *n -= 1;
                    if *n == 0 {
                        rules.remove(idx);
                    }
                }
                return output;
            }
        }
        drop(rules);
        default_response(command)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn exec(
        &self,
        command: &str,
        sudo: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let started = Instant::now();
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        } else if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let output = self.resolve(command);
        debug!(host = %self.host, command, exit_code = output.exit_code, "memory exec");
        self.log.record(CommandRecord {
            host: self.host.clone(),
            command: command.to_string(),
            sudo,
            started,
            ended: Instant::now(),
        });
        Ok(output)
    }

    async fn upload(&self, _local: &Path, _remote: &Path) -> Result<()> {
        Ok(())
    }

    async fn download(&self, _remote: &Path, _local: &Path) -> Result<()> {
        Ok(())
    }

    async fn stat(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl ConnectorFactory for MemoryConnectorFactory {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Connector>> {
        let conn = self
            .pool
            .entry(host.name.clone())
            .or_insert_with(|| {
                Arc::new(MemoryConnector {
                    host: host.name.clone(),
                    log: self.log.clone(),
                    factory_rules: self.rules.clone(),
                    latency: self.latency,
                }) as Arc<dyn Connector>
            })
            .clone();
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> Host {
        Host::new(name, "10.0.0.1")
    }

    #[tokio::test]
    async fn test_memory_defaults_look_like_pristine_host() {
        let factory = MemoryConnectorFactory::new();
        let conn = factory.connect(&host("n1")).unwrap();
        let cancel = CancellationToken::new();

        let out = conn.exec("uname -m", false, &cancel).await.unwrap();
        assert_eq!(out.stdout.trim(), "x86_64");

        let out = conn
            .exec("systemctl is-active --quiet etcd", true, &cancel)
            .await
            .unwrap();
        assert!(!out.success());

        let out = conn.exec("mkdir -p /etc/kubernetes", true, &cancel).await.unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_scripted_response_wins_over_default() {
        let factory = MemoryConnectorFactory::new();
        factory.respond(Some("n1"), "kubeadm init", "token: abc\n", 0);
        let conn = factory.connect(&host("n1")).unwrap();
        let cancel = CancellationToken::new();

        let out = conn
            .exec("kubeadm init --config x", true, &cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout, "token: abc\n");
    }

    #[tokio::test]
    async fn test_failure_injection_expires() {
        let factory = MemoryConnectorFactory::new();
        factory.fail_command("n1", "systemctl start etcd", Some(2));
        let conn = factory.connect(&host("n1")).unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let out = conn
                .exec("systemctl start etcd", true, &cancel)
                .await
                .unwrap();
            assert!(!out.success());
        }
        let out = conn
            .exec("systemctl start etcd", true, &cancel)
            .await
            .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_cancelled_exec() {
        let factory =
            MemoryConnectorFactory::new().with_latency(Duration::from_millis(100));
        let conn = factory.connect(&host("n1")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = conn.exec("sleepy", false, &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_command_log_overlap_detection() {
        let factory =
            MemoryConnectorFactory::new().with_latency(Duration::from_millis(30));
        let conn = factory.connect(&host("n1")).unwrap();
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            conn.exec("first", false, &cancel),
            conn.exec("second", false, &cancel),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(factory.log().max_concurrent(), 2);
    }

    #[tokio::test]
    async fn test_local_connector_exec() {
        let conn = LocalConnector;
        let cancel = CancellationToken::new();
        let out = conn.exec("echo $((40 + 2))", false, &cancel).await.unwrap();
        assert_eq!(out.stdout.trim(), "42");
        assert!(out.success());
    }

    #[test]
    fn test_shell_quote_handles_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
