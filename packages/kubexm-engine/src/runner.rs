use crate::connector::{shell_quote, Connector, ExecOutput};
use crate::error::{EngineError, Result};
use crate::report::NodeOutputSink;
use kubexm_api::{HostFacts, PackageManager};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// OS-level abstraction over a connector: package manager, service
/// units, files. Command choice follows the host facts; exec output is
/// mirrored into the node's report record when a sink is attached.
pub struct Runner {
    connector: Arc<dyn Connector>,
    facts: HostFacts,
    cancel: CancellationToken,
    sink: Option<NodeOutputSink>,
}

impl Runner {
    pub fn new(connector: Arc<dyn Connector>, facts: HostFacts, cancel: CancellationToken) -> Self {
        Self {
            connector,
            facts,
            cancel,
            sink: None,
        }
    }

    pub(crate) fn with_sink(mut self, sink: NodeOutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }

    /// Run a command and fail on a non-zero exit code.
    pub async fn raw(&self, command: &str, sudo: bool) -> Result<ExecOutput> {
        let output = self.raw_status(command, sudo).await?;
        if !output.success() {
            return Err(EngineError::RemoteCommand {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.clone(),
            });
        }
        Ok(output)
    }

    /// Run a command; the exit code is the caller's problem.
    pub async fn raw_status(&self, command: &str, sudo: bool) -> Result<ExecOutput> {
        let output = self.connector.exec(command, sudo, &self.cancel).await?;
        if let Some(sink) = &self.sink {
            sink.record(&output);
        }
        Ok(output)
    }

    pub async fn install_package(&self, package: &str) -> Result<()> {
        let command = match self.facts.package_manager {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                package
            ),
            PackageManager::Dnf => format!("dnf install -y {}", package),
            PackageManager::Yum => format!("yum install -y {}", package),
            PackageManager::Unknown => {
                return Err(EngineError::Precondition(format!(
                    "no supported package manager to install {}",
                    package
                )))
            }
        };
        self.raw(&command, true).await?;
        Ok(())
    }

    pub async fn remove_package(&self, package: &str) -> Result<()> {
        let command = match self.facts.package_manager {
            PackageManager::Apt => format!("apt-get remove -y {}", package),
            PackageManager::Dnf => format!("dnf remove -y {}", package),
            PackageManager::Yum => format!("yum remove -y {}", package),
            PackageManager::Unknown => {
                return Err(EngineError::Precondition(format!(
                    "no supported package manager to remove {}",
                    package
                )))
            }
        };
        self.raw(&command, true).await?;
        Ok(())
    }

    pub async fn enable_service(&self, unit: &str) -> Result<()> {
        self.raw(&format!("systemctl enable --now {}", unit), true)
            .await?;
        Ok(())
    }

    pub async fn start_service(&self, unit: &str) -> Result<()> {
        self.raw(&format!("systemctl start {}", unit), true).await?;
        Ok(())
    }

    pub async fn stop_service(&self, unit: &str) -> Result<()> {
        self.raw(&format!("systemctl stop {}", unit), true).await?;
        Ok(())
    }

    pub async fn disable_service(&self, unit: &str) -> Result<()> {
        self.raw(&format!("systemctl disable --now {}", unit), true)
            .await?;
        Ok(())
    }

    pub async fn service_active(&self, unit: &str) -> Result<bool> {
        let output = self
            .raw_status(&format!("systemctl is-active --quiet {}", unit), true)
            .await?;
        Ok(output.success())
    }

    pub async fn daemon_reload(&self) -> Result<()> {
        self.raw("systemctl daemon-reload", true).await?;
        Ok(())
    }

    pub async fn mkdir_p(&self, path: &Path) -> Result<()> {
        self.raw(&format!("mkdir -p {}", path.display()), true)
            .await?;
        Ok(())
    }

    pub async fn remove_path(&self, path: &Path) -> Result<()> {
        self.raw(&format!("rm -rf {}", path.display()), true).await?;
        Ok(())
    }

    /// Write a file with mode and optional owner. Content goes through
    /// the shell quoted, so it must stay text-sized; binaries travel via
    /// the connector's upload.
    pub async fn write_file(
        &self,
        content: &str,
        path: &Path,
        mode: &str,
        owner: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.mkdir_p(parent).await?;
        }
        let mut command = format!(
            "printf '%s' {} > {} && chmod {} {}",
            shell_quote(content),
            path.display(),
            mode,
            path.display()
        );
        if let Some(owner) = owner {
            command.push_str(&format!(" && chown {} {}", owner, path.display()));
        }
        self.raw(&command, true).await?;
        Ok(())
    }

    pub async fn file_exists(&self, path: &Path) -> Result<bool> {
        let output = self
            .raw_status(&format!("test -e {}", path.display()), true)
            .await?;
        Ok(output.success())
    }

    pub async fn sha256(&self, path: &Path) -> Result<String> {
        let output = self
            .raw(&format!("sha256sum {} | awk '{{print $1}}'", path.display()), true)
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorFactory, MemoryConnectorFactory};
    use kubexm_api::Host;

    fn runner_for(factory: &MemoryConnectorFactory, pm: PackageManager) -> Runner {
        let conn = factory.connect(&Host::new("n1", "10.0.0.1")).unwrap();
        let facts = HostFacts {
            package_manager: pm,
            ..HostFacts::default()
        };
        Runner::new(conn, facts, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_install_package_uses_apt_on_debian_family() {
        let factory = MemoryConnectorFactory::new();
        let runner = runner_for(&factory, PackageManager::Apt);
        runner.install_package("containerd").await.unwrap();

        let commands = factory.log().commands_for("n1");
        assert!(commands.iter().any(|c| c.contains("apt-get install -y containerd")));
    }

    #[tokio::test]
    async fn test_install_package_uses_dnf_on_rhel_family() {
        let factory = MemoryConnectorFactory::new();
        let runner = runner_for(&factory, PackageManager::Dnf);
        runner.install_package("containerd").await.unwrap();

        let commands = factory.log().commands_for("n1");
        assert!(commands.iter().any(|c| c.contains("dnf install -y containerd")));
    }

    #[tokio::test]
    async fn test_install_without_package_manager_is_precondition_error() {
        let factory = MemoryConnectorFactory::new();
        let runner = runner_for(&factory, PackageManager::Unknown);
        let result = runner.install_package("containerd").await;
        assert!(matches!(result, Err(EngineError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_raw_maps_nonzero_exit_to_remote_command_error() {
        let factory = MemoryConnectorFactory::new();
        factory.fail_command("n1", "systemctl start etcd", None);
        let runner = runner_for(&factory, PackageManager::Apt);

        let result = runner.start_service("etcd").await;
        assert!(matches!(
            result,
            Err(EngineError::RemoteCommand { exit_code: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_write_file_sets_mode_and_owner() {
        let factory = MemoryConnectorFactory::new();
        let runner = runner_for(&factory, PackageManager::Apt);
        runner
            .write_file(
                "cfg",
                Path::new("/etc/haproxy/haproxy.cfg"),
                "0644",
                Some("root:root"),
            )
            .await
            .unwrap();

        let commands = factory.log().commands_for("n1");
        assert!(commands.iter().any(|c| c.contains("chmod 0644")));
        assert!(commands.iter().any(|c| c.contains("chown root:root")));
    }

    #[tokio::test]
    async fn test_service_active_reflects_exit_code() {
        let factory = MemoryConnectorFactory::new();
        let runner = runner_for(&factory, PackageManager::Apt);
        // Pristine host: nothing is active.
        assert!(!runner.service_active("etcd").await.unwrap());

        factory.respond(Some("n1"), "is-active", "active\n", 0);
        assert!(runner.service_active("etcd").await.unwrap());
    }
}
