use crate::connector::ConnectorFactory;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use kubexm_api::{expand, ClusterConfig, Host, HostFacts, InitSystem, PackageManager, Role};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Expanded host roster with role resolution and a per-run facts cache.
/// Host order is the config insertion order throughout, so plans are
/// reproducible.
pub struct HostRegistry {
    hosts: Vec<Host>,
    index: HashMap<String, usize>,
    facts: DashMap<String, Arc<OnceCell<HostFacts>>>,
}

impl HostRegistry {
    /// Build the roster from a validated config: expand host name and
    /// address range patterns in lockstep, then resolve role groups.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        config.validate().map_err(EngineError::Config)?;

        let mut hosts: Vec<Host> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for spec in &config.spec.hosts {
            let names = expand(&spec.name).map_err(EngineError::Config)?;
            let addresses = expand(&spec.address).map_err(EngineError::Config)?;
            if addresses.len() != 1 && addresses.len() != names.len() {
                return Err(EngineError::ConfigDefect(format!(
                    "host {} expands to {} names but {} addresses",
                    spec.name,
                    names.len(),
                    addresses.len()
                )));
            }

            for (i, name) in names.into_iter().enumerate() {
                let address = if addresses.len() == 1 {
                    addresses[0].clone()
                } else {
                    addresses[i].clone()
                };
                let host = Host {
                    name: name.clone(),
                    address,
                    port: spec.port,
                    user: spec.user.clone(),
                    roles: Vec::new(),
                };
                index.insert(name, hosts.len());
                hosts.push(host);
            }
        }

        for (role, patterns) in &config.spec.roles {
            for pattern in patterns {
                for name in expand(pattern).map_err(EngineError::Config)? {
                    let idx = *index.get(&name).ok_or_else(|| {
                        EngineError::ConfigDefect(format!(
                            "role {} references unknown host {}",
                            role, name
                        ))
                    })?;
                    if !hosts[idx].roles.contains(role) {
                        hosts[idx].roles.push(*role);
                    }
                }
            }
        }

        debug!(hosts = hosts.len(), "host roster built");
        Ok(Self {
            hosts,
            index,
            facts: DashMap::new(),
        })
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.index.get(name).map(|idx| &self.hosts[*idx])
    }

    /// Hosts holding a role, insertion order preserved.
    pub fn hosts_by_role(&self, role: Role) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| h.has_role(role))
            .cloned()
            .collect()
    }

    /// Hosts that run kubernetes components: masters and workers,
    /// deduplicated, insertion order preserved.
    pub fn kubernetes_hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| h.has_role(Role::Master) || h.has_role(Role::Worker))
            .cloned()
            .collect()
    }

    /// Worker-only hosts: they join the cluster as workers; dual-role
    /// hosts already join as control-plane nodes.
    pub fn worker_only_hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| h.has_role(Role::Worker) && !h.has_role(Role::Master))
            .cloned()
            .collect()
    }

    pub fn first_master(&self) -> Result<Host> {
        self.hosts_by_role(Role::Master)
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ConfigDefect("no master role assigned".to_string()))
    }

    /// The machine kubexm runs on.
    pub fn control_node(&self) -> Host {
        Host::control_node()
    }

    /// Probe OS facts for a host, at most once per run. Concurrent
    /// callers for the same host coalesce on the cell and block on the
    /// first probe.
    pub async fn facts(
        &self,
        host: &Host,
        connectors: &dyn ConnectorFactory,
        cancel: &CancellationToken,
    ) -> Result<HostFacts> {
        let cell = self
            .facts
            .entry(host.name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let facts = cell
            .get_or_try_init(|| probe_facts(host, connectors, cancel))
            .await?;
        Ok(facts.clone())
    }
}

async fn probe_facts(
    host: &Host,
    connectors: &dyn ConnectorFactory,
    cancel: &CancellationToken,
) -> Result<HostFacts> {
    debug!(host = %host.name, "probing host facts");
    let conn = connectors.connect(host)?;

    let arch_raw = conn.exec("uname -m", false, cancel).await?.stdout;
    let kernel = conn.exec("uname -r", false, cancel).await?.stdout;
    let os_release = conn
        .exec("cat /etc/os-release", false, cancel)
        .await?
        .stdout;
    let init_raw = conn.exec("cat /proc/1/comm", false, cancel).await?.stdout;

    let mut distro = String::new();
    let mut os_family = String::new();
    let mut version = String::new();
    for line in os_release.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').to_string();
        match key {
            "ID" => distro = value,
            "ID_LIKE" => {
                os_family = value
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string()
            }
            "VERSION_ID" => version = value,
            _ => {}
        }
    }
    if os_family.is_empty() {
        os_family = distro.clone();
    }

    let package_manager = detect_package_manager(&*conn, cancel).await?;

    let arch = match arch_raw.trim() {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
    .to_string();

    let init_system = if init_raw.trim() == "systemd" {
        InitSystem::Systemd
    } else {
        InitSystem::Unknown
    };

    Ok(HostFacts {
        os_family,
        distro,
        version,
        arch,
        kernel: kernel.trim().to_string(),
        package_manager,
        init_system,
    })
}

async fn detect_package_manager(
    conn: &dyn crate::connector::Connector,
    cancel: &CancellationToken,
) -> Result<PackageManager> {
    for (probe, pm) in [
        ("command -v apt-get", PackageManager::Apt),
        ("command -v dnf", PackageManager::Dnf),
        ("command -v yum", PackageManager::Yum),
    ] {
        if conn.exec(probe, false, cancel).await?.success() {
            return Ok(pm);
        }
    }
    Ok(PackageManager::Unknown)
}
