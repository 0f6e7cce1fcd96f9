use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};

/// Node role identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
    Etcd,
    LoadBalancer,
    Registry,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
            Role::Etcd => "etcd",
            Role::LoadBalancer => "loadbalancer",
            Role::Registry => "registry",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "master" => Ok(Role::Master),
            "worker" => Ok(Role::Worker),
            "etcd" => Ok(Role::Etcd),
            "loadbalancer" => Ok(Role::LoadBalancer),
            "registry" => Ok(Role::Registry),
            _ => Err(ConfigError::UnknownRole(s.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw host record from the cluster config. The name and address may be
/// range patterns (`node[01:05]`); expansion happens when the roster is
/// built by the host registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub internal_address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

/// Expanded roster record. One `Host` per real machine, roles resolved
/// from the config role groups in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub roles: Vec<Role>,
}

impl Host {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: default_port(),
            user: default_user(),
            roles: Vec::new(),
        }
    }

    /// The synthetic control node: the machine kubexm itself runs on.
    pub fn control_node() -> Self {
        Self {
            name: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
            port: 0,
            user: default_user(),
            roles: Vec::new(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_control_node(&self) -> bool {
        self.name == "localhost" && self.port == 0
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Package manager detected on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Unknown,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Unknown => "unknown",
        }
    }
}

/// Init system detected on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitSystem {
    Systemd,
    Unknown,
}

/// OS facts probed from a host on first use and cached for the lifetime
/// of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    pub os_family: String,
    pub distro: String,
    pub version: String,
    pub arch: String,
    pub kernel: String,
    pub package_manager: PackageManager,
    pub init_system: InitSystem,
}

impl Default for HostFacts {
    fn default() -> Self {
        Self {
            os_family: String::new(),
            distro: String::new(),
            version: String::new(),
            arch: "amd64".to_string(),
            kernel: String::new(),
            package_manager: PackageManager::Unknown,
            init_system: InitSystem::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in &[
            Role::Master,
            Role::Worker,
            Role::Etcd,
            Role::LoadBalancer,
            Role::Registry,
        ] {
            let s = role.as_str();
            let parsed = Role::parse(s).unwrap();
            assert_eq!(*role, parsed);
        }
    }

    #[test]
    fn test_role_parse_invalid() {
        assert!(Role::parse("controlplane").is_err());
    }

    #[test]
    fn test_host_spec_defaults() {
        let yaml = "name: n1\naddress: 10.0.0.1\n";
        let spec: HostSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.port, 22);
        assert_eq!(spec.user, "root");
    }

    #[test]
    fn test_control_node() {
        let host = Host::control_node();
        assert!(host.is_control_node());
        assert!(host.roles.is_empty());
    }

    #[test]
    fn test_has_role() {
        let mut host = Host::new("m1", "10.0.0.1");
        host.roles.push(Role::Master);
        assert!(host.has_role(Role::Master));
        assert!(!host.has_role(Role::Worker));
    }
}
