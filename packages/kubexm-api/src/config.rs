use crate::error::{ConfigError, Result};
use crate::expand::expand;
use crate::host::{HostSpec, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Container runtime selector. Missing or empty config defaults to
/// containerd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Containerd,
    Docker,
    Crio,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::Docker => "docker",
            RuntimeKind::Crio => "crio",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Etcd deployment flavour. Missing config defaults to internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtcdKind {
    Internal,
    External,
    Kubeadm,
}

impl EtcdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EtcdKind::Internal => "internal",
            EtcdKind::External => "external",
            EtcdKind::Kubeadm => "kubeadm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeSpec {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub container_runtime: Option<ContainerRuntimeSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub external_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub pod_cidr: Option<String>,
    #[serde(default)]
    pub service_cidr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneEndpoint {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub internal_lb_type: Option<String>,
    #[serde(default)]
    pub external_lb_type: Option<String>,
}

fn default_api_port() -> u16 {
    6443
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSpec {
    #[serde(default)]
    pub skip_preflight: bool,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub roles: BTreeMap<Role, Vec<String>>,
    #[serde(default)]
    pub kubernetes: KubernetesSpec,
    #[serde(default)]
    pub etcd: Option<EtcdSpec>,
    #[serde(default)]
    pub network: Option<NetworkSpec>,
    #[serde(default)]
    pub control_plane_endpoint: Option<ControlPlaneEndpoint>,
    #[serde(default)]
    pub addons: Vec<String>,
    #[serde(default)]
    pub global: Option<GlobalSpec>,
    /// Unknown fields are preserved but ignored.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// The declarative cluster specification. Loaded from YAML, consulted
/// through typed accessors everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ClusterSpec,
}

impl ClusterConfig {
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let config: ClusterConfig = serde_yaml::from_str(doc)?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let doc = std::fs::read_to_string(path)?;
        Self::from_yaml(&doc)
    }

    pub fn cluster_name(&self) -> &str {
        &self.metadata.name
    }

    /// Container runtime with the defaulting rule: missing or empty
    /// means containerd.
    pub fn container_runtime_type(&self) -> RuntimeKind {
        let kind = self
            .spec
            .kubernetes
            .container_runtime
            .as_ref()
            .and_then(|rt| rt.kind.as_deref())
            .unwrap_or("");
        match kind {
            "docker" => RuntimeKind::Docker,
            "crio" | "cri-o" => RuntimeKind::Crio,
            _ => RuntimeKind::Containerd,
        }
    }

    /// Etcd flavour, defaulting to internal.
    pub fn etcd_type(&self) -> EtcdKind {
        let kind = self
            .spec
            .etcd
            .as_ref()
            .and_then(|e| e.kind.as_deref())
            .unwrap_or("");
        match kind {
            "external" => EtcdKind::External,
            "kubeadm" => EtcdKind::Kubeadm,
            _ => EtcdKind::Internal,
        }
    }

    pub fn external_etcd_endpoints(&self) -> &[String] {
        self.spec
            .etcd
            .as_ref()
            .map(|e| e.external_endpoints.as_slice())
            .unwrap_or(&[])
    }

    /// CNI plugin name, empty when unset.
    pub fn network_plugin(&self) -> &str {
        self.spec
            .network
            .as_ref()
            .and_then(|n| n.plugin.as_deref())
            .unwrap_or("")
    }

    pub fn pod_cidr(&self) -> &str {
        self.spec
            .network
            .as_ref()
            .and_then(|n| n.pod_cidr.as_deref())
            .unwrap_or("10.244.0.0/16")
    }

    pub fn kubernetes_version(&self) -> &str {
        &self.spec.kubernetes.version
    }

    pub fn control_plane_domain(&self) -> &str {
        self.spec
            .control_plane_endpoint
            .as_ref()
            .and_then(|cpe| cpe.domain.as_deref())
            .unwrap_or("lb.kubexm.local")
    }

    pub fn control_plane_port(&self) -> u16 {
        self.spec
            .control_plane_endpoint
            .as_ref()
            .map(|cpe| cpe.port)
            .unwrap_or_else(default_api_port)
    }

    pub fn internal_lb_type(&self) -> Option<&str> {
        self.spec
            .control_plane_endpoint
            .as_ref()
            .and_then(|cpe| cpe.internal_lb_type.as_deref())
    }

    pub fn addons(&self) -> &[String] {
        &self.spec.addons
    }

    pub fn skip_preflight(&self) -> bool {
        self.spec
            .global
            .as_ref()
            .map(|g| g.skip_preflight)
            .unwrap_or(false)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.spec
            .global
            .as_ref()
            .and_then(|g| g.work_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Expanded hostnames holding a given role, config order preserved.
    pub fn role_hostnames(&self, role: Role) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if let Some(patterns) = self.spec.roles.get(&role) {
            for pattern in patterns {
                out.extend(expand(pattern)?);
            }
        }
        Ok(out)
    }

    /// Number of hosts holding the master role after expansion. Used by
    /// enablement checks that only see the config; defects surface in
    /// `validate`, so an unparseable pattern counts as zero here.
    pub fn master_count(&self) -> usize {
        self.role_hostnames(Role::Master).map(|v| v.len()).unwrap_or(0)
    }

    /// Surface config defects before any planning happens.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(ConfigError::Defect("cluster name is empty".to_string()));
        }
        if self.spec.hosts.is_empty() {
            return Err(ConfigError::Defect("no hosts defined".to_string()));
        }

        let mut known: BTreeSet<String> = BTreeSet::new();
        for spec in &self.spec.hosts {
            for name in expand(&spec.name)? {
                if !known.insert(name.clone()) {
                    return Err(ConfigError::Defect(format!("host {} defined twice", name)));
                }
            }
        }

        for (role, patterns) in &self.spec.roles {
            for pattern in patterns {
                for name in expand(pattern)? {
                    if !known.contains(&name) {
                        return Err(ConfigError::Defect(format!(
                            "role {} references unknown host {}",
                            role, name
                        )));
                    }
                }
            }
        }

        if self.master_count() == 0 {
            return Err(ConfigError::Defect("no master role assigned".to_string()));
        }

        if let Some(rt) = self
            .spec
            .kubernetes
            .container_runtime
            .as_ref()
            .and_then(|rt| rt.kind.as_deref())
        {
            if !rt.is_empty() && !matches!(rt, "containerd" | "docker" | "crio" | "cri-o") {
                return Err(ConfigError::Defect(format!(
                    "unknown container runtime type {}",
                    rt
                )));
            }
        }

        if let Some(kind) = self.spec.etcd.as_ref().and_then(|e| e.kind.as_deref()) {
            if !kind.is_empty() && !matches!(kind, "internal" | "external" | "kubeadm") {
                return Err(ConfigError::Defect(format!("unknown etcd type {}", kind)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
apiVersion: kubexm.io/v1alpha2
kind: Cluster
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
"#;

    #[test]
    fn test_minimal_config_parses_and_validates() {
        let config = ClusterConfig::from_yaml(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cluster_name(), "demo");
        assert_eq!(config.kubernetes_version(), "v1.29.2");
    }

    #[test]
    fn test_container_runtime_defaults_to_containerd() {
        let config = ClusterConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.container_runtime_type(), RuntimeKind::Containerd);

        // Empty string keeps the default too.
        let doc = MINIMAL.to_string()
            + "    containerRuntime:\n      type: \"\"\n";
        let config = ClusterConfig::from_yaml(&doc).unwrap();
        assert_eq!(config.container_runtime_type(), RuntimeKind::Containerd);
    }

    #[test]
    fn test_container_runtime_docker() {
        let doc = MINIMAL.to_string()
            + "    containerRuntime:\n      type: docker\n";
        let config = ClusterConfig::from_yaml(&doc).unwrap();
        assert_eq!(config.container_runtime_type(), RuntimeKind::Docker);
    }

    #[test]
    fn test_etcd_defaults_to_internal() {
        let config = ClusterConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.etcd_type(), EtcdKind::Internal);
    }

    #[test]
    fn test_etcd_external() {
        let doc = MINIMAL.to_string()
            + "  etcd:\n    type: external\n    externalEndpoints: [\"https://10.1.0.1:2379\"]\n";
        let config = ClusterConfig::from_yaml(&doc).unwrap();
        assert_eq!(config.etcd_type(), EtcdKind::External);
        assert_eq!(config.external_etcd_endpoints().len(), 1);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let doc = MINIMAL.to_string() + "  registry:\n    mirror: registry.local\n";
        let config = ClusterConfig::from_yaml(&doc).unwrap();
        assert!(config.spec.extra.contains_key("registry"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_master() {
        let doc = r#"
metadata:
  name: demo
spec:
  hosts:
    - name: n1
      address: 10.0.0.1
  roles:
    worker: [n1]
"#;
        let config = ClusterConfig::from_yaml(doc).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Defect(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_role_member() {
        let doc = r#"
metadata:
  name: demo
spec:
  hosts:
    - name: n1
      address: 10.0.0.1
  roles:
    master: [n2]
"#;
        let config = ClusterConfig::from_yaml(doc).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_hostnames_expand_patterns() {
        let doc = r#"
metadata:
  name: demo
spec:
  hosts:
    - name: "node[01:03]"
      address: "10.0.0.[1:3]"
  roles:
    master: ["node[01:03]"]
"#;
        let config = ClusterConfig::from_yaml(doc).unwrap();
        let masters = config.role_hostnames(Role::Master).unwrap();
        assert_eq!(masters, vec!["node01", "node02", "node03"]);
        assert_eq!(config.master_count(), 3);
    }

    #[test]
    fn test_validate_rejects_unknown_runtime() {
        let doc = MINIMAL.to_string()
            + "    containerRuntime:\n      type: rocket\n";
        let config = ClusterConfig::from_yaml(&doc).unwrap();
        assert!(config.validate().is_err());
    }
}
