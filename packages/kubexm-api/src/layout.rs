use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory kubexm keeps under the work dir.
pub const WORKSPACE_DIR: &str = ".kubexm";

/// Binary/image BOM storage category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BomKind {
    Etcd,
    Kubernetes,
    ContainerRuntime,
    Cni,
    Helm,
    Registry,
    Build,
}

impl BomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BomKind::Etcd => "etcd",
            BomKind::Kubernetes => "kubernetes",
            BomKind::ContainerRuntime => "container_runtime",
            BomKind::Cni => "cni",
            BomKind::Helm => "helm",
            BomKind::Registry => "registry",
            BomKind::Build => "build",
        }
    }
}

/// Regional download mirror selector. `KXZONE=cn` picks the CN mirror;
/// it affects BOM URLs only, never the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zone {
    #[default]
    Default,
    Cn,
}

impl Zone {
    pub fn from_env() -> Self {
        match std::env::var("KXZONE").as_deref() {
            Ok("cn") | Ok("CN") => Zone::Cn,
            _ => Zone::Default,
        }
    }

    pub fn binary_base_url(&self) -> &'static str {
        match self {
            Zone::Default => "https://dl.k8s.io",
            Zone::Cn => "https://kubernetes-release.pek3b.qingstor.com",
        }
    }
}

/// On-disk layout of one cluster's workspace on the control node:
/// `<workdir>/.kubexm/<cluster_name>/`.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(work_dir: &Path, cluster_name: &str) -> Self {
        Self {
            root: work_dir.join(WORKSPACE_DIR).join(cluster_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-host upload staging directory.
    pub fn host_dir(&self, hostname: &str) -> PathBuf {
        self.root.join(hostname)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Storage path for one BOM artifact:
    /// `<root>/<type>/<component>/<version>/<arch>/<file>`.
    pub fn bom_path(
        &self,
        kind: BomKind,
        component: &str,
        version: &str,
        arch: &str,
        file: &str,
    ) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(component)
            .join(version)
            .join(arch)
            .join(file)
    }
}
