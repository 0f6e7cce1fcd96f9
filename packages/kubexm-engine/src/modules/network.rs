use crate::action::{Action, PrecheckOutcome};
use crate::context::{ExecutionContext, TaskContext};
use crate::error::Result;
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::task::Task;
use async_trait::async_trait;
use kubexm_api::ClusterConfig;
use std::sync::Arc;

const CALICO_MANIFEST: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/v3.27.2/manifests/calico.yaml";
const FLANNEL_MANIFEST: &str =
    "https://raw.githubusercontent.com/flannel-io/flannel/v0.24.4/Documentation/kube-flannel.yml";

/// Applies a CNI manifest from the first master. One module per plugin;
/// exactly the one matching `spec.network.plugin` is enabled.
pub struct CalicoModule;

impl Module for CalicoModule {
    fn name(&self) -> &str {
        "calico"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![Arc::new(CniApplyTask {
            task_name: "calico-apply",
            manifest: CALICO_MANIFEST,
            probe: "daemonset/calico-node",
        })]
    }

    fn is_enabled(&self, config: &ClusterConfig) -> bool {
        config.network_plugin() == "calico"
    }
}

pub struct FlannelModule;

impl Module for FlannelModule {
    fn name(&self) -> &str {
        "flannel"
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        vec![Arc::new(CniApplyTask {
            task_name: "flannel-apply",
            manifest: FLANNEL_MANIFEST,
            probe: "daemonset/kube-flannel-ds",
        })]
    }

    fn is_enabled(&self, config: &ClusterConfig) -> bool {
        config.network_plugin() == "flannel"
    }
}

struct CniApplyTask {
    task_name: &'static str,
    manifest: &'static str,
    probe: &'static str,
}

#[async_trait]
impl Task for CniApplyTask {
    fn name(&self) -> &str {
        self.task_name
    }

    async fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let first = ctx.registry().first_master()?;
        let action = CniApplyAction {
            manifest: self.manifest,
            probe: self.probe,
        };
        let mut fragment = ExecutionFragment::new();
        fragment.add_node(ctx.node("manifest", &first, Arc::new(action)))?;
        fragment.calculate_frontiers();
        Ok(fragment)
    }
}

struct CniApplyAction {
    manifest: &'static str,
    probe: &'static str,
}

#[async_trait]
impl Action for CniApplyAction {
    fn describe(&self) -> String {
        format!("kubectl apply -f {}", self.manifest)
    }

    async fn precheck(&self, ctx: &ExecutionContext) -> Result<PrecheckOutcome> {
        let runner = ctx.runner().await?;
        let output = runner
            .raw_status(
                &format!(
                    "kubectl --kubeconfig /etc/kubernetes/admin.conf -n kube-system get {}",
                    self.probe
                ),
                true,
            )
            .await?;
        if output.success() {
            Ok(PrecheckOutcome::Satisfied)
        } else {
            Ok(PrecheckOutcome::NotSatisfied)
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let runner = ctx.runner().await?;
        runner
            .raw(
                &format!(
                    "kubectl --kubeconfig /etc/kubernetes/admin.conf apply -f {}",
                    self.manifest
                ),
                true,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(plugin: &str) -> ClusterConfig {
        ClusterConfig::from_yaml(&format!(
            r#"
metadata:
  name: demo
spec:
  hosts:
    - name: m1
      address: 10.0.0.1
  roles:
    master: [m1]
  network:
    plugin: {plugin}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_exactly_matching_plugin_module_is_enabled() {
        let calico = config("calico");
        assert!(CalicoModule.is_enabled(&calico));
        assert!(!FlannelModule.is_enabled(&calico));

        let flannel = config("flannel");
        assert!(!CalicoModule.is_enabled(&flannel));
        assert!(FlannelModule.is_enabled(&flannel));
    }

    #[test]
    fn test_no_plugin_disables_both() {
        let config = ClusterConfig::from_yaml(
            r#"
metadata:
  name: demo
spec:
  hosts:
    - name: m1
      address: 10.0.0.1
  roles:
    master: [m1]
"#,
        )
        .unwrap();
        assert!(!CalicoModule.is_enabled(&config));
        assert!(!FlannelModule.is_enabled(&config));
    }
}
