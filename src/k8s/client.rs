use std::path::Path;

use error_stack::{Report, ResultExt};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::k8s::types::KubernetesError;

/// Build the Kubernetes client the agent uses for its node and for the
/// device plugin pod.
///
/// An explicit kubeconfig path wins; otherwise the configuration is inferred
/// (in-cluster service account, falling back to `~/.kube/config`). Every
/// later call is scoped to `node_name`, so connection failures carry it.
pub async fn init_kube_client(
    kubeconfig: Option<&Path>,
    node_name: &str,
) -> Result<Client, Report<KubernetesError>> {
    let config = match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "loading explicit kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path).change_context(
                KubernetesError::ConnectionFailed {
                    message: format!("unreadable kubeconfig at {}", path.display()),
                },
            )?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!("invalid kubeconfig at {}", path.display()),
                })?
        }
        None => Config::infer()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "no usable in-cluster or local Kubernetes configuration".to_string(),
            })?,
    };

    Client::try_from(config)
        .change_context(KubernetesError::ConnectionFailed {
            message: "failed to build Kubernetes client".to_string(),
        })
        .attach_printable_lazy(|| format!("agent node: {node_name}"))
}
