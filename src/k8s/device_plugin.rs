//! Restarting the NVIDIA device plugin pod.
//!
//! The device plugin advertises MIG devices to workloads and does not
//! hot-reload, so after any successful geometry change its pod is deleted and
//! the daemonset is left to recreate it.

use std::time::Duration;

use error_stack::{Report, ResultExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client, ResourceExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::k8s::types::KubernetesError;

const DEVICE_PLUGIN_LABEL: &str = "app=nvidia-device-plugin-daemonset";

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

async fn list_device_plugin_pods(
    client: &Client,
    node_name: &str,
) -> Result<Vec<Pod>, Report<KubernetesError>> {
    let api: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default()
        .labels(DEVICE_PLUGIN_LABEL)
        .fields(&format!("spec.nodeName={node_name}"));
    let pods = api
        .list(&params)
        .await
        .change_context(KubernetesError::WatchFailed {
            node: node_name.to_string(),
            message: "failed to list device plugin pods".to_string(),
        })?;
    Ok(pods.items)
}

fn pod_is_ready(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");
    pod.metadata.deletion_timestamp.is_none() && running
}

/// Delete the device plugin pod on `node_name` and block until its daemonset
/// has recreated it.
///
/// Fails with [`KubernetesError::RefreshPreconditionFailed`] unless exactly
/// one matching pod exists, and with [`KubernetesError::RefreshTimeout`] if
/// the replacement pod is not Running within the configured timeout.
pub async fn restart_device_plugin(
    client: &Client,
    node_name: &str,
    config: &RefreshConfig,
    token: &CancellationToken,
) -> Result<(), Report<KubernetesError>> {
    info!(node_name, "restarting nvidia device plugin");

    let pods = list_device_plugin_pods(client, node_name).await?;
    if pods.len() != 1 {
        return Err(Report::new(KubernetesError::RefreshPreconditionFailed {
            found: pods.len(),
        }));
    }

    let pod = &pods[0];
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let name = pod.name_any();
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    api.delete(&name, &DeleteParams::default())
        .await
        .change_context(KubernetesError::WatchFailed {
            node: node_name.to_string(),
            message: format!("failed to delete device plugin pod {namespace}/{name}"),
        })?;
    debug!(node_name, pod = %name, "deleted device plugin pod");

    wait_device_plugin_restart(client, node_name, config, token).await?;
    info!(node_name, "nvidia device plugin restarted");
    Ok(())
}

async fn wait_device_plugin_restart(
    client: &Client,
    node_name: &str,
    config: &RefreshConfig,
    token: &CancellationToken,
) -> Result<(), Report<KubernetesError>> {
    let deadline = Instant::now() + config.timeout;

    loop {
        debug!(node_name, "waiting for device plugin pod to be recreated");
        let pods = list_device_plugin_pods(client, node_name).await?;
        if pods.len() == 1 && pod_is_ready(&pods[0]) {
            debug!(node_name, "device plugin pod recreated");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Report::new(KubernetesError::RefreshTimeout {
                node: node_name.to_string(),
            }));
        }

        tokio::select! {
            _ = token.cancelled() => {
                return Err(Report::new(KubernetesError::Cancelled));
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}
