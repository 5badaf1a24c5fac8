//! The reconcile loop: node watch, short-circuits, plan, actuate.

use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::predicates;
use kube::runtime::watcher::{watcher, Config};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::actuator::Actuator;
use crate::agent::{build_node_state, ReconcileError};
use crate::driver::MigClient;
use crate::k8s::annotations;
use crate::k8s::device_plugin::RefreshConfig;
use crate::k8s::types::KubernetesError;
use crate::plan::new_plan;

const STREAM_RETRY_DELAY: Duration = Duration::from_secs(5);
const INITIAL_REQUEUE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_REQUEUE_BACKOFF: Duration = Duration::from_secs(60);

/// Watches this node's annotations and reconciles the GPUs' MIG geometry
/// against them, one reconciliation at a time.
pub struct MigReconciler {
    kube: Client,
    mig: Arc<dyn MigClient>,
    node_name: String,
    actuator: Actuator,
    /// Process-wide: the driver is not safe against concurrent geometry
    /// mutation, and the device plugin refresh must not race with itself.
    reconcile_lock: Mutex<()>,
}

impl MigReconciler {
    pub fn new(
        kube: Client,
        mig: Arc<dyn MigClient>,
        node_name: String,
        refresh: RefreshConfig,
    ) -> Self {
        let actuator = Actuator::new(kube.clone(), mig.clone(), node_name.clone(), refresh);
        Self {
            kube,
            mig,
            node_name,
            actuator,
            reconcile_lock: Mutex::new(()),
        }
    }

    /// Run until cancelled, restarting the node watch stream on failure.
    pub async fn run(&self, token: CancellationToken) {
        info!(node = %self.node_name, "starting MIG reconcile loop");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("reconcile loop shutdown requested");
                    break;
                }
                result = self.watch_node(&token) => {
                    match result {
                        Ok(()) => {
                            warn!("node watch stream ended unexpectedly, restarting...");
                        }
                        Err(report) => {
                            error!("node watch failed: {report:?}");
                            tokio::time::sleep(STREAM_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    /// Watch this node and reconcile on every annotation change.
    ///
    /// The watcher is scoped to the node by field selector, delete events are
    /// suppressed by `applied_objects`, and the annotation predicate drops
    /// events that change anything else.
    async fn watch_node(&self, token: &CancellationToken) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.kube.clone());
        let config = Config::default().fields(&format!("metadata.name={}", self.node_name));

        let mut stream = watcher(api, config)
            .applied_objects()
            .predicate_filter(predicates::annotations)
            .boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(node) => {
                    debug!(node = %node.name_any(), "node annotations changed");
                    self.reconcile_with_requeue(token).await;
                }
                Err(err) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        node: self.node_name.clone(),
                        message: err.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Reconcile until clean, backing off exponentially between attempts.
    /// Every attempt re-reads the node, so spec changes made while backing
    /// off are picked up.
    async fn reconcile_with_requeue(&self, token: &CancellationToken) {
        let mut backoff = INITIAL_REQUEUE_BACKOFF;
        loop {
            match self.reconcile(token).await {
                Ok(()) => return,
                Err(report) => {
                    error!("reconciliation failed, requeueing: {report:?}");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_REQUEUE_BACKOFF);
                }
            }
        }
    }

    /// One end-to-end reconciliation pass.
    pub async fn reconcile(&self, token: &CancellationToken) -> Result<(), Report<ReconcileError>> {
        let _guard = self.reconcile_lock.lock().await;

        let api: Api<Node> = Api::all(self.kube.clone());
        let node = api
            .get(&self.node_name)
            .await
            .change_context(ReconcileError::NodeFetch)?;
        let node_annotations = node.metadata.annotations.unwrap_or_default();

        let spec = annotations::parse_spec(&node_annotations);
        let status = annotations::parse_status(&node_annotations);
        if annotations::spec_matches_status(&spec, &status) {
            info!("reported status matches desired MIG config, nothing to do");
            return Ok(());
        }

        let inventory = self
            .mig
            .gpu_inventory()
            .await
            .change_context(ReconcileError::DriverState)?;
        for gpu in &inventory {
            debug!(
                index = gpu.index,
                name = %gpu.name,
                memory_mib = gpu.memory_mib,
                "discovered GPU"
            );
        }
        let devices = self
            .mig
            .list_mig_devices()
            .await
            .change_context(ReconcileError::DriverState)?;
        let state =
            build_node_state(&inventory, &devices).change_context(ReconcileError::InvalidState)?;

        if state.matches(&spec) {
            info!("actual state matches desired MIG config, nothing to do");
            return Ok(());
        }

        let plan = new_plan(&state, &spec).change_context(ReconcileError::PlanFailed)?;
        if plan.is_empty() {
            info!("MIG config plan is empty, nothing to do");
            return Ok(());
        }

        self.actuator.apply(&plan, token).await
    }
}
