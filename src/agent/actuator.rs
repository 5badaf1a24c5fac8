//! Plan execution against the driver, device plugin refresh, and status
//! writeback.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::PostParams;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{build_node_state, ReconcileError};
use crate::driver::MigClient;
use crate::k8s::annotations;
use crate::k8s::device_plugin::{restart_device_plugin, RefreshConfig};
use crate::k8s::types::KubernetesError;
use crate::mig::profile::DeviceStatus;
use crate::plan::{CreateOperation, DeleteOperation, Plan};

/// What applying a plan's operations achieved.
#[derive(Debug, Default)]
pub struct OpsOutcome {
    pub any_delete: bool,
    pub any_create: bool,
    pub failures: Vec<String>,
}

impl OpsOutcome {
    /// Whether at least one driver call succeeded; gates the device plugin
    /// refresh.
    pub fn any_success(&self) -> bool {
        self.any_delete || self.any_create
    }
}

/// Run every operation in the plan against the driver, all deletes first.
///
/// Individual driver failures never abort the plan; they are logged,
/// recorded, and the next operation (or next unit of the same operation)
/// proceeds. Cancellation stops between driver calls.
pub async fn apply_plan_operations(
    mig: &dyn MigClient,
    plan: &Plan,
    token: &CancellationToken,
) -> OpsOutcome {
    let mut outcome = OpsOutcome::default();

    for op in &plan.delete_operations {
        if token.is_cancelled() {
            return outcome;
        }
        apply_delete_operation(mig, op, &mut outcome).await;
    }
    for op in &plan.create_operations {
        if token.is_cancelled() {
            return outcome;
        }
        apply_create_operation(mig, op, &mut outcome).await;
    }

    outcome
}

async fn apply_delete_operation(mig: &dyn MigClient, op: &DeleteOperation, outcome: &mut OpsOutcome) {
    info!(
        gpu_index = op.gpu_index,
        profile = %op.profile,
        quantity = op.quantity,
        "applying delete operation"
    );

    let devices = match mig.list_mig_devices().await {
        Ok(devices) => devices,
        Err(report) => {
            error!("unable to list MIG devices for delete operation: {report:?}");
            outcome.failures.push(format!(
                "could not list {} devices on GPU {}",
                op.profile, op.gpu_index
            ));
            return;
        }
    };

    let mut candidates = Vec::new();
    for device in devices
        .into_iter()
        .filter(|d| d.gpu_index == op.gpu_index && d.profile == op.profile)
    {
        if device.status == DeviceStatus::Free {
            debug!(gpu_instance_id = device.gpu_instance_id, "delete candidate");
            candidates.push(device);
        } else {
            debug!(
                gpu_instance_id = device.gpu_instance_id,
                status = %device.status,
                "device skipped as delete candidate: not free"
            );
        }
    }
    // lowest instance id first, so repeated runs pick the same victims
    candidates.sort_by_key(|d| d.gpu_instance_id);

    let mut deleted = 0;
    for device in &candidates {
        if deleted >= op.quantity {
            break;
        }
        match mig.delete_mig_device(device).await {
            Ok(()) => {
                info!(
                    gpu_index = device.gpu_index,
                    profile = %device.profile,
                    gpu_instance_id = device.gpu_instance_id,
                    "deleted MIG device"
                );
                deleted += 1;
            }
            Err(report) => {
                error!("unable to delete MIG device: {report:?}");
            }
        }
    }

    outcome.any_delete |= deleted > 0;
    if deleted < op.quantity {
        outcome.failures.push(format!(
            "could delete only {deleted} out of {} {} device(s) on GPU {}",
            op.quantity, op.profile, op.gpu_index
        ));
    }
}

async fn apply_create_operation(mig: &dyn MigClient, op: &CreateOperation, outcome: &mut OpsOutcome) {
    info!(
        gpu_index = op.gpu_index,
        profile = %op.profile,
        quantity = op.quantity,
        "applying create operation"
    );

    let mut created = 0;
    for _ in 0..op.quantity {
        // a failed unit does not stop the rest: an earlier delete may have
        // freed the needed slices by the time the next attempt runs
        match mig.create_mig_device(op.gpu_index, &op.profile).await {
            Ok(()) => created += 1,
            Err(report) => {
                error!("unable to create MIG device: {report:?}");
            }
        }
    }

    outcome.any_create |= created > 0;
    if created < op.quantity {
        outcome.failures.push(format!(
            "could create only {created} out of {} {} device(s) on GPU {}",
            op.quantity, op.profile, op.gpu_index
        ));
    }
}

/// Applies plans to the hardware and reports the outcome on the node object.
pub struct Actuator {
    kube: Client,
    mig: Arc<dyn MigClient>,
    node_name: String,
    refresh: RefreshConfig,
}

impl Actuator {
    pub fn new(
        kube: Client,
        mig: Arc<dyn MigClient>,
        node_name: String,
        refresh: RefreshConfig,
    ) -> Self {
        Self {
            kube,
            mig,
            node_name,
            refresh,
        }
    }

    /// Execute `plan`: all deletes, then all creates, then — iff anything
    /// succeeded — the device plugin refresh, then status writeback.
    ///
    /// Returns at most one aggregated error; its presence means not every
    /// operation succeeded (or a plan warning needs surfacing) and the caller
    /// should requeue.
    pub async fn apply(
        &self,
        plan: &Plan,
        token: &CancellationToken,
    ) -> Result<(), Report<ReconcileError>> {
        info!(
            deletes = plan.delete_operations.len(),
            creates = plan.create_operations.len(),
            "applying MIG config plan"
        );
        for warning in &plan.warnings {
            warn!("{warning}");
        }

        let outcome = apply_plan_operations(self.mig.as_ref(), plan, token).await;

        if outcome.any_success() {
            restart_device_plugin(&self.kube, &self.node_name, &self.refresh, token)
                .await
                .change_context(ReconcileError::RefreshFailed)?;
        } else {
            debug!("no MIG device was created or deleted, skipping device plugin refresh");
        }

        self.write_status().await?;

        let mut failures = outcome.failures;
        failures.extend(plan.warnings.iter().map(ToString::to_string));
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Report::new(ReconcileError::PlanNotFulfilled { failures }))
        }
    }

    /// Re-read the driver, rebuild the node state, and replace the node's
    /// status annotations with the fresh set.
    async fn write_status(&self) -> Result<(), Report<ReconcileError>> {
        let inventory = self
            .mig
            .gpu_inventory()
            .await
            .change_context(ReconcileError::WritebackFailed)?;
        let devices = self
            .mig
            .list_mig_devices()
            .await
            .change_context(ReconcileError::WritebackFailed)?;
        let state =
            build_node_state(&inventory, &devices).change_context(ReconcileError::WritebackFailed)?;
        let status = annotations::serialize_status(&state);

        let api: Api<Node> = Api::all(self.kube.clone());
        let mut node = api
            .get(&self.node_name)
            .await
            .change_context(KubernetesError::NodeFetchFailed {
                node: self.node_name.clone(),
            })
            .change_context(ReconcileError::WritebackFailed)?;

        let node_annotations = node.metadata.annotations.get_or_insert_with(Default::default);
        node_annotations.retain(|key, _| !annotations::is_status_key(key));
        node_annotations.extend(status);

        match api
            .replace(&self.node_name, &PostParams::default(), &node)
            .await
        {
            Ok(_) => {
                debug!(node = %self.node_name, "status annotations written");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(Report::new(KubernetesError::StoreConflict)
                    .change_context(ReconcileError::WritebackFailed))
            }
            Err(err) => Err(Report::new(err)
                .change_context(KubernetesError::WriteFailed {
                    node: self.node_name.clone(),
                })
                .change_context(ReconcileError::WritebackFailed)),
        }
    }
}
