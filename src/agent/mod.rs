//! The agent proper: plan actuation and the reconcile loop.

pub mod actuator;
pub mod reconciler;

pub use actuator::{Actuator, OpsOutcome};
pub use reconciler::MigReconciler;

use thiserror::Error;
use tracing::warn;

use crate::driver::{GpuInfo, MigDevice};
use crate::mig::catalog::{self, GpuModel};
use crate::mig::gpu::{Gpu, GpuError};
use crate::mig::node::NodeState;
use crate::mig::profile::DeviceStatus;
use crate::mig::{geometry_add, Geometry};

/// Errors a reconciliation can end with. Exactly one is returned per failed
/// reconciliation; the framework requeues on its presence.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to fetch node object from the cluster")]
    NodeFetch,
    #[error("failed to read GPU state from the driver")]
    DriverState,
    #[error("node GPU state is invalid")]
    InvalidState,
    #[error("failed to compute MIG config plan")]
    PlanFailed,
    #[error("MIG config plan was not fully applied: {}", .failures.join("; "))]
    PlanNotFulfilled { failures: Vec<String> },
    #[error("device plugin refresh failed")]
    RefreshFailed,
    #[error("status annotation writeback failed")]
    WritebackFailed,
}

/// Build the node's GPU state from what the driver reports.
///
/// Devices referencing a GPU index missing from the inventory are dropped
/// with a warning; a GPU whose device set forms an illegal geometry fails the
/// whole build.
pub fn build_node_state(
    inventory: &[GpuInfo],
    devices: &[MigDevice],
) -> Result<NodeState, GpuError> {
    let known_indices: Vec<u32> = inventory.iter().map(|info| info.index).collect();
    for device in devices {
        if !known_indices.contains(&device.gpu_index) {
            warn!(
                gpu_index = device.gpu_index,
                profile = %device.profile,
                "dropping MIG device reported for a GPU missing from the inventory"
            );
        }
    }

    let mut gpus = Vec::with_capacity(inventory.len());
    for info in inventory {
        let model = catalog::model_for_device_name(&info.name)
            .unwrap_or_else(|| GpuModel::new(info.name.clone()));

        let mut free = Geometry::new();
        let mut used = Geometry::new();
        for device in devices.iter().filter(|d| d.gpu_index == info.index) {
            match device.status {
                DeviceStatus::Free => geometry_add(&mut free, &device.profile, 1),
                DeviceStatus::Used => geometry_add(&mut used, &device.profile, 1),
            }
        }
        gpus.push(Gpu::new(model, info.index, used, free)?);
    }
    Ok(NodeState::new(gpus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mig::catalog::MODEL_A100_SXM4_40GB;
    use crate::mig::profile::ProfileName;

    fn inventory() -> Vec<GpuInfo> {
        vec![
            GpuInfo {
                index: 0,
                name: "NVIDIA A100-SXM4-40GB".to_string(),
                memory_mib: 40960,
            },
            GpuInfo {
                index: 1,
                name: "NVIDIA A100-SXM4-40GB".to_string(),
                memory_mib: 40960,
            },
        ]
    }

    fn device(gpu_index: u32, profile: &str, id: u32, status: DeviceStatus) -> MigDevice {
        MigDevice {
            gpu_index,
            profile: profile.parse().unwrap(),
            gpu_instance_id: id,
            status,
        }
    }

    #[test]
    fn groups_devices_by_gpu_and_status() {
        let devices = vec![
            device(0, "1g.5gb", 1, DeviceStatus::Free),
            device(0, "1g.5gb", 2, DeviceStatus::Used),
            device(1, "3g.20gb", 1, DeviceStatus::Free),
        ];
        let state = build_node_state(&inventory(), &devices).unwrap();

        let profile: ProfileName = "1g.5gb".parse().unwrap();
        let gpu0 = state.gpu(0).unwrap();
        assert_eq!(gpu0.free().get(&profile), Some(&1));
        assert_eq!(gpu0.used().get(&profile), Some(&1));
        assert_eq!(gpu0.model().as_str(), MODEL_A100_SXM4_40GB);
        assert_eq!(state.gpu(1).unwrap().count_of(&"3g.20gb".parse().unwrap()), 1);
    }

    #[test]
    fn gpus_without_devices_are_empty() {
        let state = build_node_state(&inventory(), &[]).unwrap();
        assert_eq!(state.gpus().len(), 2);
        assert!(state.geometry(0).unwrap().is_empty());
    }

    #[test]
    fn illegal_device_set_fails_the_build() {
        let devices: Vec<MigDevice> = (0..8)
            .map(|id| device(0, "1g.5gb", id, DeviceStatus::Free))
            .collect();
        assert!(build_node_state(&inventory(), &devices).is_err());
    }

    #[test]
    fn devices_for_unknown_gpus_are_dropped() {
        let devices = vec![device(9, "1g.5gb", 1, DeviceStatus::Free)];
        let state = build_node_state(&inventory(), &devices).unwrap();
        assert_eq!(state.gpus().len(), 2);
        assert!(state.geometry(0).unwrap().is_empty());
    }
}
