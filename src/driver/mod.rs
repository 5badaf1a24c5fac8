//! Hardware seam: the `MigClient` trait plus the NVML / `nvidia-smi` backed
//! production implementation and an in-memory mock for tests.

pub mod mock;
pub mod nvml;
pub(crate) mod smi;

pub use mock::MockMigClient;
pub use nvml::NvmlMigClient;

use async_trait::async_trait;
use error_stack::Report;
use thiserror::Error;

use crate::mig::profile::{DeviceStatus, ProfileName};

/// One physical GPU as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_mib: u64,
}

/// One MIG device as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigDevice {
    pub gpu_index: u32,
    pub profile: ProfileName,
    pub gpu_instance_id: u32,
    pub status: DeviceStatus,
}

/// Errors from the GPU driver layer.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("NVML call failed: {message}")]
    Nvml { message: String },
    #[error("driver command failed: {command}")]
    CommandFailed { command: String },
    #[error("failed to parse driver output: {message}")]
    ParseFailed { message: String },
}

/// Driver operations the agent needs: inventory, partition listing, and
/// partition create/delete. Implementations are expected to be safe to call
/// only under the reconcile lock; the driver is not safe against concurrent
/// geometry mutation.
#[async_trait]
pub trait MigClient: Send + Sync {
    /// The node's physical GPUs.
    async fn gpu_inventory(&self) -> Result<Vec<GpuInfo>, Report<DriverError>>;

    /// Every MIG device currently instantiated on the node.
    async fn list_mig_devices(&self) -> Result<Vec<MigDevice>, Report<DriverError>>;

    /// Create one device of `profile` on the GPU at `gpu_index`.
    async fn create_mig_device(
        &self,
        gpu_index: u32,
        profile: &ProfileName,
    ) -> Result<(), Report<DriverError>>;

    /// Delete one specific device.
    async fn delete_mig_device(&self, device: &MigDevice) -> Result<(), Report<DriverError>>;
}
