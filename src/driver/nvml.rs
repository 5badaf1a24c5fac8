//! Production `MigClient` backed by NVML and `nvidia-smi`.
//!
//! NVML answers inventory queries; partition listing, creation, and deletion
//! go through `nvidia-smi mig` subprocesses. NVML is initialized per call and
//! every subprocess runs under the caller's reconcile lock, so the driver
//! never sees concurrent geometry mutation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use nvml_wrapper::Nvml;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::driver::smi;
use crate::driver::{DriverError, GpuInfo, MigClient, MigDevice};
use crate::mig::profile::{DeviceStatus, ProfileName};

pub struct NvmlMigClient;

impl NvmlMigClient {
    pub fn new() -> Self {
        Self
    }

    fn init_nvml(&self) -> Result<Nvml, Report<DriverError>> {
        match Nvml::init() {
            Ok(nvml) => Ok(nvml),
            Err(_) => {
                warn!("standard NVML init failed, trying with explicit library path");
                Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .change_context(DriverError::Nvml {
                        message: "unable to initialize NVML".to_string(),
                    })
            }
        }
    }

    /// GPU index → UUID, needed to join `nvidia-smi` process rows (keyed by
    /// UUID) onto GPU-instance rows (keyed by index).
    fn gpu_uuids(&self, nvml: &Nvml) -> Result<HashMap<u32, String>, Report<DriverError>> {
        let device_count = nvml.device_count().change_context(DriverError::Nvml {
            message: "unable to count GPU devices".to_string(),
        })?;
        let mut uuids = HashMap::new();
        for index in 0..device_count {
            let device = nvml
                .device_by_index(index)
                .change_context(DriverError::Nvml {
                    message: format!("unable to get GPU device {index}"),
                })?;
            let uuid = device.uuid().change_context(DriverError::Nvml {
                message: format!("unable to get UUID of GPU {index}"),
            })?;
            uuids.insert(index, uuid);
        }
        Ok(uuids)
    }

    async fn run_nvidia_smi(&self, args: &[&str]) -> Result<String, Report<DriverError>> {
        let command = format!("nvidia-smi {}", args.join(" "));
        debug!(command, "running driver command");

        let output = Command::new("nvidia-smi")
            .args(args)
            .output()
            .await
            .change_context(DriverError::CommandFailed {
                command: command.clone(),
            })?;

        if !output.status.success() {
            return Err(Report::new(DriverError::CommandFailed { command })
                .attach_printable(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for NvmlMigClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MigClient for NvmlMigClient {
    async fn gpu_inventory(&self) -> Result<Vec<GpuInfo>, Report<DriverError>> {
        let nvml = self.init_nvml()?;
        let device_count = nvml.device_count().change_context(DriverError::Nvml {
            message: "unable to count GPU devices".to_string(),
        })?;

        let mut inventory = Vec::with_capacity(device_count as usize);
        for index in 0..device_count {
            let device = nvml
                .device_by_index(index)
                .change_context(DriverError::Nvml {
                    message: format!("unable to get GPU device {index}"),
                })?;
            let name = device.name().change_context(DriverError::Nvml {
                message: format!("unable to get name of GPU {index}"),
            })?;
            let memory = device.memory_info().change_context(DriverError::Nvml {
                message: format!("unable to get memory info of GPU {index}"),
            })?;
            inventory.push(GpuInfo {
                index,
                name,
                memory_mib: memory.total / (1024 * 1024),
            });
        }
        Ok(inventory)
    }

    async fn list_mig_devices(&self) -> Result<Vec<MigDevice>, Report<DriverError>> {
        let instance_output = self.run_nvidia_smi(&["mig", "-lgi"]).await?;
        let rows = smi::parse_gpu_instances(&instance_output);
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let apps_output = self
            .run_nvidia_smi(&[
                "--query-compute-apps=gpu_uuid,gpu_instance_id,pid",
                "--format=csv,noheader",
            ])
            .await?;
        let busy_pairs = smi::parse_compute_apps(&apps_output)?;

        let nvml = self.init_nvml()?;
        let uuids = self.gpu_uuids(&nvml)?;
        let busy: HashSet<(String, u32)> = busy_pairs.into_iter().collect();

        let devices = rows
            .into_iter()
            .map(|row| {
                let used = uuids
                    .get(&row.gpu_index)
                    .map(|uuid| busy.contains(&(uuid.clone(), row.instance_id)))
                    .unwrap_or(false);
                MigDevice {
                    gpu_index: row.gpu_index,
                    profile: row.profile,
                    gpu_instance_id: row.instance_id,
                    status: if used {
                        DeviceStatus::Used
                    } else {
                        DeviceStatus::Free
                    },
                }
            })
            .collect();
        Ok(devices)
    }

    async fn create_mig_device(
        &self,
        gpu_index: u32,
        profile: &ProfileName,
    ) -> Result<(), Report<DriverError>> {
        let gpu = gpu_index.to_string();
        self.run_nvidia_smi(&["mig", "-i", &gpu, "-cgi", profile.as_str(), "-C"])
            .await?;
        info!(gpu_index, profile = %profile, "created MIG device");
        Ok(())
    }

    async fn delete_mig_device(&self, device: &MigDevice) -> Result<(), Report<DriverError>> {
        let gpu = device.gpu_index.to_string();
        let instance = device.gpu_instance_id.to_string();
        // compute instances must go before their GPU instance
        self.run_nvidia_smi(&["mig", "-dci", "-i", &gpu, "-gi", &instance])
            .await?;
        self.run_nvidia_smi(&["mig", "-dgi", "-i", &gpu, "-gi", &instance])
            .await?;
        info!(
            gpu_index = device.gpu_index,
            profile = %device.profile,
            gpu_instance_id = device.gpu_instance_id,
            "deleted MIG device"
        );
        Ok(())
    }
}
