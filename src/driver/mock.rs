//! In-memory `MigClient` for tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;

use crate::driver::{DriverError, GpuInfo, MigClient, MigDevice};
use crate::mig::profile::{DeviceStatus, ProfileName};

/// Mock driver holding a mutable device list.
///
/// Creates append a free device with the next GPU-instance id; deletes remove
/// the matching device. Individual create/delete calls can be scripted to
/// fail by 1-based call number, and every call is recorded in an operation
/// log for assertions.
pub struct MockMigClient {
    inventory: Vec<GpuInfo>,
    devices: Mutex<Vec<MigDevice>>,
    next_instance_id: Mutex<u32>,
    create_calls: Mutex<usize>,
    delete_calls: Mutex<usize>,
    failing_create_calls: Mutex<HashSet<usize>>,
    failing_delete_calls: Mutex<HashSet<usize>>,
    operations: Mutex<Vec<String>>,
}

impl MockMigClient {
    pub fn new(inventory: Vec<GpuInfo>) -> Self {
        Self {
            inventory,
            devices: Mutex::new(Vec::new()),
            next_instance_id: Mutex::new(1),
            create_calls: Mutex::new(0),
            delete_calls: Mutex::new(0),
            failing_create_calls: Mutex::new(HashSet::new()),
            failing_delete_calls: Mutex::new(HashSet::new()),
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_devices(self, devices: Vec<MigDevice>) -> Self {
        let max_id = devices.iter().map(|d| d.gpu_instance_id).max().unwrap_or(0);
        *self.devices.lock().unwrap() = devices;
        *self.next_instance_id.lock().unwrap() = max_id + 1;
        self
    }

    /// Make the n-th create call fail (1-based, counted across the mock's
    /// lifetime).
    pub fn fail_create_call(&self, call: usize) {
        self.failing_create_calls.lock().unwrap().insert(call);
    }

    pub fn fail_delete_call(&self, call: usize) {
        self.failing_delete_calls.lock().unwrap().insert(call);
    }

    /// Mark every device of `profile` on `gpu_index` as used.
    pub fn mark_used(&self, gpu_index: u32, profile: &ProfileName) {
        for device in self.devices.lock().unwrap().iter_mut() {
            if device.gpu_index == gpu_index && &device.profile == profile {
                device.status = DeviceStatus::Used;
            }
        }
    }

    pub fn devices(&self) -> Vec<MigDevice> {
        self.devices.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    fn log_operation(&self, operation: String) {
        self.operations.lock().unwrap().push(operation);
    }
}

#[async_trait]
impl MigClient for MockMigClient {
    async fn gpu_inventory(&self) -> Result<Vec<GpuInfo>, Report<DriverError>> {
        Ok(self.inventory.clone())
    }

    async fn list_mig_devices(&self) -> Result<Vec<MigDevice>, Report<DriverError>> {
        Ok(self.devices())
    }

    async fn create_mig_device(
        &self,
        gpu_index: u32,
        profile: &ProfileName,
    ) -> Result<(), Report<DriverError>> {
        let call = {
            let mut calls = self.create_calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        self.log_operation(format!("create({gpu_index}, {profile})"));

        if self.failing_create_calls.lock().unwrap().contains(&call) {
            return Err(Report::new(DriverError::CommandFailed {
                command: format!("mock create {profile} on GPU {gpu_index}"),
            }));
        }

        let instance_id = {
            let mut next = self.next_instance_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        self.devices.lock().unwrap().push(MigDevice {
            gpu_index,
            profile: profile.clone(),
            gpu_instance_id: instance_id,
            status: DeviceStatus::Free,
        });
        Ok(())
    }

    async fn delete_mig_device(&self, device: &MigDevice) -> Result<(), Report<DriverError>> {
        let call = {
            let mut calls = self.delete_calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        self.log_operation(format!(
            "delete({}, {}, {})",
            device.gpu_index, device.profile, device.gpu_instance_id
        ));

        if self.failing_delete_calls.lock().unwrap().contains(&call) {
            return Err(Report::new(DriverError::CommandFailed {
                command: format!(
                    "mock delete instance {} on GPU {}",
                    device.gpu_instance_id, device.gpu_index
                ),
            }));
        }

        let mut devices = self.devices.lock().unwrap();
        let position = devices.iter().position(|d| {
            d.gpu_index == device.gpu_index && d.gpu_instance_id == device.gpu_instance_id
        });
        match position {
            Some(position) => {
                devices.remove(position);
                Ok(())
            }
            None => Err(Report::new(DriverError::CommandFailed {
                command: format!(
                    "mock delete: no instance {} on GPU {}",
                    device.gpu_instance_id, device.gpu_index
                ),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Vec<GpuInfo> {
        vec![GpuInfo {
            index: 0,
            name: "NVIDIA A100-SXM4-40GB".to_string(),
            memory_mib: 40960,
        }]
    }

    #[tokio::test]
    async fn create_appends_a_free_device() {
        let mock = MockMigClient::new(inventory());
        let profile: ProfileName = "1g.5gb".parse().unwrap();
        mock.create_mig_device(0, &profile).await.unwrap();

        let devices = mock.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].status, DeviceStatus::Free);
        assert_eq!(devices[0].profile, profile);
    }

    #[tokio::test]
    async fn scripted_create_failure() {
        let mock = MockMigClient::new(inventory());
        mock.fail_create_call(2);
        let profile: ProfileName = "1g.5gb".parse().unwrap();

        assert!(mock.create_mig_device(0, &profile).await.is_ok());
        assert!(mock.create_mig_device(0, &profile).await.is_err());
        assert!(mock.create_mig_device(0, &profile).await.is_ok());
        assert_eq!(mock.devices().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_the_matching_instance() {
        let profile: ProfileName = "1g.5gb".parse().unwrap();
        let device = MigDevice {
            gpu_index: 0,
            profile: profile.clone(),
            gpu_instance_id: 7,
            status: DeviceStatus::Free,
        };
        let mock = MockMigClient::new(inventory()).with_devices(vec![device.clone()]);

        mock.delete_mig_device(&device).await.unwrap();
        assert!(mock.devices().is_empty());
        assert!(mock.delete_mig_device(&device).await.is_err());
    }
}
