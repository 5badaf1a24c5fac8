use thiserror::Error;

use crate::mig::catalog;
use crate::mig::catalog::GpuModel;
use crate::mig::profile::ProfileName;
use crate::mig::{geometry_union, Geometry};

/// Errors from per-GPU geometry operations.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("geometry is not allowed on GPU {index} (model {model})")]
    IllegalGeometry { index: u32, model: GpuModel },
    #[error("geometry would delete used MIG devices on GPU {index}")]
    WouldEvictUsed { index: u32 },
}

/// One physical GPU: its model and the free/used partition multisets.
///
/// Invariants, enforced at construction: the combined geometry is legal for
/// the model, and every partition's profile is legal for the model (both are
/// catalog checks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpu {
    index: u32,
    model: GpuModel,
    used: Geometry,
    free: Geometry,
}

impl Gpu {
    pub fn new(
        model: GpuModel,
        index: u32,
        used: Geometry,
        free: Geometry,
    ) -> Result<Self, GpuError> {
        let combined = geometry_union(&used, &free);
        if !catalog::geometry_is_legal(&model, &combined) {
            return Err(GpuError::IllegalGeometry { index, model });
        }
        Ok(Self {
            index,
            model,
            used,
            free,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn model(&self) -> &GpuModel {
        &self.model
    }

    pub fn used(&self) -> &Geometry {
        &self.used
    }

    pub fn free(&self) -> &Geometry {
        &self.free
    }

    /// The combined multiset of instantiated profiles, free and used.
    pub fn geometry(&self) -> Geometry {
        geometry_union(&self.used, &self.free)
    }

    /// Total instances of `profile`, free and used combined.
    pub fn count_of(&self, profile: &ProfileName) -> usize {
        self.used.get(profile).copied().unwrap_or(0) + self.free.get(profile).copied().unwrap_or(0)
    }

    /// Model capacity minus the cost of everything instantiated, as
    /// (compute slices, memory slices). Zero for unknown models.
    pub fn free_slices_remaining(&self) -> (u8, u8) {
        let (compute_capacity, memory_capacity) = match catalog::slice_capacity(&self.model) {
            Some(capacity) => capacity,
            None => return (0, 0),
        };
        let mut compute_used: u32 = 0;
        let mut memory_used: u32 = 0;
        for (profile, count) in self.geometry() {
            if let Some((compute, memory)) = catalog::slice_cost(&self.model, &profile) {
                compute_used += u32::from(compute) * count as u32;
                memory_used += u32::from(memory) * count as u32;
            }
        }
        (
            u32::from(compute_capacity).saturating_sub(compute_used) as u8,
            u32::from(memory_capacity).saturating_sub(memory_used) as u8,
        )
    }

    /// Whether `qty` more instances of `profile` would still form a legal
    /// geometry on this GPU.
    pub fn can_create(&self, profile: &ProfileName, qty: usize) -> bool {
        let mut hypothetical = self.geometry();
        crate::mig::geometry_add(&mut hypothetical, profile, qty);
        catalog::geometry_is_legal(&self.model, &hypothetical)
    }

    /// Replace the free partitions so the combined geometry equals `target`.
    ///
    /// Used partitions are never removed: if any used profile is not present
    /// in `target` with at least its current multiplicity this fails with
    /// [`GpuError::WouldEvictUsed`] and the GPU is left unchanged. An illegal
    /// target fails with [`GpuError::IllegalGeometry`]. The hardware is not
    /// touched; actuation is the actuator's job.
    pub fn apply_geometry(&mut self, target: &Geometry) -> Result<(), GpuError> {
        for (profile, used_count) in &self.used {
            if target.get(profile).copied().unwrap_or(0) < *used_count {
                return Err(GpuError::WouldEvictUsed { index: self.index });
            }
        }
        if !catalog::geometry_is_legal(&self.model, target) {
            return Err(GpuError::IllegalGeometry {
                index: self.index,
                model: self.model.clone(),
            });
        }

        let mut free = Geometry::new();
        for (profile, count) in target {
            let used = self.used.get(profile).copied().unwrap_or(0);
            if *count > used {
                free.insert(profile.clone(), count - used);
            }
        }
        self.free = free;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mig::catalog::{MODEL_A100_SXM4_40GB, MODEL_A30};

    fn geometry(pairs: &[(&str, usize)]) -> Geometry {
        pairs
            .iter()
            .map(|(name, count)| (name.parse().unwrap(), *count))
            .collect()
    }

    fn gpu(model: &str, used: &[(&str, usize)], free: &[(&str, usize)]) -> Gpu {
        Gpu::new(GpuModel::new(model), 0, geometry(used), geometry(free)).unwrap()
    }

    #[test]
    fn empty_gpu_has_empty_geometry() {
        let gpu = gpu(MODEL_A30, &[], &[]);
        assert_eq!(gpu.geometry(), Geometry::new());
    }

    #[test]
    fn new_rejects_illegal_initial_geometry() {
        let result = Gpu::new(
            GpuModel::new(MODEL_A30),
            0,
            geometry(&[("1g.6gb", 4)]),
            geometry(&[("2g.12gb", 1)]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn apply_geometry_on_empty_gpu_creates_free_devices() {
        let mut gpu = gpu(MODEL_A100_SXM4_40GB, &[], &[]);
        gpu.apply_geometry(&geometry(&[("7g.40gb", 1)])).unwrap();
        assert_eq!(gpu.free(), &geometry(&[("7g.40gb", 1)]));
        assert!(gpu.used().is_empty());
    }

    #[test]
    fn apply_geometry_rejects_illegal_target_and_leaves_gpu_unchanged() {
        let mut gpu = gpu(MODEL_A100_SXM4_40GB, &[], &[]);
        let result = gpu.apply_geometry(&geometry(&[("1g.5gb", 12)]));
        assert!(matches!(result, Err(GpuError::IllegalGeometry { .. })));
        assert_eq!(gpu.geometry(), Geometry::new());
    }

    #[test]
    fn apply_geometry_never_evicts_used_devices() {
        let mut gpu = gpu(MODEL_A30, &[("1g.6gb", 4)], &[]);
        let result = gpu.apply_geometry(&geometry(&[("4g.24gb", 1)]));
        assert!(matches!(result, Err(GpuError::WouldEvictUsed { .. })));
        assert_eq!(gpu.used(), &geometry(&[("1g.6gb", 4)]));
        assert!(gpu.free().is_empty());
    }

    #[test]
    fn apply_geometry_changes_only_free_devices() {
        let mut gpu = gpu(MODEL_A30, &[("1g.6gb", 2)], &[("2g.12gb", 1)]);
        gpu.apply_geometry(&geometry(&[("1g.6gb", 4)])).unwrap();
        assert_eq!(gpu.used(), &geometry(&[("1g.6gb", 2)]));
        assert_eq!(gpu.free(), &geometry(&[("1g.6gb", 2)]));
    }

    #[test]
    fn free_slices_remaining_subtracts_both_pools() {
        let gpu = gpu(MODEL_A100_SXM4_40GB, &[("3g.20gb", 1)], &[("2g.10gb", 1)]);
        assert_eq!(gpu.free_slices_remaining(), (2, 2));
    }

    #[test]
    fn can_create_respects_catalog() {
        let gpu = gpu(MODEL_A100_SXM4_40GB, &[("3g.20gb", 1)], &[]);
        assert!(gpu.can_create(&"3g.20gb".parse().unwrap(), 1));
        assert!(gpu.can_create(&"1g.5gb".parse().unwrap(), 4));
        assert!(!gpu.can_create(&"7g.40gb".parse().unwrap(), 1));
        assert!(!gpu.can_create(&"1g.5gb".parse().unwrap(), 5));
    }
}
