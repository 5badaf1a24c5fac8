//! Domain model for MIG partitioning: profiles, the per-model catalog, and
//! per-GPU / per-node state.

pub mod catalog;
pub mod gpu;
pub mod node;
pub mod profile;

use std::collections::BTreeMap;

pub use catalog::GpuModel;
pub use gpu::{Gpu, GpuError};
pub use node::NodeState;
pub use profile::{DeviceStatus, ProfileName};

/// Multiset of profiles instantiated on a GPU at one moment.
///
/// Backed by a `BTreeMap` so iteration order (and therefore everything the
/// planner derives from it) is deterministic.
pub type Geometry = BTreeMap<ProfileName, usize>;

/// Add `count` instances of `profile` to a geometry.
pub fn geometry_add(geometry: &mut Geometry, profile: &ProfileName, count: usize) {
    if count > 0 {
        *geometry.entry(profile.clone()).or_insert(0) += count;
    }
}

/// Remove up to `count` instances of `profile`, dropping empty entries.
pub fn geometry_remove(geometry: &mut Geometry, profile: &ProfileName, count: usize) {
    if let Some(existing) = geometry.get_mut(profile) {
        *existing = existing.saturating_sub(count);
        if *existing == 0 {
            geometry.remove(profile);
        }
    }
}

/// Union of two geometries.
pub fn geometry_union(a: &Geometry, b: &Geometry) -> Geometry {
    let mut union = a.clone();
    for (profile, count) in b {
        geometry_add(&mut union, profile, *count);
    }
    union
}
