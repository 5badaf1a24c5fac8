//! Static catalog of supported GPU models and their legal MIG layouts.
//!
//! Each model entry carries the slice capacities, the profiles the model
//! supports, and the maximal hardware configurations. A geometry is legal iff
//! it is a sub-multiset of one of the maximal configurations; every prefix of
//! a valid configuration is itself reachable on hardware.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::mig::profile::ProfileName;
use crate::mig::Geometry;

/// A GPU model as reported by the driver, e.g. `NVIDIA A100-SXM4-40GB`.
///
/// Models unknown to the catalog are representable; they simply support no
/// profiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GpuModel(String);

impl GpuModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GpuModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub const MODEL_A100_SXM4_40GB: &str = "NVIDIA A100-SXM4-40GB";
pub const MODEL_A100_PCIE_80GB: &str = "NVIDIA A100-PCIE-80GB";
pub const MODEL_A30: &str = "NVIDIA A30";

struct ProfileSpec {
    name: &'static str,
    compute_slices: u8,
    memory_slices: u8,
}

struct ModelSpec {
    name: &'static str,
    /// Tokens that must all appear in the driver-reported device name.
    match_tokens: &'static [&'static str],
    compute_slice_capacity: u8,
    memory_slice_capacity: u8,
    profiles: &'static [ProfileSpec],
    /// Maximal configurations; legality is sub-multiset membership.
    maximal_geometries: &'static [&'static [(&'static str, usize)]],
}

static MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: MODEL_A100_SXM4_40GB,
        match_tokens: &["A100", "SXM4", "40GB"],
        compute_slice_capacity: 7,
        memory_slice_capacity: 8,
        profiles: &[
            ProfileSpec {
                name: "1g.5gb",
                compute_slices: 1,
                memory_slices: 1,
            },
            ProfileSpec {
                name: "2g.10gb",
                compute_slices: 2,
                memory_slices: 2,
            },
            ProfileSpec {
                name: "3g.20gb",
                compute_slices: 3,
                memory_slices: 4,
            },
            ProfileSpec {
                name: "4g.20gb",
                compute_slices: 4,
                memory_slices: 4,
            },
            ProfileSpec {
                name: "7g.40gb",
                compute_slices: 7,
                memory_slices: 8,
            },
        ],
        maximal_geometries: &[
            &[("7g.40gb", 1)],
            &[("4g.20gb", 1), ("3g.20gb", 1)],
            &[("4g.20gb", 1), ("2g.10gb", 1), ("1g.5gb", 1)],
            &[("4g.20gb", 1), ("1g.5gb", 3)],
            &[("3g.20gb", 2)],
            &[("3g.20gb", 1), ("2g.10gb", 2)],
            &[("3g.20gb", 1), ("2g.10gb", 1), ("1g.5gb", 2)],
            &[("3g.20gb", 1), ("1g.5gb", 4)],
            &[("2g.10gb", 3), ("1g.5gb", 1)],
            &[("2g.10gb", 2), ("1g.5gb", 3)],
            &[("2g.10gb", 1), ("1g.5gb", 5)],
            &[("1g.5gb", 7)],
        ],
    },
    ModelSpec {
        name: MODEL_A100_PCIE_80GB,
        match_tokens: &["A100", "PCIE", "80GB"],
        compute_slice_capacity: 7,
        memory_slice_capacity: 8,
        profiles: &[
            ProfileSpec {
                name: "1g.10gb",
                compute_slices: 1,
                memory_slices: 1,
            },
            ProfileSpec {
                name: "2g.20gb",
                compute_slices: 2,
                memory_slices: 2,
            },
            ProfileSpec {
                name: "3g.40gb",
                compute_slices: 3,
                memory_slices: 4,
            },
            ProfileSpec {
                name: "4g.40gb",
                compute_slices: 4,
                memory_slices: 4,
            },
            ProfileSpec {
                name: "7g.80gb",
                compute_slices: 7,
                memory_slices: 8,
            },
        ],
        maximal_geometries: &[
            &[("7g.80gb", 1)],
            &[("4g.40gb", 1), ("3g.40gb", 1)],
            &[("4g.40gb", 1), ("2g.20gb", 1), ("1g.10gb", 1)],
            &[("4g.40gb", 1), ("1g.10gb", 3)],
            &[("3g.40gb", 2)],
            &[("3g.40gb", 1), ("2g.20gb", 2)],
            &[("3g.40gb", 1), ("2g.20gb", 1), ("1g.10gb", 2)],
            &[("3g.40gb", 1), ("1g.10gb", 4)],
            &[("2g.20gb", 3), ("1g.10gb", 1)],
            &[("2g.20gb", 2), ("1g.10gb", 3)],
            &[("2g.20gb", 1), ("1g.10gb", 5)],
            &[("1g.10gb", 7)],
        ],
    },
    ModelSpec {
        name: MODEL_A30,
        match_tokens: &["A30"],
        compute_slice_capacity: 4,
        memory_slice_capacity: 4,
        profiles: &[
            ProfileSpec {
                name: "1g.6gb",
                compute_slices: 1,
                memory_slices: 1,
            },
            ProfileSpec {
                name: "2g.12gb",
                compute_slices: 2,
                memory_slices: 2,
            },
            ProfileSpec {
                name: "4g.24gb",
                compute_slices: 4,
                memory_slices: 4,
            },
        ],
        maximal_geometries: &[
            &[("4g.24gb", 1)],
            &[("2g.12gb", 2)],
            &[("2g.12gb", 1), ("1g.6gb", 2)],
            &[("1g.6gb", 4)],
        ],
    },
];

static MODEL_INDEX: Lazy<HashMap<&'static str, &'static ModelSpec>> =
    Lazy::new(|| MODELS.iter().map(|m| (m.name, m)).collect());

fn spec_for(model: &GpuModel) -> Option<&'static ModelSpec> {
    MODEL_INDEX.get(model.as_str()).copied()
}

/// Map a driver-reported device name to a catalog model.
///
/// Returns `None` for devices the catalog does not know; callers treat those
/// GPUs as supporting no profiles.
pub fn model_for_device_name(device_name: &str) -> Option<GpuModel> {
    let upper = device_name.to_uppercase();
    MODELS
        .iter()
        .find(|m| m.match_tokens.iter().all(|t| upper.contains(t)))
        .map(|m| GpuModel::new(m.name))
}

/// Legal profiles for a model; empty for unknown models.
pub fn profiles_for(model: &GpuModel) -> Vec<ProfileName> {
    spec_for(model)
        .map(|spec| {
            spec.profiles
                .iter()
                .filter_map(|p| p.name.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// (compute slices, memory slices) cost of a profile on a model.
pub fn slice_cost(model: &GpuModel, profile: &ProfileName) -> Option<(u8, u8)> {
    spec_for(model)?
        .profiles
        .iter()
        .find(|p| p.name == profile.as_str())
        .map(|p| (p.compute_slices, p.memory_slices))
}

/// Slice capacity of a model as (compute slices, memory slices).
pub fn slice_capacity(model: &GpuModel) -> Option<(u8, u8)> {
    spec_for(model).map(|s| (s.compute_slice_capacity, s.memory_slice_capacity))
}

/// Whether `geometry` is a configuration the model's hardware accepts.
///
/// Never errors: any violation (unknown model with a nonempty geometry,
/// profile not legal for the model, slice budget exceeded, combination not
/// covered by the configuration table) yields `false`.
pub fn geometry_is_legal(model: &GpuModel, geometry: &Geometry) -> bool {
    if geometry.values().all(|&n| n == 0) {
        return true;
    }
    let spec = match spec_for(model) {
        Some(spec) => spec,
        None => return false,
    };

    let mut compute_total: u32 = 0;
    let mut memory_total: u32 = 0;
    for (profile, &count) in geometry {
        let found = spec.profiles.iter().find(|p| p.name == profile.as_str());
        let profile_spec = match found {
            Some(p) => p,
            None => return false,
        };
        compute_total += u32::from(profile_spec.compute_slices) * count as u32;
        memory_total += u32::from(profile_spec.memory_slices) * count as u32;
    }
    if compute_total > u32::from(spec.compute_slice_capacity)
        || memory_total > u32::from(spec.memory_slice_capacity)
    {
        return false;
    }

    spec.maximal_geometries
        .iter()
        .any(|max| is_sub_multiset(geometry, max))
}

fn is_sub_multiset(geometry: &Geometry, maximal: &[(&str, usize)]) -> bool {
    geometry.iter().all(|(profile, &count)| {
        count == 0
            || maximal
                .iter()
                .any(|(name, max)| *name == profile.as_str() && count <= *max)
    })
}
