//! Plan values produced by the planner and consumed by the actuator.

pub mod planner;

pub use planner::new_plan;

use std::fmt;

use thiserror::Error;

use crate::mig::profile::ProfileName;

/// Delete `quantity` free devices of `profile` on one GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOperation {
    pub gpu_index: u32,
    pub profile: ProfileName,
    pub quantity: usize,
}

/// Create `quantity` devices of `profile` on one GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOperation {
    pub gpu_index: u32,
    pub profile: ProfileName,
    pub quantity: usize,
}

/// Conditions that kept the planner from fully reaching the spec; surfaced to
/// the operator alongside the (still useful) partial plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// The spec asks for fewer devices of a profile than are currently in
    /// use; the surplus used devices are left alone.
    WouldEvictUsed {
        gpu_index: u32,
        profile: ProfileName,
        surplus: usize,
    },
    /// Requested creates exceed what the GPU can legally hold after deletes;
    /// the excess was dropped from the plan.
    CreatesDropped {
        gpu_index: u32,
        profile: ProfileName,
        dropped: usize,
    },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldEvictUsed {
                gpu_index,
                profile,
                surplus,
            } => write!(
                f,
                "cannot delete {surplus} used {profile} device(s) on GPU {gpu_index}"
            ),
            Self::CreatesDropped {
                gpu_index,
                profile,
                dropped,
            } => write!(
                f,
                "dropped {dropped} {profile} create(s) on GPU {gpu_index}: geometry not allowed"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("spec references GPU index {index}, which this node does not have")]
    IllegalGeometry { index: u32 },
}

/// Ordered delete and create operations for the whole node, plus warnings.
///
/// A value: produced by the planner, consumed by the actuator, never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub delete_operations: Vec<DeleteOperation>,
    pub create_operations: Vec<CreateOperation>,
    pub warnings: Vec<PlanWarning>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.delete_operations.is_empty() && self.create_operations.is_empty()
    }
}
