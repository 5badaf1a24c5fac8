// Agent layer - actuator and reconcile loop
pub mod agent;

// Configuration layer - CLI and agent arguments
pub mod config;

// Hardware driver layer - NVML / nvidia-smi seam
pub mod driver;

// Kubernetes layer - client, annotations, device plugin refresh
pub mod k8s;

// Logging setup
pub mod logging;

// Domain layer - profiles, catalog, GPU and node state
pub mod mig;

// Planning layer - desired-vs-actual diff
pub mod plan;

pub use agent::{Actuator, MigReconciler};
pub use config::Cli;
pub use driver::{MigClient, NvmlMigClient};
