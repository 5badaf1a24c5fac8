pub mod annotations;
pub mod client;
pub mod device_plugin;
pub mod types;

pub use client::init_kube_client;
pub use types::KubernetesError;
