use thiserror::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("failed to fetch node {node}")]
    NodeFetchFailed { node: String },
    #[error("failed to watch node {node}: {message}")]
    WatchFailed { node: String, message: String },
    #[error("device plugin restart precondition failed: expected exactly 1 pod, found {found}")]
    RefreshPreconditionFailed { found: usize },
    #[error("timed out waiting for the device plugin pod to restart on node {node}")]
    RefreshTimeout { node: String },
    #[error("status annotation write conflicted with a concurrent node update")]
    StoreConflict,
    #[error("failed to write status annotations for node {node}")]
    WriteFailed { node: String },
    #[error("operation cancelled")]
    Cancelled,
}
