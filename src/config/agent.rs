use std::path::PathBuf;

use clap::Args;

#[derive(Args, Clone, Debug)]
pub struct AgentArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent manages; reconciliation is scoped to this node only"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to in-cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds to wait for the device plugin pod to come back after a restart"
    )]
    pub refresh_timeout_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds between device plugin pod restart polls"
    )]
    pub refresh_poll_secs: u64,

    #[arg(
        long,
        env = "MIG_AGENT_LOG_PATH",
        value_hint = clap::ValueHint::AnyPath,
        help = "Log file or directory for daily-rolling logs; stdout if unset"
    )]
    pub log_path: Option<PathBuf>,
}
