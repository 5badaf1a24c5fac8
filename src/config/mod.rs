pub mod agent;

pub use agent::AgentArgs;

use clap::Parser;

/// Node-local MIG partitioning agent.
///
/// Watches the node object for desired-partitioning annotations and
/// reconciles the GPUs' MIG geometry against them.
#[derive(Parser)]
#[command(name = "mig-agent", about, long_about = None, version)]
pub struct Cli {
    #[command(flatten)]
    pub agent: AgentArgs,
}
