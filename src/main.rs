use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use mig_agent::agent::MigReconciler;
use mig_agent::config::Cli;
use mig_agent::driver::NvmlMigClient;
use mig_agent::k8s::device_plugin::RefreshConfig;
use mig_agent::k8s::init_kube_client;
use mig_agent::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let args = cli.agent;
    logging::init(args.log_path.clone());

    tracing::info!(node = %args.node_name, "starting MIG agent");

    let kube = init_kube_client(args.kubeconfig.as_deref(), &args.node_name)
        .await
        .map_err(|report| anyhow::anyhow!("failed to initialize Kubernetes client: {report:?}"))?;
    let mig = Arc::new(NvmlMigClient::new());
    let refresh = RefreshConfig {
        timeout: Duration::from_secs(args.refresh_timeout_secs),
        poll_interval: Duration::from_secs(args.refresh_poll_secs),
    };
    let reconciler = MigReconciler::new(kube, mig, args.node_name.clone(), refresh);

    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_token.cancel();
    });

    reconciler.run(token).await;
    tracing::info!("MIG agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
