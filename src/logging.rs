//! Tracing setup for the agent.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_PREFIX: &str = "mig-agent.log";
const LOG_LEVEL_ENV_VAR: &str = "MIG_AGENT_LOG_LEVEL";

static LOG_WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initiate the global tracing subscriber.
///
/// Logs go to stdout unless `log_path` points at a file or directory, in
/// which case a daily-rolling appender is used and the non-blocking writer
/// guard is kept alive for the process lifetime.
pub fn init(log_path: Option<PathBuf>) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let fmt_layer = match log_path {
        Some(path) => {
            // path may name either a directory or a specific log file
            let is_dir = path.is_dir();
            let (base_dir, prefix) = if is_dir {
                (path.as_path(), DEFAULT_LOG_PREFIX.to_string())
            } else {
                let prefix = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string());
                (path.parent().unwrap_or(path.as_path()), prefix)
            };

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(7)
                .build(base_dir)
                .expect("failed to create rolling file appender");

            let (file_writer, guard) = tracing_appender::non_blocking(appender);

            // keep the non-blocking write thread alive in global scope
            LOG_WORKER_GUARD
                .set(guard)
                .expect("failed to set log worker guard");

            layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_ansi(false)
                .boxed()
        }
        None => layer().with_writer(std::io::stdout).with_target(true).boxed(),
    };

    registry().with(fmt_layer.with_filter(filter)).init();
}
