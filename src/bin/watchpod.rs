//! Logs every pod transition in the cluster.
//!
//! Usage: `watchpod [KUBECONFIG]`. Without a path, the in-cluster service account is used.

use std::{error::Error, fmt::Write, path::PathBuf, process::ExitCode, sync::Arc};

use kube_workqueue::{
    client,
    logger::{LogSink, Logger},
    pods,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let logger: Arc<dyn Logger> = Arc::new(LogSink);

    let kubeconfig = std::env::args_os().nth(1).map(PathBuf::from);
    let client = match client::connect(kubeconfig.as_deref(), &*logger).await {
        Ok(client) => client,
        Err(err) => {
            log::error!("{}", report(&err));
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for shutdown signal: {err}");
                return;
            }
            shutdown.cancel();
        }
    });

    let controller = kube_workqueue::on(pods::watch_pods(client))
        .with(pods::PodTracker::new(Arc::clone(&logger)))
        .logger(logger)
        .build();
    match kube_workqueue::run(controller, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Renders an error followed by its chain of causes.
fn report(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {cause}");
        source = cause.source();
    }
    message
}
