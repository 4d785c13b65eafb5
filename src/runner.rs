use std::{panic, sync::Arc, time::Duration};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::Store,
    config::Config,
    feed::ChangeFeed,
    informer::{Informer, InformerError},
    logger::Logger,
    queue::WorkQueue,
    translator::Event,
    worker::{Reconciler, Worker},
};

/// A wired controller, created by [`on`](crate::on).
pub struct Controller<F: ChangeFeed, R> {
    pub(crate) informer: Informer<F>,
    pub(crate) store: Store<F::Object>,
    pub(crate) queue: WorkQueue<Event>,
    pub(crate) reconciler: Arc<R>,
    pub(crate) config: Config,
    pub(crate) logger: Arc<dyn Logger>,
}

impl<F: ChangeFeed, R> Controller<F, R> {
    /// The mirror the workers read from.
    pub fn store(&self) -> &Store<F::Object> {
        &self.store
    }

    pub fn queue(&self) -> &WorkQueue<Event> {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Runs the controller until `shutdown` is cancelled.
///
/// Workers are only started once the initial listing has been applied to the mirror.
/// On shutdown the feed stops first, then the queue is shut down
/// and the workers drain what is left of it.
pub async fn run<F, R>(
    controller: Controller<F, R>,
    shutdown: CancellationToken,
) -> Result<(), RunError>
where
    F: ChangeFeed,
    R: Reconciler<F::Object>,
{
    let Controller {
        informer,
        store,
        queue,
        reconciler,
        config,
        logger,
    } = controller;

    logger.info(format_args!("Starting controller"));
    let mut informer = CancellableTask::spawn(shutdown.child_token(), |token| informer.run(token));

    logger.info(format_args!("Synchronizing events..."));
    let sync = tokio::time::timeout(config.sync_timeout, store.wait_until_synced());
    let synced = tokio::select! {
        () = shutdown.cancelled() => None,
        synced = sync => Some(synced),
    };
    match synced {
        Some(Ok(Ok(()))) => {}
        None => {
            logger.info(format_args!("Shutdown requested before synchronization completed"));
            queue.shut_down();
            resume_panic(informer.cancel().await);
            return Ok(());
        }
        Some(Ok(Err(_writer_dropped))) => {
            logger.error(format_args!("Synchronization failed: change feed stopped"));
            queue.shut_down();
            resume_panic(informer.cancel().await);
            return Err(RunError::FeedClosed);
        }
        Some(Err(_elapsed)) => {
            logger.error(format_args!("Timed out waiting for caches to sync"));
            queue.shut_down();
            resume_panic(informer.cancel().await);
            return Err(RunError::SyncTimeout(config.sync_timeout));
        }
    }
    logger.info(format_args!("Synchronization complete, ready to process events"));

    let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
        .map(|id| {
            tokio::spawn(
                Worker {
                    id,
                    queue: queue.clone(),
                    store: store.clone(),
                    reconciler: Arc::clone(&reconciler),
                    max_retries: config.max_retries,
                    logger: Arc::clone(&logger),
                }
                .run(),
            )
        })
        .collect();

    let joined = tokio::select! {
        () = shutdown.cancelled() => None,
        joined = &mut informer.join_handle => Some(joined),
    };
    let joined = match joined {
        None => informer.cancel().await,
        Some(joined) => joined,
    };
    match &joined {
        Ok(Err(err)) => logger.error(format_args!("Change feed stopped unexpectedly: {err}")),
        Err(err) if err.is_panic() => logger.error(format_args!("Change feed panicked")),
        Ok(Ok(())) | Err(_) => {}
    }

    // workers must be gone before a feed panic is re-raised
    logger.info(format_args!("Shutting down work queue"));
    queue.shut_down();
    for worker in workers {
        if let Err(err) = worker.await {
            logger.error(format_args!("Worker task failed: {err}"));
        }
    }
    logger.info(format_args!("Controller stopped"));

    match resume_panic(joined) {
        Some(Err(err)) => Err(err.into()),
        Some(Ok(())) | None => Ok(()),
    }
}

/// Errors that stop [`run`] from starting or keep it from running to completion.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("timed out after {0:?} waiting for the cache to sync")]
    SyncTimeout(Duration),
    #[error("change feed stopped")]
    FeedClosed,
}

impl From<InformerError> for RunError {
    fn from(err: InformerError) -> Self {
        match err {
            InformerError::Closed => Self::FeedClosed,
        }
    }
}

struct CancellableTask<T> {
    join_handle: JoinHandle<T>,
    token: CancellationToken,
}

impl<T: Send + 'static> CancellableTask<T> {
    fn spawn<Fut>(token: CancellationToken, f: impl FnOnce(CancellationToken) -> Fut) -> Self
    where
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let join_handle = tokio::spawn(f(token.clone()));
        Self { join_handle, token }
    }

    /// Cancels the task and waits for it to stop.
    async fn cancel(self) -> Result<T, JoinError> {
        self.token.cancel();
        self.join_handle.await
    }
}

/// Re-raises a panic from a joined task. Returns `None` if the task was aborted.
fn resume_panic<T>(joined: Result<T, JoinError>) -> Option<T> {
    match joined {
        Ok(output) => Some(output),
        Err(err) => match err.try_into_panic() {
            Ok(panic) => panic::resume_unwind(panic),
            Err(_cancelled) => None,
        },
    }
}
