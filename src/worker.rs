//! Workers pull events off the queue and reconcile the current state of each object.

use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use kube_core::Resource;

use crate::{cache::Store, logger::Logger, queue::WorkQueue, translator::Event};

/// Business logic applied to each changed object.
///
/// Reconciliation is level-based: `object` is the latest state in the mirror,
/// or `None` if the object no longer exists,
/// regardless of how many changes were collapsed into `event`.
/// Reconciling the same unchanged state twice must have no further effect.
pub trait Reconciler<K>: Send + Sync + 'static {
    /// A transient failure. The event is retried with backoff.
    type Error: fmt::Display + Send + 'static;

    fn reconcile(
        &self,
        event: &Event,
        object: Option<Arc<K>>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// One reconcile loop. A controller runs several of these over the same queue.
pub(crate) struct Worker<K: Resource<DynamicType = ()> + 'static, R> {
    pub(crate) id: usize,
    pub(crate) queue: WorkQueue<Event>,
    pub(crate) store: Store<K>,
    pub(crate) reconciler: Arc<R>,
    pub(crate) max_retries: u32,
    pub(crate) logger: Arc<dyn Logger>,
}

impl<K, R> Worker<K, R>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    R: Reconciler<K>,
{
    /// Processes events until the queue shuts down.
    pub(crate) async fn run(self) {
        while self.process_next_item().await {}
        self.logger.info(format_args!("Worker {} stopped", self.id));
    }

    /// Processes a single event. Returns `false` only when the queue has shut down;
    /// a failing event never stops the loop.
    pub(crate) async fn process_next_item(&self) -> bool {
        let Some(event) = self.queue.get().await else {
            return false;
        };

        let outcome = AssertUnwindSafe(self.process_item(&event)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => self.queue.forget(&event),
            Ok(Err(err)) => self.handle_err(&event, format_args!("{err}")),
            Err(panic) => self.handle_err(
                &event,
                format_args!("reconciler panicked: {}", panic_message(&*panic)),
            ),
        }
        self.queue.done(&event);

        true
    }

    async fn process_item(&self, event: &Event) -> Result<(), R::Error> {
        let object = self.store.get(event.key());
        self.reconciler.reconcile(event, object).await
    }

    fn handle_err(&self, event: &Event, err: fmt::Arguments<'_>) {
        let retries = self.queue.num_requeues(event);
        if retries < self.max_retries {
            self.logger.error(format_args!(
                "Error processing [{}] (attempt {}), retrying: {err}",
                event.key(),
                retries + 1
            ));
            self.queue.add_rate_limited(event.clone());
        } else {
            self.logger.error(format_args!(
                "Dropping [{}] after {} retries: {err}",
                event.key(),
                retries
            ));
            self.queue.forget(event);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
