//! The feed delivery loop: keeps the mirror in sync and feeds the translator.

use std::{future, sync::Arc, time::Duration};

use futures::StreamExt;
use kube_runtime::watcher;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::Writer,
    feed::ChangeFeed,
    logger::Logger,
    translator::Translator,
};

/// Drives a [`ChangeFeed`] into the mirror.
///
/// Every event is applied to the mirror before the resulting notifications are translated,
/// so a worker picking up an event always finds the mirror at least as fresh as the event.
pub struct Informer<F: ChangeFeed> {
    feed: F,
    writer: Writer<F::Object>,
    translator: Translator,
    resync_period: Option<Duration>,
    logger: Arc<dyn Logger>,
}

/// Why the delivery loop stopped without being cancelled.
#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    #[error("change feed stream ended")]
    Closed,
}

enum Step<T> {
    Cancelled,
    Resync,
    Delivered(Option<T>),
}

impl<F: ChangeFeed> Informer<F> {
    pub fn new(
        feed: F,
        writer: Writer<F::Object>,
        translator: Translator,
        resync_period: Option<Duration>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            feed,
            writer,
            translator,
            resync_period: resync_period.filter(|period| !period.is_zero()),
            logger,
        }
    }

    /// Runs until `cancel` fires or the feed ends.
    ///
    /// Stream errors are logged and the stream is polled again;
    /// the feed is responsible for backing off and recovering.
    /// With a resync period, the feed is resubscribed periodically,
    /// which relists the collection and re-enqueues every known object.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), InformerError> {
        let mut stream = self.feed.subscribe();
        let mut resync = self.resync_period.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let step = tokio::select! {
                () = cancel.cancelled() => Step::Cancelled,
                () = tick(resync.as_mut()) => Step::Resync,
                event = stream.next() => Step::Delivered(event),
            };

            match step {
                Step::Cancelled => return Ok(()),
                Step::Resync => {
                    self.logger.info(format_args!("Resynchronizing from a full listing"));
                    stream = self.feed.subscribe();
                }
                Step::Delivered(Some(Ok(event))) => self.deliver(event),
                Step::Delivered(Some(Err(err))) => {
                    self.logger.error(format_args!("Change feed error: {err}"));
                }
                Step::Delivered(None) => return Err(InformerError::Closed),
            }
        }
    }

    fn deliver(&mut self, event: watcher::Event<F::Object>) {
        let translator = &self.translator;
        self.writer.apply(event, |notification| translator.handle(notification));
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
