use std::{sync::Arc, time::Duration};

use crate::{
    cache,
    feed::ChangeFeed,
    informer::Informer,
    logger::{self, Logger},
    queue::{ItemExponentialFailure, WorkQueue},
    runner::Controller,
    translator::Translator,
    worker::Reconciler,
};

/// Tuning parameters for [`run`](crate::run).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of concurrent workers. Zero is treated as one.
    pub workers: usize,
    /// How many times a failing event is retried before it is dropped.
    pub max_retries: u32,
    /// Backoff before the first retry of an event.
    pub base_delay: Duration,
    /// Upper bound of the per-event backoff.
    pub max_delay: Duration,
    /// How long to wait for the initial listing before giving up.
    pub sync_timeout: Duration,
    /// Period of full relists while watching, if any.
    pub resync_period: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            sync_timeout: Duration::from_secs(60),
            resync_period: None,
        }
    }
}

pub struct Builder<F, R> {
    feed: F,
    reconciler: R,
    config: Config,
    logger: Arc<dyn Logger>,
}

/// Starts building a controller that observes `feed`.
pub fn on<F: ChangeFeed>(feed: F) -> Builder<F, ()> {
    Builder {
        feed,
        reconciler: (),
        config: Config::default(),
        logger: logger::default_logger(),
    }
}

impl<F: ChangeFeed> Builder<F, ()> {
    /// Sets the business logic run for every changed object.
    pub fn with<R: Reconciler<F::Object>>(self, reconciler: R) -> Builder<F, R> {
        Builder {
            feed: self.feed,
            reconciler,
            config: self.config,
            logger: self.logger,
        }
    }
}

impl<F, R> Builder<F, R> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.config.base_delay = base_delay;
        self.config.max_delay = max_delay;
        self
    }

    pub fn sync_timeout(mut self, sync_timeout: Duration) -> Self {
        self.config.sync_timeout = sync_timeout;
        self
    }

    pub fn resync_every(mut self, period: Duration) -> Self {
        self.config.resync_period = Some(period);
        self
    }

    /// Replaces the default sink, which forwards to the `log` crate.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }
}

impl<F, R> Builder<F, R>
where
    F: ChangeFeed,
    R: Reconciler<F::Object>,
{
    /// Wires the mirror, translator and queue together.
    /// Nothing runs until the controller is passed to [`run`](crate::run).
    pub fn build(self) -> Controller<F, R> {
        let queue = WorkQueue::with_rate_limiter(ItemExponentialFailure::new(
            self.config.base_delay,
            self.config.max_delay,
        ));
        let (writer, store) = cache::new();
        let translator = Translator::new(queue.clone(), Arc::clone(&self.logger));
        let informer = Informer::new(
            self.feed,
            writer,
            translator,
            self.config.resync_period,
            Arc::clone(&self.logger),
        );

        Controller {
            informer,
            store,
            queue,
            reconciler: Arc::new(self.reconciler),
            config: self.config,
            logger: self.logger,
        }
    }
}
