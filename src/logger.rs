//! Logging capability handed to each component.
//!
//! Components never call the `log` macros directly;
//! they log through an injected [`Logger`] so that tests can run silently
//! or record what was emitted.

use std::fmt;
use std::sync::Arc;

/// A structured log sink with the two levels the controller emits.
pub trait Logger: Send + Sync {
    fn info(&self, args: fmt::Arguments<'_>);

    fn error(&self, args: fmt::Arguments<'_>);
}

/// Forwards to the [`log`] facade under the `kube_workqueue` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl Logger for LogSink {
    fn info(&self, args: fmt::Arguments<'_>) {
        log::info!(target: "kube_workqueue", "{args}");
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        log::error!(target: "kube_workqueue", "{args}");
    }
}

/// Drops every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Logger for Discard {
    fn info(&self, _args: fmt::Arguments<'_>) {}

    fn error(&self, _args: fmt::Arguments<'_>) {}
}

pub(crate) fn default_logger() -> Arc<dyn Logger> {
    Arc::new(LogSink)
}
