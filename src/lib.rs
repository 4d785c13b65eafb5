//! kube-workqueue runs a level-based reconciliation controller over a change feed from the apiserver.
//!
//! A feed delivers an initial listing followed by a stream of changes.
//! Each change is applied to a local mirror of the collection
//! and turned into an event on a deduplicating, rate-limited work queue.
//! Workers pull keys off the queue and reconcile the *current* state of the object in the mirror,
//! so any number of changes to the same object between two reconciles collapse into one.
//!
//! ```no_run
//! # async fn example(client: kube_client::Client) -> Result<(), kube_workqueue::RunError> {
//! use std::sync::Arc;
//! use kube_workqueue::{logger::LogSink, pods};
//!
//! let controller = kube_workqueue::on(pods::watch_pods(client))
//!     .with(pods::PodTracker::new(Arc::new(LogSink)))
//!     .workers(2)
//!     .build();
//! kube_workqueue::run(controller, tokio_util::sync::CancellationToken::new()).await
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub use config::{on, Config};
pub mod feed;
pub use feed::{ChangeFeed, QualifiedName};
mod informer;
pub use informer::{Informer, InformerError};
pub mod logger;
pub mod pods;
pub mod queue;
pub use queue::WorkQueue;
mod runner;
pub use runner::{run, Controller, RunError};
pub mod translator;
pub use translator::{Event, EventKind};
mod worker;
pub use worker::Reconciler;
