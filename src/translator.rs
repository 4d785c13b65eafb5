//! Turns mirror notifications into work queue events.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use kube_core::Resource;

use crate::{
    feed::{Deletion, KeyError, Notification, QualifiedName},
    logger::Logger,
    queue::WorkQueue,
};

/// The kind of change that caused an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "create",
            Self::Updated => "update",
            Self::Deleted => "delete",
        })
    }
}

/// A unit of work: the object `key` changed.
///
/// Identity is the key alone, so the queue collapses events for the same object
/// regardless of their kind. The kind is informational.
#[derive(Debug, Clone)]
pub struct Event {
    key: QualifiedName,
    kind: EventKind,
}

impl Event {
    pub fn new(key: QualifiedName, kind: EventKind) -> Self {
        Self { key, kind }
    }

    pub fn key(&self) -> &QualifiedName {
        &self.key
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// A notification that cannot be turned into an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot derive key for {kind} notification: {source}")]
pub struct TranslateError {
    pub kind: EventKind,
    #[source]
    pub source: KeyError,
}

/// Derives the [`Event`] for a notification.
///
/// Updates are keyed from the new state of the object;
/// deletions may carry a bare key instead of an object.
pub fn translate<K: Resource>(notification: &Notification<K>) -> Result<Event, TranslateError> {
    let (kind, key) = match notification {
        Notification::Added(obj) => (EventKind::Created, QualifiedName::from_resource(obj)),
        Notification::Updated { new, .. } => {
            (EventKind::Updated, QualifiedName::from_resource(new))
        }
        Notification::Deleted(Deletion::Object(obj)) => {
            (EventKind::Deleted, QualifiedName::from_resource(obj))
        }
        Notification::Deleted(Deletion::Tombstone(key)) => (EventKind::Deleted, key.parse()),
    };
    key.map(|key| Event::new(key, kind))
        .map_err(|source| TranslateError { kind, source })
}

/// Enqueues an [`Event`] for every notification it is handed.
///
/// Never blocks: enqueueing only takes the queue lock briefly.
pub struct Translator {
    queue: WorkQueue<Event>,
    logger: Arc<dyn Logger>,
}

impl Translator {
    pub fn new(queue: WorkQueue<Event>, logger: Arc<dyn Logger>) -> Self {
        Self { queue, logger }
    }

    pub fn handle<K: Resource>(&self, notification: Notification<K>) {
        match translate(&notification) {
            Ok(event) => {
                self.logger.info(format_args!(
                    "Event received of type [{}] for [{}]",
                    event.kind, event.key
                ));
                self.queue.add(event);
            }
            Err(err) => self.logger.error(format_args!("Dropping notification: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::logger::recording::Recording;

    fn pod(name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_owned()),
                name: name.map(str::to_owned),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[test]
    fn keys_updates_from_new_object() {
        let event = translate(&Notification::Updated {
            old: pod(Some("old")),
            new: pod(Some("new")),
        })
        .unwrap();
        assert_eq!(event.key().to_string(), "default/new");
        assert_eq!(event.kind(), EventKind::Updated);
    }

    #[test]
    fn accepts_tombstone_keys() {
        let event = translate::<Pod>(&Notification::Deleted(Deletion::Tombstone(
            "default/gone".to_owned(),
        )))
        .unwrap();
        assert_eq!(event.key(), &QualifiedName::new(Some("default"), "gone"));
        assert_eq!(event.kind(), EventKind::Deleted);
    }

    #[test]
    fn rejects_malformed_notifications() {
        let err = translate(&Notification::Added(pod(None))).unwrap_err();
        assert_eq!(err.source, KeyError::MissingName);

        let err = translate::<Pod>(&Notification::Deleted(Deletion::Tombstone(
            "a/b/c".to_owned(),
        )))
        .unwrap_err();
        assert_eq!(err.kind, EventKind::Deleted);
    }

    #[test]
    fn events_compare_by_key() {
        let key = QualifiedName::new(Some("default"), "a");
        assert_eq!(
            Event::new(key.clone(), EventKind::Created),
            Event::new(key, EventKind::Deleted)
        );
    }

    #[tokio::test]
    async fn malformed_notifications_never_reach_the_queue() {
        let queue = WorkQueue::new();
        let logger = Arc::new(Recording::default());
        let translator = Translator::new(queue.clone(), logger.clone());

        translator.handle(Notification::Added(pod(None)));
        translator.handle(Notification::Added(pod(Some("ok"))));

        assert_eq!(queue.len(), 1);
        assert_eq!(logger.errors().len(), 1);
        assert_eq!(queue.get().await.unwrap().key().name, "ok");
    }
}
