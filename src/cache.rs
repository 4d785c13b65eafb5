//! The local mirror of the remote collection, kept in a `kube_runtime` reflector store.
//!
//! A [`Writer`] is owned by the informer and is the only way to mutate the mirror.
//! Any number of [`Store`] readers may look objects up concurrently;
//! the state they see may lag the remote source,
//! so reconcilers must derive truth from the object fields rather than assume freshness.

use std::{collections::BTreeSet, sync::Arc};

use futures::FutureExt;
use kube_core::Resource;
use kube_runtime::{
    reflector::{self, ObjectRef},
    watcher,
};

use crate::feed::{Deletion, Notification, QualifiedName};

/// Creates an empty, unsynced mirror.
pub fn new<K>() -> (Writer<K>, Store<K>)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let writer = Writer {
        inner: reflector::store::Writer::new(()),
    };
    let store = writer.as_reader();
    (writer, store)
}

fn object_ref<K>(key: &QualifiedName) -> ObjectRef<K>
where
    K: Resource<DynamicType = ()>,
{
    let obj_ref = ObjectRef::new(&key.name);
    match &key.namespace {
        Some(namespace) => obj_ref.within(namespace),
        None => obj_ref,
    }
}

/// Read handle to the mirror.
pub struct Store<K: Resource<DynamicType = ()> + 'static> {
    inner: reflector::Store<K>,
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Returns the latest known state of the object, if it exists.
    pub fn get(&self, key: &QualifiedName) -> Option<Arc<K>> {
        self.inner.get(&object_ref(key))
    }

    /// Returns every object currently known, in no particular order.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.inner.state()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the initial full listing has been applied.
    pub fn has_synced(&self) -> bool {
        matches!(self.inner.wait_until_ready().now_or_never(), Some(Ok(())))
    }

    /// Waits until the initial full listing has been applied.
    pub async fn wait_until_synced(&self) -> Result<(), WriterDropped> {
        self.inner.wait_until_ready().await.map_err(|_| WriterDropped)
    }
}

/// Returned by [`Store::wait_until_synced`] when the writer went away before the first listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cache writer dropped before the initial listing was applied")]
pub struct WriterDropped;

/// Write handle to the mirror.
pub struct Writer<K: Resource<DynamicType = ()> + 'static> {
    inner: reflector::store::Writer<K>,
}

impl<K> Writer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn as_reader(&self) -> Store<K> {
        Store {
            inner: self.inner.as_reader(),
        }
    }

    fn known(&self, obj: &K) -> Option<Arc<K>> {
        let key = QualifiedName::from_resource(obj).ok()?;
        self.inner.as_reader().get(&object_ref(&key))
    }

    fn changed(&self, obj: K) -> Notification<K> {
        match self.known(&obj) {
            Some(old) => Notification::Updated {
                old: K::clone(&old),
                new: obj,
            },
            None => Notification::Added(obj),
        }
    }

    /// Applies a watcher event to the mirror, then reports what changed to `dispatch`.
    ///
    /// A `Restarted` listing replaces the whole mirror and marks it synced;
    /// objects missing from it are reported as tombstones.
    /// Objects without a derivable key are not mirrored but are still reported,
    /// leaving the decision to drop them to the translator.
    pub fn apply(&mut self, event: watcher::Event<K>, mut dispatch: impl FnMut(Notification<K>)) {
        let notifications = match event {
            watcher::Event::Applied(obj) => {
                let notification = self.changed(obj.clone());
                if QualifiedName::from_resource(&obj).is_ok() {
                    self.inner.apply_watcher_event(&watcher::Event::Applied(obj));
                }
                vec![notification]
            }
            watcher::Event::Deleted(obj) => {
                if QualifiedName::from_resource(&obj).is_ok() {
                    self.inner.apply_watcher_event(&watcher::Event::Deleted(obj.clone()));
                }
                vec![Notification::Deleted(Deletion::Object(obj))]
            }
            watcher::Event::Restarted(listing) => self.replace(listing),
        };

        for notification in notifications {
            dispatch(notification);
        }
    }

    fn replace(&mut self, listing: Vec<K>) -> Vec<Notification<K>> {
        let mut gone: BTreeSet<QualifiedName> = self
            .inner
            .as_reader()
            .state()
            .iter()
            .filter_map(|obj| QualifiedName::from_resource(&**obj).ok())
            .collect();

        let mut keyed = Vec::with_capacity(listing.len());
        let mut notifications = Vec::with_capacity(listing.len());
        for obj in listing {
            match QualifiedName::from_resource(&obj) {
                Ok(key) => {
                    gone.remove(&key);
                    notifications.push(self.changed(obj.clone()));
                    keyed.push(obj);
                }
                Err(_) => notifications.push(Notification::Added(obj)),
            }
        }

        self.inner.apply_watcher_event(&watcher::Event::Restarted(keyed));

        notifications.extend(
            gone.into_iter()
                .map(|key| Notification::Deleted(Deletion::Tombstone(key.to_string()))),
        );
        notifications
    }
}
