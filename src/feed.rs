//! The change feed a controller observes, and the notifications derived from it.

use std::{fmt, str::FromStr};

use futures::stream::BoxStream;
use kube_core::Resource;
use kube_runtime::watcher;

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_owned),
            name: name.to_owned(),
        }
    }

    pub fn from_resource<K: Resource>(resource: &K) -> Result<Self, KeyError> {
        let meta = resource.meta();
        match meta.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(Self {
                namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
                name: name.to_owned(),
            }),
            _ => Err(KeyError::MissingName),
        }
    }
}

/// Renders as `namespace/name`, or `name` for cluster-scoped objects.
impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for QualifiedName {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::new(None, name)),
            (Some(namespace), Some(name), None) if !name.is_empty() => Ok(Self::new(
                Some(namespace).filter(|ns| !ns.is_empty()),
                name,
            )),
            _ => Err(KeyError::Malformed(key.to_owned())),
        }
    }
}

/// Why a key could not be derived for an object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

/// What a deletion notification carries.
#[derive(Debug, Clone)]
pub enum Deletion<K> {
    /// The final state of the deleted object.
    Object(K),
    /// Only the key of an object whose deletion was inferred from a relist.
    Tombstone(String),
}

/// A change to the local mirror, dispatched after it has been applied.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(Deletion<K>),
}

/// A list-watch subscription to a remote collection.
///
/// The stream delivers [`watcher::Event`]s: a `Restarted` full listing first,
/// then `Applied` and `Deleted` changes, and another `Restarted` whenever the collection is relisted.
/// Every call to [`subscribe`](Self::subscribe) starts over with a full listing,
/// which is how the informer implements resync.
pub trait ChangeFeed: Send + 'static {
    /// The observed object type.
    type Object: Resource<DynamicType = ()> + Clone + Send + Sync + 'static;
    /// Errors reported by the stream. The stream is expected to recover from them.
    type Error: fmt::Display + Send + 'static;

    /// Starts a new list-watch stream.
    fn subscribe(
        &mut self,
    ) -> BoxStream<'static, Result<watcher::Event<Self::Object>, Self::Error>>;
}

pub mod objects;
pub use objects::objects;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_key() {
        let key: QualifiedName = "default/web-0".parse().unwrap();
        assert_eq!(key, QualifiedName::new(Some("default"), "web-0"));
        assert_eq!(key.to_string(), "default/web-0");
    }

    #[test]
    fn parses_cluster_scoped_key() {
        let key: QualifiedName = "node-1".parse().unwrap();
        assert_eq!(key.namespace, None);
        assert_eq!(key.to_string(), "node-1");
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in ["", "a/b/c", "default/", "/"] {
            assert_eq!(
                key.parse::<QualifiedName>(),
                Err(KeyError::Malformed(key.to_owned())),
                "{key:?}"
            );
        }
    }
}
