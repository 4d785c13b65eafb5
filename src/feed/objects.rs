use std::fmt::Debug;

use futures::{stream::BoxStream, StreamExt};
use kube_client::Api;
use kube_core::Resource;
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;

use super::ChangeFeed;

/// Change feed over every object of the type `K` visible through `api`.
pub fn objects<K>(api: Api<K>, watcher_config: watcher::Config) -> Objects<K>
where
    K: Resource<DynamicType = ()> + 'static + Debug + Clone + DeserializeOwned + Send + Sync,
{
    Objects {
        api,
        watcher_config,
    }
}

/// The [`ChangeFeed`] returned by [`objects`].
pub struct Objects<K> {
    api: Api<K>,
    watcher_config: watcher::Config,
}

impl<K> ChangeFeed for Objects<K>
where
    K: Resource<DynamicType = ()> + 'static + Debug + Clone + DeserializeOwned + Send + Sync,
{
    type Object = K;
    type Error = watcher::Error;

    fn subscribe(&mut self) -> BoxStream<'static, watcher::Result<watcher::Event<K>>> {
        watcher(self.api.clone(), self.watcher_config.clone())
            .default_backoff()
            .boxed()
    }
}
