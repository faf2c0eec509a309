use std::{fmt::Debug, future, hash::Hash};

use futures::{Stream, TryStreamExt};
use kube_client::Api;
use kube_core::Resource;
use kube_runtime::{reflector, watcher, WatchStreamExt};
use serde::de::DeserializeOwned;

use super::{Event, QualifiedName};

/// Events for every object of the type `K`.
pub fn objects<K: Resource>(
    client: Api<K>,
    watcher_config: watcher::Config,
) -> impl Stream<Item = Result<Event<QualifiedName, K>, watcher::Error>>
where
    K: 'static + Debug + Clone + DeserializeOwned + Send,
    K::DynamicType: Clone + Eq + Hash + Default,
{
    with(client, watcher_config, <_>::default())
}

/// Events for every object of the type `dyntype`.
///
/// Watch failures are retried with the default backoff and still surface as
/// stream errors. Objects without a name cannot be addressed and are skipped.
pub fn with<K: Resource>(
    client: Api<K>,
    watcher_config: watcher::Config,
    dyntype: K::DynamicType,
) -> impl Stream<Item = Result<Event<QualifiedName, K>, watcher::Error>>
where
    K: 'static + Debug + Clone + DeserializeOwned + Send,
    K::DynamicType: Clone + Eq + Hash,
{
    let writer = reflector::store::Writer::new(dyntype.clone());
    let store = writer.as_reader();

    reflector(writer, watcher(client, watcher_config).default_backoff())
        .touched_objects()
        .try_filter_map(move |resource| {
            let event = QualifiedName::from_resource(&resource).map(|key| {
                let store_value = store.get(&reflector::ObjectRef::from_obj_with(
                    &resource,
                    dyntype.clone(),
                ));
                Event {
                    key,
                    entry: resource,
                    exists: store_value.is_some(),
                }
            });
            future::ready(Ok(event))
        })
}
