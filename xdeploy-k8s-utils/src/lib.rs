use std::fmt::Debug;

use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource};
use tracing::{error, trace};

/// Watches `api` and yields raw watcher events, retrying with the default
/// backoff whenever the underlying watch fails. Errors are logged and dropped
/// so consumers only ever observe events.
pub fn watch_events<K>(api: Api<K>, config: watcher::Config) -> BoxStream<'static, watcher::Event<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    watcher(api, config)
        .default_backoff()
        .filter_map(|res| async move {
            match res {
                Ok(ev) => {
                    trace!("received event: {:?}", ev);
                    Some(ev)
                }
                Err(e) => {
                    error!(%e, "unexpected error with stream");
                    None
                }
            }
        })
        .boxed()
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
