//! Watches that feed the work queue.
//!
//! Claims are tracked by key so every notification can be compared with the copy
//! seen before it. Bucket records are only mirrored into a reflector store; the
//! workers wait for it to be ready before they start.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        WatchStreamExt,
        reflector::{Store, store::Writer},
        watcher,
    },
};
use tokio::sync::{RwLock, watch};
use tracing::*;

use crate::{
    ObjectBucket, ObjectBucketClaim, ObjectBucketClaimSpec, controller::Diagnostics, naming::claim_key,
    queue::WorkQueue,
};

/// Whether an update notification is worth a sync
pub fn should_enqueue_update(old: &ObjectBucketClaim, new: &ObjectBucketClaim) -> bool {
    // periodic relists deliver the same object again
    if old.resource_version().is_some() && old.resource_version() == new.resource_version() {
        return false;
    }
    // a deletion already in flight is handled by the sync that saw it first
    if old.is_deleting() && new.is_deleting() {
        return false;
    }
    update_supported(old, new)
}

/// A bound claim may only change its additional configuration. Deletion is
/// always accepted.
pub fn update_supported(old: &ObjectBucketClaim, new: &ObjectBucketClaim) -> bool {
    if new.is_deleting() {
        return true;
    }
    if old.spec == new.spec {
        return false;
    }
    let mut overlaid = old.spec.clone();
    overlaid.additional_config = new.spec.additional_config.clone();
    if overlaid == new.spec {
        return true;
    }
    if is_bookkeeping(&old.spec, &new.spec) {
        debug!(claim = %new.name_any(), "ignoring controller written spec fields");
    } else {
        warn!(claim = %new.name_any(), "invalid changes to claim spec, only additionalConfig may change");
    }
    false
}

/// The controller itself fills in the bucket name and bound record name
fn is_bookkeeping(old: &ObjectBucketClaimSpec, new: &ObjectBucketClaimSpec) -> bool {
    let filled = |before: &str, after: &str| before == after || before.is_empty();
    filled(&old.bucket_name, &new.bucket_name)
        && filled(&old.object_bucket_name, &new.object_bucket_name)
        && old.storage_class_name == new.storage_class_name
        && old.generate_bucket_name == new.generate_bucket_name
        && old.additional_config == new.additional_config
}

/// Turns claim watch events into work queue keys
pub struct ClaimEventHandler {
    queue: WorkQueue,
    known: HashMap<String, ObjectBucketClaim>,
    /// Keys seen during the current (re)list, if one is running
    relisting: Option<HashSet<String>>,
}

impl ClaimEventHandler {
    pub fn new(queue: WorkQueue) -> Self {
        Self {
            queue,
            known: HashMap::new(),
            relisting: None,
        }
    }

    /// Returns true when an initial list has just completed
    pub async fn handle(&mut self, event: watcher::Event<ObjectBucketClaim>) -> bool {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                false
            }
            watcher::Event::InitApply(claim) => {
                if let (Some(seen), Ok(key)) = (self.relisting.as_mut(), claim_key(&claim)) {
                    seen.insert(key);
                }
                self.apply(claim).await;
                false
            }
            watcher::Event::InitDone => {
                if let Some(seen) = self.relisting.take() {
                    // deleted while the watch was down
                    self.known.retain(|key, _| seen.contains(key));
                }
                true
            }
            watcher::Event::Apply(claim) => {
                self.apply(claim).await;
                false
            }
            watcher::Event::Delete(claim) => {
                // the finalizer means a sync already cleaned up before the object went away
                if let Ok(key) = claim_key(&claim) {
                    debug!(%key, "claim deleted");
                    self.known.remove(&key);
                }
                false
            }
        }
    }

    async fn apply(&mut self, claim: ObjectBucketClaim) {
        let key = match claim_key(&claim) {
            Ok(key) => key,
            Err(e) => {
                error!("cannot key claim: {e}");
                return;
            }
        };
        let enqueue = match self.known.get(&key) {
            None => true,
            Some(old) => should_enqueue_update(old, &claim),
        };
        self.known.insert(key.clone(), claim);
        if enqueue {
            debug!(%key, "enqueuing claim");
            self.queue.add(&key).await;
        }
    }
}

/// Feed claim events into the queue, flagging `synced` after the first full list
pub async fn watch_claims(api: Api<ObjectBucketClaim>, queue: WorkQueue, synced: watch::Sender<bool>) {
    let mut handler = ClaimEventHandler::new(queue);
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if handler.handle(event).await {
                    synced.send_replace(true);
                }
            }
            Err(e) => warn!("claim watch failed: {e}"),
        }
    }
}

/// Mirror bucket records into `writer`, publishing the cache size to diagnostics
pub async fn watch_buckets(
    api: Api<ObjectBucket>,
    writer: Writer<ObjectBucket>,
    reader: Store<ObjectBucket>,
    diagnostics: Arc<RwLock<Diagnostics>>,
) {
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .touched_objects()
        .boxed();
    while let Some(event) = events.next().await {
        if let Err(e) = event {
            warn!("object bucket watch failed: {e}");
            continue;
        }
        diagnostics.write().await.object_buckets = reader.state().len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectBucketClaimSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn claim(rv: &str, config: &[(&str, &str)]) -> ObjectBucketClaim {
        let mut c = ObjectBucketClaim::new(
            "b1",
            ObjectBucketClaimSpec {
                storage_class_name: "sc".into(),
                generate_bucket_name: "b1".into(),
                bucket_name: "b1-abc".into(),
                object_bucket_name: "obc-ns-b1".into(),
                additional_config: config.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            },
        );
        c.metadata.namespace = Some("ns".into());
        c.metadata.resource_version = Some(rv.into());
        c
    }

    fn deleting(mut c: ObjectBucketClaim) -> ObjectBucketClaim {
        c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        c
    }

    #[test]
    fn resync_of_same_version_is_ignored() {
        let old = claim("1", &[("a", "1")]);
        let mut new = old.clone();
        new.spec.additional_config = BTreeMap::from([("a".to_string(), "2".to_string())]);
        assert!(!should_enqueue_update(&old, &new));
    }

    #[test]
    fn additional_config_change_is_enqueued() {
        let old = claim("1", &[("a", "1")]);
        let new = claim("2", &[("a", "2")]);
        assert!(should_enqueue_update(&old, &new));
    }

    #[test]
    fn other_spec_changes_are_rejected() {
        let old = claim("1", &[]);
        let mut new = claim("2", &[]);
        new.spec.storage_class_name = "other".into();
        assert!(!should_enqueue_update(&old, &new));

        let mut filled = claim("2", &[]);
        let mut empty = claim("1", &[]);
        empty.spec.object_bucket_name.clear();
        filled.spec.bucket_name = "b1-abc".into();
        assert!(!should_enqueue_update(&empty, &filled));
    }

    #[test]
    fn status_only_changes_are_ignored() {
        let old = claim("1", &[]);
        let new = claim("2", &[]);
        assert!(!should_enqueue_update(&old, &new));
    }

    #[test]
    fn deletion_is_enqueued_once() {
        let old = claim("1", &[]);
        let first = deleting(claim("2", &[]));
        let second = deleting(claim("3", &[]));
        assert!(should_enqueue_update(&old, &first));
        assert!(!should_enqueue_update(&first, &second));
    }

    #[tokio::test]
    async fn events_drive_the_queue() {
        let queue = WorkQueue::default();
        let mut handler = ClaimEventHandler::new(queue.clone());
        assert!(!handler.handle(watcher::Event::Init).await);
        assert!(!handler.handle(watcher::Event::InitApply(claim("1", &[]))).await);
        assert!(handler.handle(watcher::Event::InitDone).await);
        assert_eq!(queue.get().await.as_deref(), Some("ns/b1"));
        queue.done("ns/b1").await;

        // same object again
        handler.handle(watcher::Event::Apply(claim("1", &[]))).await;
        assert!(queue.is_empty().await);

        handler.handle(watcher::Event::Apply(claim("2", &[("a", "1")]))).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await.as_deref(), Some("ns/b1"));
        queue.done("ns/b1").await;

        // deletion notifications never enqueue
        handler.handle(watcher::Event::Delete(claim("3", &[]))).await;
        assert!(queue.is_empty().await);
        // a claim recreated under the same key is new again
        handler.handle(watcher::Event::Apply(claim("4", &[]))).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn relist_forgets_claims_that_disappeared() {
        let queue = WorkQueue::default();
        let mut handler = ClaimEventHandler::new(queue.clone());
        handler.handle(watcher::Event::Apply(claim("1", &[]))).await;
        queue.get().await;
        queue.done("ns/b1").await;

        handler.handle(watcher::Event::Init).await;
        handler.handle(watcher::Event::InitDone).await;
        assert!(handler.known.is_empty());
    }
}
