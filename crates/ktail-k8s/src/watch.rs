use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use parking_lot::Mutex;

use ktail_core::{WatchError, WatchSource};
use ktail_types::{PodSnapshot, WatchEvent, WatchEventKind};

use crate::convert::pod_snapshot;

/// (namespace, name)
type PodRef = (String, String);

/// Pod list/watch backed by the Kubernetes API
///
/// Selector filtering is left to the controller so that a pod whose labels
/// stop matching still produces its delete notification.
pub struct KubeWatchSource {
    api: Api<Pod>,
    /// Result of the last listing, handed to the next watch
    listing: Mutex<Listing>,
}

/// What a listing leaves behind for the watch that follows it
#[derive(Default)]
struct Listing {
    known: HashMap<PodRef, PodSnapshot>,
    /// Reasons for pods that could not be decoded
    rejected: Vec<String>,
}

impl Listing {
    fn from_pods(items: &[Pod]) -> (Vec<PodSnapshot>, Self) {
        let mut pods = Vec::with_capacity(items.len());
        let mut listing = Self::default();
        for pod in items {
            match pod_snapshot(pod) {
                Ok(snapshot) => {
                    listing.known.insert(pod_ref(&snapshot), snapshot.clone());
                    pods.push(snapshot);
                }
                Err(reason) => listing.rejected.push(reason),
            }
        }
        (pods, listing)
    }

    /// Rejected listing entries, reported like malformed add notifications
    fn malformed(&mut self) -> Vec<Result<WatchEvent, WatchError>> {
        self.rejected
            .drain(..)
            .map(|reason| {
                Ok(WatchEvent::Malformed {
                    kind: WatchEventKind::Added,
                    reason,
                })
            })
            .collect()
    }
}

impl KubeWatchSource {
    /// Watch one namespace, or every namespace when `None`
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self {
            api,
            listing: Mutex::new(Listing::default()),
        }
    }
}

impl WatchSource for KubeWatchSource {
    async fn list(&self) -> Result<Vec<PodSnapshot>, WatchError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| WatchError::List(Box::new(e)))?;

        let (pods, listing) = Listing::from_pods(&list.items);
        *self.listing.lock() = listing;
        Ok(pods)
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent, WatchError>> {
        let mut listing = std::mem::take(&mut *self.listing.lock());
        let rejected = listing.malformed();
        let mut tracker = PodTracker::new(listing.known);

        let events = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .map(move |event| tracker.apply(event))
            .flat_map(futures::stream::iter);

        futures::stream::iter(rejected).chain(events).boxed()
    }
}

/// Turns raw watcher events into add/update/delete notifications.
///
/// The watcher only reports "applied" objects and re-lists after every
/// reconnect, so the tracker remembers which pods it has reported to tell
/// additions from updates and to synthesize deletes for pods that vanished
/// while the watch was down.
struct PodTracker {
    known: HashMap<PodRef, PodSnapshot>,
    /// Pods seen since the current re-list started
    relisting: Option<HashSet<PodRef>>,
}

impl PodTracker {
    fn new(known: HashMap<PodRef, PodSnapshot>) -> Self {
        Self {
            known,
            relisting: None,
        }
    }

    fn apply(
        &mut self,
        event: Result<watcher::Event<Pod>, watcher::Error>,
    ) -> Vec<Result<WatchEvent, WatchError>> {
        let event = match event {
            Ok(event) => event,
            Err(e) => return vec![Err(WatchError::Stream(Box::new(e)))],
        };

        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(pod) => {
                let Ok(snapshot) = pod_snapshot(&pod) else {
                    return self.applied(&pod);
                };
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(pod_ref(&snapshot));
                }
                self.upsert(snapshot)
            }
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Apply(pod) => self.applied(&pod),
            watcher::Event::Delete(pod) => match pod_snapshot(&pod) {
                Ok(snapshot) => {
                    self.known.remove(&pod_ref(&snapshot));
                    vec![Ok(WatchEvent::Deleted(snapshot))]
                }
                Err(reason) => vec![Ok(WatchEvent::Malformed {
                    kind: WatchEventKind::Deleted,
                    reason,
                })],
            },
        }
    }

    fn applied(&mut self, pod: &Pod) -> Vec<Result<WatchEvent, WatchError>> {
        match pod_snapshot(pod) {
            Ok(snapshot) => self.upsert(snapshot),
            Err(reason) => vec![Ok(WatchEvent::Malformed {
                kind: WatchEventKind::Added,
                reason,
            })],
        }
    }

    fn upsert(&mut self, snapshot: PodSnapshot) -> Vec<Result<WatchEvent, WatchError>> {
        match self.known.insert(pod_ref(&snapshot), snapshot.clone()) {
            None => vec![Ok(WatchEvent::Added(snapshot))],
            // Same name, different pod: the old one was deleted while we weren't looking
            Some(previous) if replaced(&previous, &snapshot) => vec![
                Ok(WatchEvent::Deleted(previous)),
                Ok(WatchEvent::Added(snapshot)),
            ],
            Some(_) => vec![Ok(WatchEvent::Updated(snapshot))],
        }
    }

    fn finish_relist(&mut self) -> Vec<Result<WatchEvent, WatchError>> {
        let Some(seen) = self.relisting.take() else {
            return Vec::new();
        };

        let gone: Vec<PodRef> = self
            .known
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();

        gone.into_iter()
            .filter_map(|key| self.known.remove(&key))
            .map(|snapshot| Ok(WatchEvent::Deleted(snapshot)))
            .collect()
    }
}

fn replaced(previous: &PodSnapshot, current: &PodSnapshot) -> bool {
    matches!((&previous.uid, &current.uid), (Some(a), Some(b)) if a != b)
}

fn pod_ref(snapshot: &PodSnapshot) -> PodRef {
    (snapshot.namespace.clone(), snapshot.name.clone())
}
