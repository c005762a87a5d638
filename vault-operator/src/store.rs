//! Cached, indexed view of `VaultService` objects with an add/update/delete
//! event stream and a synced signal (C2).
//!
//! Built directly on `kube::runtime::watcher` rather than the opaque
//! `Controller::run` combinator, so the cache and its event stream are
//! independently constructible and testable: the reconcile worker and the
//! health monitor both need a synchronous `get(key)` that this type provides
//! without going through the API server.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::StreamExt;
use kube::{
    Api, ResourceExt,
    runtime::watcher::{self, Config, Event},
};
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use vault_operator_types::VaultService;

/// A namespace/name identity, independent of any particular object revision.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl ObjectKey {
    pub fn of(obj: &VaultService) -> Self {
        ObjectKey {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

/// An observed change to the set of cached `VaultService` objects.
///
/// `Deleted` carries the last-known object when the store had one cached;
/// `DeletedTombstone` fires when the final state was never observed (e.g. a
/// delete arriving for a key this replica never listed) — consumers must
/// accept both shapes (§4.1).
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Added(Arc<VaultService>),
    Updated(Arc<VaultService>, Arc<VaultService>),
    Deleted(Arc<VaultService>),
    DeletedTombstone(ObjectKey),
}

impl StoreEvent {
    pub fn key(&self) -> ObjectKey {
        match self {
            StoreEvent::Added(obj) | StoreEvent::Deleted(obj) => ObjectKey::of(obj),
            StoreEvent::Updated(_, new) => ObjectKey::of(new),
            StoreEvent::DeletedTombstone(key) => key.clone(),
        }
    }
}

/// Cached, indexed view of `VaultService` resources, kept current by a
/// background watch task. Cheaply cloneable; every clone shares the same
/// cache, synced flag, and event bus.
#[derive(Clone)]
pub struct ResourceStore {
    cache: Arc<RwLock<HashMap<ObjectKey, Arc<VaultService>>>>,
    synced: Arc<AtomicBool>,
    events: broadcast::Sender<StoreEvent>,
}

impl ResourceStore {
    /// Spawns the watch loop against `api` and returns the store handle along
    /// with its background task. The task exits when `cancel` fires or the
    /// watch stream closes permanently.
    pub fn run(
        api: Api<VaultService>,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        let synced = Arc::new(AtomicBool::new(false));
        let (events, _rx) = broadcast::channel(1024);

        let task_cache = cache.clone();
        let task_synced = synced.clone();
        let task_events = events.clone();
        let handle = tokio::spawn(async move {
            let stream = watcher::watcher(api, Config::default());
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => {
                        match next {
                            None => return,
                            Some(Ok(event)) => {
                                Self::apply(&task_cache, &task_synced, &task_events, event).await;
                            }
                            Some(Err(error)) => {
                                tracing::warn!(%error, "watch stream error, retrying");
                            }
                        }
                    }
                }
            }
        });

        (
            ResourceStore {
                cache,
                synced,
                events,
            },
            handle,
        )
    }

    async fn apply(
        cache: &Arc<RwLock<HashMap<ObjectKey, Arc<VaultService>>>>,
        synced: &Arc<AtomicBool>,
        events: &broadcast::Sender<StoreEvent>,
        event: Event<VaultService>,
    ) {
        match event {
            Event::Init => {
                cache.write().await.clear();
            }
            Event::InitApply(obj) => {
                let key = ObjectKey::of(&obj);
                cache.write().await.insert(key, Arc::new(obj));
            }
            Event::InitDone => {
                synced.store(true, Ordering::SeqCst);
            }
            Event::Apply(obj) => {
                let key = ObjectKey::of(&obj);
                let new = Arc::new(obj);
                let old = cache.write().await.insert(key, new.clone());
                let store_event = match old {
                    Some(old) => StoreEvent::Updated(old, new),
                    None => StoreEvent::Added(new),
                };
                let _ = events.send(store_event);
            }
            Event::Delete(obj) => {
                let key = ObjectKey::of(&obj);
                let removed = cache.write().await.remove(&key);
                let store_event = match removed {
                    Some(prior) => StoreEvent::Deleted(prior),
                    None => StoreEvent::DeletedTombstone(key),
                };
                let _ = events.send(store_event);
            }
        }
    }

    /// Synchronous cache lookup; does not touch the API server.
    pub async fn get(&self, key: &ObjectKey) -> Option<Arc<VaultService>> {
        self.cache.read().await.get(key).cloned()
    }

    /// True once the initial list has been fully applied.
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Subscribes to the add/update/delete event stream. Events published
    /// before the first `subscribe` call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every cached key, for the periodic full-resync sweep
    /// (§9 "reconcile from the authoritative store on each tick").
    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.cache.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_operator_types::{VaultService, VaultServiceSpec};

    fn obj(ns: &str, name: &str) -> VaultService {
        let mut v = VaultService::new(name, VaultServiceSpec::default());
        v.metadata.namespace = Some(ns.to_string());
        v
    }

    #[tokio::test]
    async fn apply_distinguishes_added_from_updated() {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        let synced = Arc::new(AtomicBool::new(false));
        let (events, mut rx) = broadcast::channel(16);

        ResourceStore::apply(&cache, &synced, &events, Event::Apply(obj("ns", "v"))).await;
        match rx.recv().await.unwrap() {
            StoreEvent::Added(o) => assert_eq!(o.name_any(), "v"),
            other => panic!("expected Added, got {other:?}"),
        }

        let mut updated = obj("ns", "v");
        updated.spec.nodes = 3;
        ResourceStore::apply(&cache, &synced, &events, Event::Apply(updated)).await;
        match rx.recv().await.unwrap() {
            StoreEvent::Updated(old, new) => {
                assert_eq!(old.spec.nodes, 0);
                assert_eq!(new.spec.nodes, 3);
            }
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_without_prior_cache_entry_is_a_tombstone() {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        let synced = Arc::new(AtomicBool::new(false));
        let (events, mut rx) = broadcast::channel(16);

        ResourceStore::apply(&cache, &synced, &events, Event::Delete(obj("ns", "missing"))).await;
        match rx.recv().await.unwrap() {
            StoreEvent::DeletedTombstone(key) => assert_eq!(key.name, "missing"),
            other => panic!("expected DeletedTombstone, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn init_done_flips_synced() {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        let synced = Arc::new(AtomicBool::new(false));
        let (events, _rx) = broadcast::channel(16);

        assert!(!synced.load(Ordering::SeqCst));
        ResourceStore::apply(&cache, &synced, &events, Event::InitDone).await;
        assert!(synced.load(Ordering::SeqCst));
    }
}
