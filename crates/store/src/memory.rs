//! In-memory resource store with real list/watch semantics. Backs tests and dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use secmeta_core::{CacheObject, Labels, ResourceKey, WatchedResource};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{Listing, MetadataPatcher, ResourceStore, Result, StoreError, WatchEvent, WatchStream};

const HISTORY_CAP: usize = 4096;

#[derive(Clone)]
enum Msg<T> {
    Event(WatchEvent<T>),
    Disconnect,
}

struct State<T> {
    items: BTreeMap<ResourceKey, T>,
    rv: u64,
    history: VecDeque<(u64, WatchEvent<T>)>,
}

pub struct MemoryStore<T> {
    state: Mutex<State<T>>,
    tx: broadcast::Sender<Msg<T>>,
    patches: AtomicUsize,
    fail_patches: AtomicBool,
}

impl<T: CacheObject> Default for MemoryStore<T> {
    fn default() -> Self { Self::new() }
}

impl<T: CacheObject> MemoryStore<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State { items: BTreeMap::new(), rv: 0, history: VecDeque::new() }),
            tx,
            patches: AtomicUsize::new(0),
            fail_patches: AtomicBool::new(false),
        }
    }

    pub fn with_items(items: impl IntoIterator<Item = T>) -> Self {
        let store = Self::new();
        for obj in items {
            store.upsert(obj);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    fn emit(&self, st: &mut State<T>, ev: WatchEvent<T>) {
        st.rv += 1;
        st.history.push_back((st.rv, ev.clone()));
        if st.history.len() > HISTORY_CAP {
            st.history.pop_front();
        }
        let _ = self.tx.send(Msg::Event(ev));
    }

    /// Create or replace an object.
    pub fn upsert(&self, obj: T) {
        let mut st = self.lock();
        let existed = st.items.insert(obj.key(), obj.clone()).is_some();
        let ev = if existed { WatchEvent::Modified(obj) } else { WatchEvent::Added(obj) };
        self.emit(&mut st, ev);
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<T> {
        let mut st = self.lock();
        let gone = st.items.remove(key)?;
        self.emit(&mut st, WatchEvent::Deleted(gone.clone()));
        Some(gone)
    }

    pub fn peek(&self, key: &ResourceKey) -> Option<T> { self.lock().items.get(key).cloned() }

    pub fn resource_version(&self) -> u64 { self.lock().rv }

    /// End every open watch stream, as an apiserver restart would.
    pub fn disconnect_watchers(&self) { let _ = self.tx.send(Msg::Disconnect); }

    pub fn patch_count(&self) -> usize { self.patches.load(Ordering::SeqCst) }

    pub fn set_fail_patches(&self, fail: bool) { self.fail_patches.store(fail, Ordering::SeqCst); }

    /// Mutate an existing object in place and emit a modification.
    pub fn modify(&self, key: &ResourceKey, f: impl FnOnce(&mut T)) -> Result<()> {
        let mut st = self.lock();
        let obj = st.items.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        f(obj);
        let ev = WatchEvent::Modified(obj.clone());
        self.emit(&mut st, ev);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: CacheObject> ResourceStore<T> for MemoryStore<T> {
    async fn list(&self) -> Result<Listing<T>> {
        let st = self.lock();
        Ok(Listing { items: st.items.values().cloned().collect(), resource_version: st.rv.to_string() })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<T>> {
        let from: u64 = resource_version.parse().map_err(|_| StoreError::Decode(format!("resource version {resource_version:?}")))?;
        let (replay, rx) = {
            let st = self.lock();
            if let Some((oldest, _)) = st.history.front() {
                if from + 1 < *oldest {
                    return Err(StoreError::Gone(resource_version.to_string()));
                }
            }
            let replay: VecDeque<WatchEvent<T>> = st.history.iter().filter(|(v, _)| *v > from).map(|(_, e)| e.clone()).collect();
            (replay, self.tx.subscribe())
        };
        let stream = futures::stream::unfold((replay, rx), |(mut replay, mut rx)| async move {
            if let Some(ev) = replay.pop_front() {
                return Some((Ok(ev), (replay, rx)));
            }
            match rx.recv().await {
                Ok(Msg::Event(ev)) => Some((Ok(ev), (replay, rx))),
                Ok(Msg::Disconnect) | Err(RecvError::Closed) => None,
                Err(RecvError::Lagged(n)) => Some((Err(StoreError::Gone(format!("watcher lagged by {n} events"))), (replay, rx))),
            }
        });
        Ok(stream.boxed())
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<T>> { Ok(self.peek(key)) }
}

#[async_trait::async_trait]
impl MetadataPatcher for MemoryStore<WatchedResource> {
    async fn patch_metadata(&self, key: &ResourceKey, labels: &Labels, annotations: &Labels) -> Result<()> {
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(StoreError::Api(format!("patch of {key} rejected")));
        }
        self.modify(key, |obj| {
            obj.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            obj.annotations.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
            let rv = obj.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
            obj.resource_version = Some((rv + 1).to_string());
        })?;
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secmeta_core::ResourceKind;

    fn image(name: &str) -> WatchedResource { WatchedResource::new(ResourceKind::Image, ResourceKey::cluster(name)) }

    #[tokio::test]
    async fn watch_replays_events_after_the_listed_version() {
        let store = MemoryStore::with_items([image("a")]);
        let listing = store.list().await.unwrap();
        store.upsert(image("b"));
        store.remove(&ResourceKey::cluster("a"));
        let mut w = store.watch(&listing.resource_version).await.unwrap();
        assert!(matches!(w.next().await, Some(Ok(WatchEvent::Added(o))) if o.key.name == "b"));
        assert!(matches!(w.next().await, Some(Ok(WatchEvent::Deleted(o))) if o.key.name == "a"));
        store.disconnect_watchers();
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn patch_merges_and_keeps_unrelated_keys() {
        let mut img = image("a");
        img.annotations.insert("owner".into(), "team-x".into());
        let store = MemoryStore::with_items([img]);
        let mut ann = Labels::new();
        ann.insert("scan".into(), "done".into());
        store.patch_metadata(&ResourceKey::cluster("a"), &Labels::new(), &ann).await.unwrap();
        let got = store.peek(&ResourceKey::cluster("a")).unwrap();
        assert_eq!(got.annotations.get("owner").map(String::as_str), Some("team-x"));
        assert_eq!(got.annotations.get("scan").map(String::as_str), Some("done"));
        assert_eq!(store.patch_count(), 1);
        let err = store.patch_metadata(&ResourceKey::cluster("missing"), &Labels::new(), &ann).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
