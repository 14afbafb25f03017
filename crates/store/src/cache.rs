use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use secmeta_core::{CacheObject, ChangeKind, ResourceKey};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{ResourceStore, StoreError, WatchEvent};

const INGEST_TICK: Duration = Duration::from_millis(8);
const RELIST_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const RELIST_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub type Indexer<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;
pub type NeedsUpdate<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
/// Called after the snapshot containing the change has been published.
pub type ChangeListener = Arc<dyn Fn(ChangeKind, &ResourceKey) + Send + Sync>;

enum Ingest<T> {
    Applied(T),
    Deleted(T),
    Replace(Vec<T>),
}

#[derive(Debug, Clone)]
pub enum Delta<T> {
    Applied(T),
    Deleted,
}

/// Coalescing buffer keyed by resource key: last write wins, first-seen order is kept.
pub struct Coalescer<T> {
    map: FxHashMap<ResourceKey, Delta<T>>,
    order: VecDeque<ResourceKey>,
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self { Self { map: FxHashMap::default(), order: VecDeque::new() } }
}

impl<T> Coalescer<T> {
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push(&mut self, key: ResourceKey, d: Delta<T>) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    pub fn drain_ready(&mut self) -> Vec<(ResourceKey, Delta<T>)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push((key, d));
            }
        }
        out
    }
}

/// Immutable view of the collection at one epoch.
pub struct Snapshot<T> {
    pub epoch: u64,
    /// True once the first full listing has been applied.
    pub synced: bool,
    items: FxHashMap<ResourceKey, Arc<T>>,
    indexes: FxHashMap<String, FxHashMap<String, Vec<ResourceKey>>>,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self { Self { epoch: 0, synced: false, items: FxHashMap::default(), indexes: FxHashMap::default() } }
}

impl<T> Snapshot<T> {
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<T>> { self.items.get(key).cloned() }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// All objects, ordered by key.
    pub fn items(&self) -> Vec<Arc<T>> {
        let mut keys: Vec<&ResourceKey> = self.items.keys().collect();
        keys.sort();
        keys.into_iter().filter_map(|k| self.items.get(k).cloned()).collect()
    }

    /// Objects whose indexer produced `value` under `index`, ordered by key.
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<T>> {
        self.indexes
            .get(index)
            .and_then(|idx| idx.get(value))
            .map(|keys| keys.iter().filter_map(|k| self.items.get(k).cloned()).collect())
            .unwrap_or_default()
    }
}

/// Single-writer state behind the published snapshots.
pub struct IndexBuilder<T> {
    epoch: u64,
    synced: bool,
    items: FxHashMap<ResourceKey, Arc<T>>,
    needs_update: NeedsUpdate<T>,
    indexers: Vec<(String, Indexer<T>)>,
}

impl<T: CacheObject> IndexBuilder<T> {
    pub fn new(needs_update: NeedsUpdate<T>, indexers: Vec<(String, Indexer<T>)>) -> Self {
        Self { epoch: 0, synced: false, items: FxHashMap::default(), needs_update, indexers }
    }

    fn upsert(&mut self, key: ResourceKey, obj: T, out: &mut Vec<(ChangeKind, ResourceKey)>) {
        let next = Arc::new(obj);
        match self.items.insert(key.clone(), Arc::clone(&next)) {
            None => out.push((ChangeKind::Added, key)),
            Some(prev) if (self.needs_update)(&prev, &next) => out.push((ChangeKind::Updated, key)),
            Some(_) => {}
        }
    }

    /// Apply coalesced deltas. Returns the changes listeners should hear about.
    pub fn apply(&mut self, batch: Vec<(ResourceKey, Delta<T>)>) -> Vec<(ChangeKind, ResourceKey)> {
        let mut out = Vec::with_capacity(batch.len());
        for (key, d) in batch {
            match d {
                Delta::Applied(obj) => self.upsert(key, obj, &mut out),
                Delta::Deleted => {
                    if self.items.remove(&key).is_some() {
                        out.push((ChangeKind::Deleted, key));
                    }
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        out
    }

    /// Replace the whole collection with a fresh listing; objects missing from it are deleted.
    pub fn replace(&mut self, listing: Vec<T>) -> Vec<(ChangeKind, ResourceKey)> {
        let mut out = Vec::new();
        let mut seen: FxHashSet<ResourceKey> = FxHashSet::default();
        for obj in listing {
            let key = obj.key();
            seen.insert(key.clone());
            self.upsert(key, obj, &mut out);
        }
        let mut gone: Vec<ResourceKey> = self.items.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        gone.sort();
        for key in gone {
            self.items.remove(&key);
            out.push((ChangeKind::Deleted, key));
        }
        self.synced = true;
        self.epoch = self.epoch.saturating_add(1);
        out
    }

    pub fn freeze(&self) -> Arc<Snapshot<T>> {
        let mut indexes: FxHashMap<String, FxHashMap<String, Vec<ResourceKey>>> = FxHashMap::default();
        for (name, f) in &self.indexers {
            let idx = indexes.entry(name.clone()).or_default();
            for (key, obj) in &self.items {
                for v in f(obj) {
                    idx.entry(v).or_default().push(key.clone());
                }
            }
            for keys in idx.values_mut() {
                keys.sort();
            }
        }
        Arc::new(Snapshot { epoch: self.epoch, synced: self.synced, items: self.items.clone(), indexes })
    }
}

/// Read handle on a running cache. Cheap to clone; reads never block the writer.
pub struct ResourceCache<T> {
    name: Arc<str>,
    snap: Arc<ArcSwap<Snapshot<T>>>,
    epoch_rx: watch::Receiver<u64>,
    synced_rx: watch::Receiver<bool>,
}

impl<T> Clone for ResourceCache<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            snap: Arc::clone(&self.snap),
            epoch_rx: self.epoch_rx.clone(),
            synced_rx: self.synced_rx.clone(),
        }
    }
}

impl<T> ResourceCache<T> {
    pub fn name(&self) -> &str { &self.name }
    pub fn current(&self) -> Arc<Snapshot<T>> { self.snap.load_full() }
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<T>> { self.snap.load().get(key) }
    pub fn list(&self) -> Vec<Arc<T>> { self.snap.load().items() }
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<T>> { self.snap.load().by_index(index, value) }
    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.snap.load().is_empty() }
    pub fn has_synced(&self) -> bool { *self.synced_rx.borrow() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait for the first full listing. Returns false if the cache stopped first.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.synced_rx.clone();
        let synced = rx.wait_for(|s| *s).await.is_ok();
        synced
    }

    /// Like [`wait_synced`](Self::wait_synced) but gives up after `limit`, e.g. when the
    /// store is unreachable and the reflector keeps relisting.
    pub async fn wait_synced_within(&self, limit: Duration) -> Result<(), StoreError> {
        match tokio::time::timeout(limit, self.wait_synced()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StoreError::Closed),
            Err(_) => Err(StoreError::Api(format!("cache {} not synced within {}s", self.name, limit.as_secs_f64()))),
        }
    }
}

/// Background tasks of a running cache.
pub struct CacheTask {
    name: Arc<str>,
    reflector: JoinHandle<()>,
    ingest: JoinHandle<()>,
}

impl CacheTask {
    /// Stop the change stream, let ingest flush what it already has, and wait for it.
    pub async fn stop(self) {
        self.reflector.abort();
        let _ = self.reflector.await;
        let _ = self.ingest.await;
        info!(cache = %self.name, "cache stopped");
    }
}

pub struct CacheBuilder<T> {
    name: String,
    capacity: usize,
    needs_update: NeedsUpdate<T>,
    indexers: Vec<(String, Indexer<T>)>,
    listeners: Vec<ChangeListener>,
}

impl<T: CacheObject> CacheBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), capacity: 2048, needs_update: Arc::new(|_, _| true), indexers: Vec::new(), listeners: Vec::new() }
    }

    pub fn capacity(mut self, cap: usize) -> Self {
        self.capacity = cap.max(1);
        self
    }

    /// Decide whether an update is worth telling listeners about.
    pub fn needs_update(mut self, f: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.needs_update = Arc::new(f);
        self
    }

    pub fn index(mut self, name: impl Into<String>, f: impl Fn(&T) -> Vec<String> + Send + Sync + 'static) -> Self {
        self.indexers.push((name.into(), Arc::new(f)));
        self
    }

    pub fn on_change(mut self, f: impl Fn(ChangeKind, &ResourceKey) + Send + Sync + 'static) -> Self {
        self.listeners.push(Arc::new(f));
        self
    }

    /// Spawn the list/watch reflector and the ingest loop.
    pub fn start<S: ResourceStore<T>>(self, store: Arc<S>) -> (ResourceCache<T>, CacheTask) {
        let name: Arc<str> = Arc::from(self.name.as_str());
        let (tx, rx) = mpsc::channel::<Ingest<T>>(self.capacity);
        let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (synced_tx, synced_rx) = watch::channel(false);

        let builder = IndexBuilder::new(self.needs_update, self.indexers);
        let ingest = tokio::spawn(run_ingest(
            Arc::clone(&name),
            rx,
            builder,
            Arc::clone(&snap),
            epoch_tx,
            synced_tx,
            self.listeners,
        ));
        let reflector = tokio::spawn(run_reflector(Arc::clone(&name), store, tx));

        let cache = ResourceCache { name: Arc::clone(&name), snap, epoch_rx, synced_rx };
        (cache, CacheTask { name, reflector, ingest })
    }
}

/// List, then watch until the stream breaks, then list again. Never gives up.
async fn run_reflector<T: CacheObject, S: ResourceStore<T>>(name: Arc<str>, store: Arc<S>, tx: mpsc::Sender<Ingest<T>>) {
    let mut backoff = RELIST_BACKOFF_INITIAL;
    loop {
        match store.list().await {
            Ok(listing) => {
                debug!(cache = %name, count = listing.items.len(), rv = %listing.resource_version, "listed");
                if tx.send(Ingest::Replace(listing.items)).await.is_err() {
                    return;
                }
                match store.watch(&listing.resource_version).await {
                    Ok(mut stream) => {
                        backoff = RELIST_BACKOFF_INITIAL;
                        info!(cache = %name, "watch started");
                        while let Some(ev) = stream.next().await {
                            let msg = match ev {
                                Ok(WatchEvent::Added(o)) | Ok(WatchEvent::Modified(o)) => Ingest::Applied(o),
                                Ok(WatchEvent::Deleted(o)) => Ingest::Deleted(o),
                                Ok(WatchEvent::Bookmark(_)) => continue,
                                Err(StoreError::Gone(rv)) => {
                                    debug!(cache = %name, rv = %rv, "watch expired; relisting");
                                    break;
                                }
                                Err(e) => {
                                    warn!(cache = %name, error = %e, "watch error; relisting");
                                    break;
                                }
                            };
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        debug!(cache = %name, "watch stream ended");
                    }
                    Err(e) => warn!(cache = %name, error = %e, "watch failed"),
                }
            }
            Err(e) => warn!(cache = %name, error = %e, backoff_ms = backoff.as_millis() as u64, "list failed"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RELIST_BACKOFF_MAX);
    }
}

async fn run_ingest<T: CacheObject>(
    name: Arc<str>,
    mut rx: mpsc::Receiver<Ingest<T>>,
    mut builder: IndexBuilder<T>,
    snap: Arc<ArcSwap<Snapshot<T>>>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
    listeners: Vec<ChangeListener>,
) {
    let mut coalescer: Coalescer<T> = Coalescer::default();
    let mut ticker = tokio::time::interval(INGEST_TICK);
    let publish = |builder: &IndexBuilder<T>, changes: Vec<(ChangeKind, ResourceKey)>| {
        let next = builder.freeze();
        let epoch = next.epoch;
        let synced = next.synced;
        snap.store(next);
        let _ = epoch_tx.send(epoch);
        if synced && !*synced_tx.borrow() {
            let _ = synced_tx.send(true);
        }
        for (kind, key) in changes {
            counter!("secmeta_cache_events_total", 1u64, "cache" => name.to_string(), "kind" => kind.as_str());
            for l in &listeners {
                l(kind, &key);
            }
        }
    };
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(Ingest::Applied(o)) => coalescer.push(o.key(), Delta::Applied(o)),
                    Some(Ingest::Deleted(o)) => coalescer.push(o.key(), Delta::Deleted),
                    Some(Ingest::Replace(items)) => {
                        if !coalescer.is_empty() {
                            let changes = builder.apply(coalescer.drain_ready());
                            publish(&builder, changes);
                        }
                        let changes = builder.replace(items);
                        debug!(cache = %name, changes = changes.len(), "relist applied");
                        publish(&builder, changes);
                    }
                    None => {
                        if !coalescer.is_empty() {
                            let changes = builder.apply(coalescer.drain_ready());
                            publish(&builder, changes);
                        }
                        debug!(cache = %name, "ingest channel closed");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !coalescer.is_empty() {
                    let changes = builder.apply(coalescer.drain_ready());
                    publish(&builder, changes);
                }
            }
        }
    }
}
