//! secmeta store: the resource-store seam and the in-memory resource cache.
//!
//! A [`ResourceStore`] is anything that can list a collection and stream changes
//! from a resource version. [`ResourceCache`] mirrors one collection in memory,
//! publishes immutable snapshots for readers and tells listeners what changed
//! after each snapshot swap.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use secmeta_core::{Labels, ResourceKey};

mod cache;
pub mod memory;

pub use cache::{CacheBuilder, CacheTask, ChangeListener, Coalescer, Delta, IndexBuilder, Indexer, NeedsUpdate, ResourceCache, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("resource version too old: {0}")]
    Gone(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("store closed")]
    Closed,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A full listing and the version to resume watching from.
#[derive(Debug, Clone)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub resource_version: String,
}

/// One change on a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker carrying a newer resource version.
    Bookmark(String),
}

pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>>>;

/// List/watch/get access to one collection.
#[async_trait::async_trait]
pub trait ResourceStore<T>: Send + Sync + 'static {
    async fn list(&self) -> Result<Listing<T>>;
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<T>>;
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<T>>;
}

/// Writes labels and annotations onto an existing object.
///
/// Keys not mentioned in `labels`/`annotations` are left untouched; the maps are
/// merged into the object's metadata.
#[async_trait::async_trait]
pub trait MetadataPatcher: Send + Sync {
    async fn patch_metadata(&self, key: &ResourceKey, labels: &Labels, annotations: &Labels) -> Result<()>;
}
