//! Storage backend abstraction for the pipeline's object store.
//!
//! This module defines the storage contract the pipeline consumes:
//! whole-object reads and writes, prefix listing, and a stream of
//! object-creation notifications that drives the event router.
//!
//! ## Delivery Semantics
//!
//! Creation notifications are **at-least-once**: consumers must tolerate
//! duplicate deliveries for the same key. The pipeline absorbs duplicates
//! through per-definition concurrency ceilings and idempotent sink writes, so
//! no deduplication happens at this layer.
//!
//! Objects are never rewritten in place by pipeline jobs; each stage writes a
//! new key, so every notification corresponds to a distinct logical deposit.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Buffered creation events per subscriber before lagging kicks in.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object key (raw string; parse with `ObjectKey` for pipeline keys).
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Content hash, stable across identical re-deposits.
    pub etag: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A creation notification emitted when an object is written.
///
/// The key is deliberately the raw string form: object stores emit
/// notifications for everything under their roots, including objects outside
/// the pipeline's key convention, and it is the router's job to decide which
/// ones matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCreated {
    /// Key of the created object.
    pub key: String,
    /// Size of the created object in bytes.
    pub size: u64,
    /// Content hash of the created object.
    pub etag: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ObjectCreated {
    fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            key: meta.key.clone(),
            size: meta.size,
            etag: meta.etag.clone(),
            created_at: meta.created_at,
        }
    }
}

/// Storage backend trait for the pipeline's object store.
///
/// Backends are whole-object: pipeline stages read their input fully and
/// write their output fully (CSV deposits are small relative to memory).
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Writes an object and returns its metadata.
    ///
    /// Emits one creation notification to every subscriber.
    async fn put(&self, key: &str, data: Bytes) -> Result<ObjectMeta>;

    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Returns an empty vec if no objects match.
    ///
    /// **Ordering**: results are returned in arbitrary order that may vary
    /// between backends and invocations. Callers requiring deterministic
    /// order should sort the results.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Subscribes to creation notifications.
    ///
    /// Each subscriber receives every notification emitted after the call.
    /// Slow subscribers may observe `RecvError::Lagged` and must treat it as
    /// missed deliveries, not an error in the stream itself.
    fn subscribe(&self) -> broadcast::Receiver<ObjectCreated>;
}

/// In-memory storage backend.
///
/// Thread-safe via `RwLock`; used by tests and the single-process service
/// wiring. Etags are SHA-256 content hashes so identical re-deposits carry
/// identical etags.
#[derive(Debug)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    events: broadcast::Sender<ObjectCreated>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    created_at: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: self.data.len() as u64,
            etag: self.etag.clone(),
            created_at: self.created_at,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_objects()?.len())
    }

    /// Whether the backend holds no objects.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read_objects()?.is_empty())
    }

    fn read_objects(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, StoredObject>>> {
        self.objects.read().map_err(|_| Error::Internal {
            message: "storage lock poisoned".into(),
        })
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<ObjectMeta> {
        let etag = format!("{:x}", Sha256::digest(&data));
        let object = StoredObject {
            data,
            etag,
            created_at: Utc::now(),
        };
        let meta = object.meta(key);

        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "storage lock poisoned".into(),
        })?;
        objects.insert(key.to_string(), object);
        drop(objects);

        // No subscribers is fine; the send result only reports receiver count.
        let _ = self.events.send(ObjectCreated::from_meta(&meta));
        Ok(meta)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.read_objects()?
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {key}")))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.read_objects()?.get(key).map(|o| o.meta(key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "storage lock poisoned".into(),
            })?
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .read_objects()?
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| object.meta(key))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectCreated> {
        self.events.subscribe()
    }
}
