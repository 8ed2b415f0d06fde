//! Persistent cache of peers confirmed usable for a topic.
//!
//! The cache warm-starts topic searches across restarts: whenever the P2P
//! server confirms a connection to a discovered peer, its address record is
//! persisted under `(topic, node id)`, and a fresh search seeds its found
//! channel from here before the discovery engine produces anything.
//!
//! The store is advisory. Losing any entry degrades warm-start quality but
//! never affects pool correctness, so load failures fall back to an empty
//! cache and write failures are surfaced to the caller to log and ignore.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bincode::Options;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::identity::{Identity, NodeRecord, Topic};

/// Upper bound on records kept per topic. Far above any realistic connection
/// limit; bounds file growth when topics churn through many peers.
const MAX_CACHED_PEERS_PER_TOPIC: usize = 256;

/// Upper bound for deserializing the cache file.
/// SECURITY: bounds allocation when reading a damaged or foreign file.
const MAX_CACHE_FILE_SIZE: u64 = 16 * 1024 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_CACHE_FILE_SIZE)
        .with_fixint_encoding()
}

fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("peer cache storage unavailable: {0}")]
    StorageUnavailable(#[from] std::io::Error),
    #[error("peer cache record encoding failed: {0}")]
    Codec(#[from] bincode::Error),
}

/// Storage key: little-endian length-prefixed topic, then the fixed-width
/// node id. Keeps all records of one topic contiguous in key order.
fn record_key(topic: &Topic, id: &Identity) -> Vec<u8> {
    let mut key = topic_prefix(topic);
    key.extend_from_slice(id.as_bytes());
    key
}

fn topic_prefix(topic: &Topic) -> Vec<u8> {
    let name = topic.as_bytes();
    let mut prefix = Vec::with_capacity(4 + name.len() + 32);
    prefix.extend_from_slice(&(name.len() as u32).to_le_bytes());
    prefix.extend_from_slice(name);
    prefix
}

struct CacheInner {
    path: PathBuf,
    records: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// Persistent map `(topic, node id) -> NodeRecord`, safe for concurrent
/// callers. Every mutation rewrites the backing file atomically.
pub struct PeerCache {
    inner: Mutex<CacheInner>,
}

impl PeerCache {
    /// Open a cache backed by `path`. A missing file yields an empty cache;
    /// an unreadable or damaged file is logged and treated as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read(&path).await {
            Ok(bytes) => match deserialize_bounded(&bytes) {
                Ok(records) => records,
                Err(error) => {
                    warn!(%error, path = %path.display(), "peer cache file damaged, starting empty");
                    BTreeMap::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                warn!(%error, path = %path.display(), "peer cache unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            inner: Mutex::new(CacheInner { path, records }),
        }
    }

    /// Record a peer as viable for `topic`. Last write wins on duplicates.
    pub async fn add_peer(&self, node: &NodeRecord, topic: &Topic) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;
        let key = record_key(topic, &node.id);
        let value = bincode::serialize(node)?;
        inner.records.insert(key.clone(), value);

        // Enforce the per-topic ceiling, keeping the record just written.
        let prefix = topic_prefix(topic);
        while count_prefix(&inner.records, &prefix) > MAX_CACHED_PEERS_PER_TOPIC {
            let evict = inner
                .records
                .range(prefix.clone()..)
                .map(|(k, _)| k.clone())
                .find(|k| k.starts_with(&prefix) && *k != key);
            match evict {
                Some(k) => {
                    inner.records.remove(&k);
                }
                None => break,
            }
        }

        persist(&inner).await
    }

    /// Forget a peer for `topic`. Missing entries are not an error.
    pub async fn remove_peer(&self, id: &Identity, topic: &Topic) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;
        if inner.records.remove(&record_key(topic, id)).is_none() {
            return Ok(());
        }
        persist(&inner).await
    }

    /// Up to `limit` cached records for `topic`, in stable key order.
    /// Records that no longer decode are skipped.
    pub async fn peers_for_topic(&self, topic: &Topic, limit: usize) -> Vec<NodeRecord> {
        let inner = self.inner.lock().await;
        let prefix = topic_prefix(topic);
        inner
            .records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(_, v)| match deserialize_bounded::<NodeRecord>(v) {
                Ok(node) => Some(node),
                Err(error) => {
                    warn!(%error, topic = %topic, "skipping undecodable cache record");
                    None
                }
            })
            .take(limit)
            .collect()
    }
}

fn count_prefix(records: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> usize {
    records
        .range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .count()
}

/// Write the record map to a temp file and rename it over the target, so a
/// crash mid-write leaves the previous file intact.
async fn persist(inner: &CacheInner) -> Result<(), CacheError> {
    let bytes = bincode::serialize(&inner.records)?;
    let tmp = inner.path.with_extension("tmp");
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, &inner.path).await?;
    Ok(())
}
