use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error};

use super::{Node, NodeRecord, Tree};
use crate::error::Error;

/// On-disk snapshot of the tree. Children are not persisted; they are
/// derived from the parent ids when the snapshot is loaded.
#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    checkpoint: String,
    #[serde(with = "time::serde::rfc3339")]
    last_updated: OffsetDateTime,
    nodes: Vec<NodeRecord>,
}

impl Tree {
    /// Loads the cache file and rebuilds the tree from it. Any failure
    /// (missing file, unreadable snapshot) comes back as
    /// [`Error::LoadingCache`] so the caller can fall back to a full fetch.
    pub async fn load_cache(&self) -> Result<(), Error> {
        let bytes = match tokio::fs::read(&self.cache_file).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = ?self.cache_file, error = %err, "cache file is not readable");
                return Err(Error::LoadingCache);
            }
        };
        let snapshot: CacheSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(path = ?self.cache_file, error = %err, "cache file did not decode");
                return Err(Error::LoadingCache);
            }
        };

        {
            let mut index = self.index.write().expect("tree lock poisoned");
            index.clear();
            for record in snapshot.nodes {
                let node = Arc::new(Node::from_record(record));
                index.insert(node.id().to_string(), node);
            }
        }
        *self.checkpoint.write().expect("tree lock poisoned") = snapshot.checkpoint;
        *self.last_updated.write().expect("tree lock poisoned") = snapshot.last_updated;

        self.relink_all();
        self.build_index();
        debug!(path = ?self.cache_file, nodes = self.node_count(), "loaded the node cache");
        Ok(())
    }

    /// Rewrites the cache file with the current tree. Called after every
    /// successful sync and on clean shutdown.
    pub async fn save_cache(&self) -> Result<(), Error> {
        let snapshot = CacheSnapshot {
            checkpoint: self.checkpoint(),
            last_updated: self.last_updated(),
            nodes: self
                .index_snapshot()
                .into_iter()
                .map(|node| node.record())
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot).map_err(Error::CacheEncode)?;
        tokio::fs::write(&self.cache_file, bytes)
            .await
            .map_err(|err| {
                error!(path = ?self.cache_file, error = %err, "writing the cache file failed");
                Error::CreateFile {
                    path: self.cache_file.clone(),
                    source: err,
                }
            })?;
        debug!(path = ?self.cache_file, "saved the node cache");
        Ok(())
    }
}
