use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use reqwest::Method;
use time::OffsetDateTime;
use tracing::{debug, warn};

use acd_core::DriveClient;

use super::Node;
use crate::error::Error;

/// Local mirror of the remote namespace: the root node plus a flat id→node
/// index. Lookups take the read lock; mutations take the write lock. Child
/// maps are guarded per node, so siblings do not serialize through the tree
/// lock.
pub struct Tree {
    pub(crate) drive: DriveClient,
    pub(crate) cache_file: PathBuf,
    pub(crate) chunk_size: u32,
    pub(crate) root: RwLock<Option<Arc<Node>>>,
    pub(crate) index: RwLock<HashMap<String, Arc<Node>>>,
    pub(crate) checkpoint: RwLock<String>,
    pub(crate) last_updated: RwLock<OffsetDateTime>,
}

impl Tree {
    /// An empty tree bound to a client and a cache path. Use [`Tree::open`]
    /// to get a populated, synced tree.
    pub fn new(drive: DriveClient, cache_file: PathBuf, chunk_size: u32) -> Self {
        Self {
            drive,
            cache_file,
            chunk_size,
            root: RwLock::new(None),
            index: RwLock::new(HashMap::new()),
            checkpoint: RwLock::new(String::new()),
            last_updated: RwLock::new(OffsetDateTime::UNIX_EPOCH),
        }
    }

    /// Loads the cache (falling back to a full fetch when it is missing or
    /// unreadable) and brings the tree up to date with the change stream.
    pub async fn open(
        drive: DriveClient,
        cache_file: PathBuf,
        chunk_size: u32,
    ) -> Result<Self, Error> {
        let tree = Self::new(drive, cache_file, chunk_size);
        if let Err(err) = tree.load_cache().await {
            debug!(error = %err, "cache unavailable, fetching the full node list");
            tree.fetch_fresh().await?;
        }
        match tree.sync().await {
            Ok(()) => {}
            Err(Error::MustFetchFresh) => {
                tree.fetch_fresh().await?;
                tree.sync().await?;
            }
            Err(err) => return Err(err),
        }
        Ok(tree)
    }

    pub fn root_node(&self) -> Result<Arc<Node>, Error> {
        self.root
            .read()
            .expect("tree lock poisoned")
            .clone()
            .ok_or(Error::NodeNotFound)
    }

    pub fn checkpoint(&self) -> String {
        self.checkpoint
            .read()
            .expect("tree lock poisoned")
            .clone()
    }

    pub fn last_updated(&self) -> OffsetDateTime {
        *self.last_updated.read().expect("tree lock poisoned")
    }

    /// Resolves a slash-separated path. Lookup is case-insensitive, repeated
    /// slashes collapse, and leading/trailing slashes are optional; the
    /// empty path is the root.
    pub fn find_node(&self, path: &str) -> Result<Arc<Node>, Error> {
        let mut node = self.root_node()?;
        for segment in path_segments(path) {
            node = match node.child(segment) {
                Some(child) => child,
                None => {
                    debug!(%path, "node not found");
                    return Err(Error::NodeNotFound);
                }
            };
        }
        Ok(node)
    }

    pub fn find_by_id(&self, id: &str) -> Result<Arc<Node>, Error> {
        self.index
            .read()
            .expect("tree lock poisoned")
            .get(id)
            .cloned()
            .ok_or(Error::NodeNotFound)
    }

    /// Creates the folder at `path` together with any missing parents and
    /// returns it. An existing folder is returned as-is; an existing
    /// non-folder is an error.
    pub async fn mkdir_all(&self, path: &str) -> Result<Arc<Node>, Error> {
        match self.find_node(path) {
            Ok(node) if node.is_dir() => return Ok(node),
            Ok(_) => return Err(Error::FileExistsAndIsNotFolder),
            Err(Error::NodeNotFound) => {}
            Err(err) => return Err(err),
        }

        let segments: Vec<&str> = path_segments(path).collect();
        if segments.is_empty() {
            return Err(Error::CannotCreateRootNode);
        }

        let mut folder = self.root_node()?;
        let mut prefix = String::new();
        for segment in segments {
            prefix.push('/');
            prefix.push_str(segment);
            let next = match self.find_node(&prefix) {
                Ok(node) => node,
                Err(Error::NodeNotFound) => {
                    self.create_folder(&folder, segment, Vec::new(), None).await?
                }
                Err(err) => return Err(err),
            };
            if !next.is_dir() {
                return Err(Error::CannotCreateNodeUnderAFile);
            }
            folder = next;
        }
        Ok(folder)
    }

    /// Moves the node to the server-side trash and detaches it locally.
    /// Descendants stay in the index; the change stream delivers their own
    /// trash deltas.
    pub async fn remove(&self, node: &Arc<Node>) -> Result<(), Error> {
        let url = self.drive.metadata_url(&format!("trash/{}", node.id()))?;
        self.drive
            .execute(self.drive.request(Method::PUT, url))
            .await?;
        self.detach(node);
        Ok(())
    }

    pub(crate) fn insert(&self, node: Arc<Node>) {
        self.index
            .write()
            .expect("tree lock poisoned")
            .insert(node.id().to_string(), node);
    }

    pub(crate) fn detach(&self, node: &Node) {
        for parent_id in node.parents() {
            let parent = self
                .index
                .read()
                .expect("tree lock poisoned")
                .get(&parent_id)
                .cloned();
            match parent {
                Some(parent) => parent.remove_child(node),
                None => debug!(parent_id = %parent_id, "parent not in index, nothing to detach"),
            }
        }
        self.index
            .write()
            .expect("tree lock poisoned")
            .remove(node.id());
    }

    /// Re-derives every parent/child link from the parent ids in the index
    /// and re-discovers the root. Children are derived state; this is the
    /// authoritative way to rebuild them.
    pub(crate) fn relink_all(&self) {
        let nodes: Vec<Arc<Node>> = self
            .index
            .read()
            .expect("tree lock poisoned")
            .values()
            .cloned()
            .collect();
        for node in &nodes {
            if node.is_root() {
                *self.root.write().expect("tree lock poisoned") = Some(node.clone());
            }
        }
        let index = self.index.read().expect("tree lock poisoned");
        for node in nodes {
            for parent_id in node.parents() {
                if let Some(parent) = index.get(&parent_id) {
                    parent.add_child(node.clone());
                }
            }
        }
    }

    /// Rebuilds the id index by walking the tree from the root, dropping
    /// anything unreachable. Mandatory after a cache load.
    pub(crate) fn build_index(&self) {
        let root = self.root.read().expect("tree lock poisoned").clone();
        let Some(root) = root else {
            warn!("no root node, leaving the index untouched");
            return;
        };
        let mut fresh: HashMap<String, Arc<Node>> = HashMap::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if fresh.insert(node.id().to_string(), node.clone()).is_none() {
                stack.extend(node.children_snapshot());
            }
        }
        *self.index.write().expect("tree lock poisoned") = fresh;
    }

    pub(crate) fn node_count(&self) -> usize {
        self.index.read().expect("tree lock poisoned").len()
    }

    pub(crate) fn index_snapshot(&self) -> Vec<Arc<Node>> {
        self.index
            .read()
            .expect("tree lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}
