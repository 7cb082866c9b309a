use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use acd_core::{AccountInfo, AccountQuota, AccountUsage, ClientOptions, DriveClient};

use crate::config::Config;
use crate::error::Error;
use crate::node::{Node, NodeRecord, Properties, Tree};
use crate::trash;

const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

type OwnedProperties = BTreeMap<String, Properties>;

/// Amazon Cloud Drive client: configuration, HTTP executor, the cached node
/// tree, and the background workers that keep all of it fresh. Construct
/// with [`Client::new`] or [`Client::connect`]; call [`Client::close`] for a
/// clean shutdown that persists the cache.
pub struct Client {
    config: Config,
    drive: DriveClient,
    tree: Arc<Tree>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Client {
    pub async fn new(config_file: impl AsRef<Path>) -> Result<Self, Error> {
        Self::connect(Config::load(config_file)?).await
    }

    pub async fn connect(config: Config) -> Result<Self, Error> {
        Self::connect_with_urls(config, acd_core::ENDPOINT_URL, acd_core::TOKEN_URL).await
    }

    pub async fn connect_with_urls(
        config: Config,
        endpoint_url: &str,
        token_url: &str,
    ) -> Result<Self, Error> {
        config.validate()?;
        let options = ClientOptions {
            headers: config.headers.clone(),
            user_agent: (!config.user_agent.is_empty()).then(|| config.user_agent.clone()),
            timeout: config.timeout()?,
            app_name: config.app_name.clone(),
            app_version: config.app_version.clone(),
            refresh_token: (!config.refresh_token.is_empty())
                .then(|| config.refresh_token.clone()),
        };
        let drive = DriveClient::connect_with_urls(endpoint_url, token_url, options).await?;
        let tree = Arc::new(
            Tree::open(
                drive.clone(),
                config.cache_file.clone(),
                config.sync_chunk_size,
            )
            .await?,
        );

        let shutdown = CancellationToken::new();
        let mut workers = Vec::new();
        workers.push(spawn_sync_worker(
            tree.clone(),
            config.sync_interval()?,
            shutdown.clone(),
        ));
        if let Some(interval) = config.purge_trash_interval()? {
            workers.push(spawn_purge_worker(drive.clone(), interval, shutdown.clone()));
        }
        if !config.refresh_token.is_empty() {
            workers.push(spawn_token_worker(drive.clone(), shutdown.clone()));
        }

        Ok(Self {
            config,
            drive,
            tree,
            shutdown,
            workers,
        })
    }

    /// Stops the background workers and persists the cache. In-flight user
    /// operations are not interrupted; workers drain at their next tick.
    pub async fn close(mut self) -> Result<(), Error> {
        self.shutdown.cancel();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        self.tree.save_cache().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn drive(&self) -> &DriveClient {
        &self.drive
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn find_node(&self, path: &str) -> Result<Arc<Node>, Error> {
        self.tree.find_node(path)
    }

    pub fn find_by_id(&self, id: &str) -> Result<Arc<Node>, Error> {
        self.tree.find_by_id(id)
    }

    /// The children of the folder at `path`, sorted by name.
    pub fn list(&self, path: &str) -> Result<Vec<Arc<Node>>, Error> {
        let node = self.tree.find_node(path)?;
        if !node.is_dir() {
            return Err(Error::PathIsNotFolder);
        }
        let mut children = node.children_snapshot();
        children.sort_by_key(|child| child.name().to_lowercase());
        Ok(children)
    }

    pub async fn mkdir_all(&self, path: &str) -> Result<Arc<Node>, Error> {
        self.tree.mkdir_all(path).await
    }

    pub async fn remove(&self, node: &Arc<Node>) -> Result<(), Error> {
        self.tree.remove(node).await
    }

    /// Uploads `reader` to the remote `path`, creating missing parent
    /// folders. An existing file is replaced only when `overwrite` is set.
    pub async fn upload<R>(
        &self,
        path: &str,
        overwrite: bool,
        labels: Vec<String>,
        properties: Option<Properties>,
        reader: R,
    ) -> Result<Arc<Node>, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (dir, name) = split_path(path);
        let parent = self.tree.mkdir_all(&dir).await?;
        match self.tree.find_node(path) {
            Ok(existing) => {
                if !overwrite {
                    return Err(Error::FileExists);
                }
                if existing.is_dir() {
                    return Err(Error::FileExistsAndIsFolder);
                }
                self.tree
                    .overwrite(&existing, labels, self.owned_properties(properties), reader)
                    .await?;
                Ok(existing)
            }
            Err(Error::NodeNotFound) => {
                self.tree
                    .upload(
                        &parent,
                        &name,
                        labels,
                        self.owned_properties(properties),
                        reader,
                    )
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Uploads a local directory under `remote_dir`. Files whose MD5
    /// matches the remote copy are skipped; differing files require
    /// `overwrite`; empty files are ignored.
    pub async fn upload_dir(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        recursive: bool,
        overwrite: bool,
        labels: Vec<String>,
        properties: Option<Properties>,
    ) -> Result<(), Error> {
        let remote_base = format!("/{}", trimmed(remote_dir));
        let mut pending = vec![(local_dir.to_path_buf(), remote_base)];
        while let Some((local, remote)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&local)
                .await
                .map_err(|err| Error::OpenFile {
                    path: local.clone(),
                    source: err,
                })?;
            while let Some(entry) = entries.next_entry().await.map_err(|err| Error::StatFile {
                path: local.clone(),
                source: err,
            })? {
                let entry_path = entry.path();
                let entry_name = entry.file_name().to_string_lossy().into_owned();
                let file_type = entry.file_type().await.map_err(|err| Error::StatFile {
                    path: entry_path.clone(),
                    source: err,
                })?;
                if file_type.is_dir() {
                    if recursive {
                        pending.push((entry_path, format!("{remote}/{entry_name}")));
                    } else {
                        debug!(path = ?entry_path, "not recursing into sub-folder");
                    }
                    continue;
                }
                let remote_file = format!("{remote}/{entry_name}");
                info!(local = ?entry_path, remote = %remote_file, "uploading");
                self.upload_local_file(
                    &entry_path,
                    &remote_file,
                    overwrite,
                    labels.clone(),
                    properties.clone(),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn upload_local_file(
        &self,
        local: &Path,
        remote: &str,
        overwrite: bool,
        labels: Vec<String>,
        properties: Option<Properties>,
    ) -> Result<(), Error> {
        let (dir, name) = split_path(remote);
        let parent = self.tree.mkdir_all(&dir).await?;
        match self.tree.find_node(remote) {
            Ok(existing) => {
                if existing.is_dir() {
                    return Err(Error::FileExistsAndIsFolder);
                }
                let local_md5 = file_md5(local).await?;
                let remote_md5 = existing
                    .content_properties()
                    .map(|content| content.md5.to_ascii_lowercase());
                if remote_md5.as_deref() == Some(local_md5.as_str()) {
                    debug!(remote = %remote, "contents already match, skipping");
                    return Ok(());
                }
                if !overwrite {
                    return Err(Error::FileExistsWithDifferentContents);
                }
                let file = open_for_upload(local).await?;
                self.tree
                    .overwrite(&existing, labels, self.owned_properties(properties), file)
                    .await
            }
            Err(Error::NodeNotFound) => {
                let file = open_for_upload(local).await?;
                match self
                    .tree
                    .upload(
                        &parent,
                        &name,
                        labels,
                        self.owned_properties(properties),
                        file,
                    )
                    .await
                {
                    Ok(_) => Ok(()),
                    // Empty local files have nothing to create remotely.
                    Err(Error::NoContentsToUpload) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn download(
        &self,
        node: &Arc<Node>,
    ) -> Result<impl AsyncRead + Send + Unpin, Error> {
        self.tree.download(node).await
    }

    pub async fn download_to_path(&self, node: &Arc<Node>, target: &Path) -> Result<(), Error> {
        self.tree.download_to_path(node, target).await
    }

    pub async fn get_trash(&self) -> Result<Vec<NodeRecord>, Error> {
        trash::list_trash(&self.drive).await
    }

    pub async fn purge_nodes(&self, node_ids: &[String]) -> Result<(), Error> {
        trash::purge_nodes(&self.drive, node_ids).await
    }

    pub async fn purge_trash(&self) -> Result<(), Error> {
        trash::purge_trash(&self.drive).await
    }

    pub async fn account_info(&self) -> Result<AccountInfo, Error> {
        Ok(self.drive.account_info().await?)
    }

    pub async fn account_quota(&self) -> Result<AccountQuota, Error> {
        Ok(self.drive.account_quota().await?)
    }

    pub async fn account_usage(&self) -> Result<AccountUsage, Error> {
        Ok(self.drive.account_usage().await?)
    }

    pub async fn refresh_access_token(&self) -> Result<String, Error> {
        Ok(self.drive.refresh_access_token().await?)
    }

    fn owned_properties(&self, properties: Option<Properties>) -> Option<OwnedProperties> {
        properties
            .map(|properties| BTreeMap::from([(self.config.app_name.clone(), properties)]))
    }
}

fn spawn_sync_worker(
    tree: Arc<Tree>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => {
                    debug!("background sync starting");
                    match tree.sync().await {
                        Ok(()) => {}
                        Err(Error::MustFetchFresh) => {
                            info!("the checkpoint went stale, rebuilding the tree");
                            if let Err(err) = refetch(&tree).await {
                                error!(error = %err, "rebuilding the tree failed");
                            }
                        }
                        Err(err) => error!(error = %err, "background sync failed"),
                    }
                    debug!("background sync completed");
                }
            }
        }
    })
}

async fn refetch(tree: &Tree) -> Result<(), Error> {
    tree.fetch_fresh().await?;
    tree.sync().await
}

fn spawn_purge_worker(
    drive: DriveClient,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => {
                    if let Err(err) = trash::purge_trash(&drive).await {
                        error!(error = %err, "background trash purge failed");
                    }
                }
            }
        }
    })
}

fn spawn_token_worker(drive: DriveClient, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(TOKEN_REFRESH_INTERVAL) => {
                    if let Err(err) = drive.refresh_access_token().await {
                        warn!(error = %err, "access token refresh failed");
                    }
                }
            }
        }
    })
}

/// Splits a remote path into its folder and basename, like `path.Dir` and
/// `path.Base` over forward slashes.
fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

fn trimmed(path: &str) -> &str {
    path.trim_matches('/')
}

async fn open_for_upload(path: &Path) -> Result<tokio::fs::File, Error> {
    tokio::fs::File::open(path)
        .await
        .map_err(|err| Error::OpenFile {
            path: path.to_path_buf(),
            source: err,
        })
}

async fn file_md5(path: &Path) -> Result<String, Error> {
    let mut file = open_for_upload(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await.map_err(|err| Error::OpenFile {
            path: path.to_path_buf(),
            source: err,
        })?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_separates_folder_and_basename() {
        let cases = [
            ("/a/file.bin", "/a", "file.bin"),
            ("/file.bin", "/", "file.bin"),
            ("file.bin", "/", "file.bin"),
            ("/a/b/c/", "/a/b", "c"),
        ];
        for (input, dir, name) in cases {
            assert_eq!(split_path(input), (dir.to_string(), name.to_string()), "{input}");
        }
    }

    #[tokio::test]
    async fn file_md5_matches_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            file_md5(&path).await.unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }
}
