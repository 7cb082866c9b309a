use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use reqwest::Method;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{Node, Tree};
use crate::error::Error;

impl Tree {
    /// Opens the node's content as an async reader. The caller drives the
    /// stream; dropping it cancels the transfer.
    pub async fn download(
        &self,
        node: &Arc<Node>,
    ) -> Result<impl AsyncRead + Send + Unpin, Error> {
        if node.is_dir() {
            return Err(Error::PathIsFolder);
        }
        let url = self.drive.content_url(&format!("nodes/{}/content", node.id()))?;
        let response = self
            .drive
            .execute(self.drive.request(Method::GET, url))
            .await?;
        Ok(Box::pin(StreamReader::new(
            response.bytes_stream().map_err(std::io::Error::other),
        )))
    }

    /// Downloads the node's content to `target`, writing through a
    /// `.partial` sibling that is renamed into place only after the bytes
    /// are on disk and, when the server advertised an MD5, verified.
    pub async fn download_to_path(&self, node: &Arc<Node>, target: &Path) -> Result<(), Error> {
        if node.is_dir() {
            return Err(Error::PathIsFolder);
        }
        let expected_md5 = node
            .content_properties()
            .map(|content| content.md5)
            .filter(|md5| !md5.is_empty());

        let url = self.drive.content_url(&format!("nodes/{}/content", node.id()))?;
        let response = self
            .drive
            .execute(self.drive.request(Method::GET, url))
            .await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::CreateFile {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|err| Error::CreateFile {
                path: partial.clone(),
                source: err,
            })?;

        let mut stream = response.bytes_stream();
        let mut md5 = expected_md5.as_ref().map(|_| md5::Context::new());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(acd_core::Error::from)?;
            file.write_all(&chunk).await.map_err(|err| Error::CreateFile {
                path: partial.clone(),
                source: err,
            })?;
            if let Some(ctx) = md5.as_mut() {
                ctx.consume(&chunk);
            }
        }
        file.flush().await.map_err(|err| Error::CreateFile {
            path: partial.clone(),
            source: err,
        })?;
        file.sync_all().await.map_err(|err| Error::CreateFile {
            path: partial.clone(),
            source: err,
        })?;
        drop(file);

        if let Some(expected) = expected_md5 {
            let expected = expected.to_ascii_lowercase();
            let actual = format!("{:x}", md5.expect("md5 initialized").compute());
            if actual != expected {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(Error::DownloadIntegrity { expected, actual });
            }
        }

        tokio::fs::rename(&partial, target)
            .await
            .map_err(|err| Error::CreateFile {
                path: target.to_path_buf(),
                source: err,
            })?;
        debug!(id = %node.id(), target = ?target, "downloaded node content");
        Ok(())
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
