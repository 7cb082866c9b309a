use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::BytesMut;
use futures::SinkExt;
use reqwest::Method;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tracing::{debug, error};
use url::Url;

use super::{Node, NodeRecord, Properties, Tree};
use crate::error::Error;

const PIPE_DEPTH: usize = 8;
const CHUNK_SIZE: usize = 64 * 1024;

pub type OwnedProperties = BTreeMap<String, Properties>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewNodeBody<'a> {
    name: &'a str,
    kind: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    labels: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<OwnedProperties>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchNodeBody {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<OwnedProperties>,
}

impl Tree {
    /// Creates a folder under `parent` and splices it into the tree without
    /// waiting for the next sync.
    pub async fn create_folder(
        &self,
        parent: &Arc<Node>,
        name: &str,
        labels: Vec<String>,
        properties: Option<OwnedProperties>,
    ) -> Result<Arc<Node>, Error> {
        let body = NewNodeBody {
            name,
            kind: "FOLDER",
            labels,
            parents: vec![parent.id().to_string()],
            properties,
        };
        let url = self.drive.metadata_url("nodes")?;
        let response = self
            .drive
            .execute(self.drive.request(Method::POST, url).json(&body))
            .await?;
        let record = response
            .json::<NodeRecord>()
            .await
            .map_err(acd_core::Error::from)?;

        debug!(id = %record.id, name = %record.name, "created folder");
        let node = Arc::new(Node::from_record(record));
        self.insert(node.clone());
        parent.add_child(node.clone());
        Ok(node)
    }

    /// Streams `reader` as a new file named `name` under `parent`. The
    /// request body never buffers the whole content; see
    /// [`Tree::upload_multipart`].
    pub async fn upload<R>(
        &self,
        parent: &Arc<Node>,
        name: &str,
        labels: Vec<String>,
        properties: Option<OwnedProperties>,
        reader: R,
    ) -> Result<Arc<Node>, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let metadata = NewNodeBody {
            name,
            kind: "FILE",
            labels,
            parents: vec![parent.id().to_string()],
            properties,
        };
        let metadata_json = serde_json::to_string(&metadata).map_err(Error::JsonEncode)?;
        let url = self.drive.content_url("nodes?suppress=deduplication")?;
        let record = self
            .upload_multipart(Method::POST, url, Some(metadata_json), name, reader)
            .await?;

        let node = Arc::new(Node::from_record(record));
        self.insert(node.clone());
        parent.add_child(node.clone());
        Ok(node)
    }

    /// Replaces the contents of an existing file, then patches labels and
    /// properties when any were given. The node's children survive both
    /// record updates.
    pub async fn overwrite<R>(
        &self,
        node: &Arc<Node>,
        labels: Vec<String>,
        properties: Option<OwnedProperties>,
        reader: R,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let url = self.drive.content_url(&format!("nodes/{}/content", node.id()))?;
        let record = self
            .upload_multipart(Method::PUT, url, None, &node.name(), reader)
            .await?;
        node.update_record(record);

        if !labels.is_empty() || properties.is_some() {
            self.patch_metadata(node, labels, properties).await?;
        }
        Ok(())
    }

    pub(crate) async fn patch_metadata(
        &self,
        node: &Arc<Node>,
        labels: Vec<String>,
        properties: Option<OwnedProperties>,
    ) -> Result<(), Error> {
        let body = PatchNodeBody { labels, properties };
        let url = self.drive.content_url(&format!("nodes/{}", node.id()))?;
        let response = self
            .drive
            .execute(self.drive.request(Method::PATCH, url).json(&body))
            .await?;
        let record = response
            .json::<NodeRecord>()
            .await
            .map_err(acd_core::Error::from)?;
        node.update_record(record);
        Ok(())
    }

    /// The streaming pipeline: a producer task reads the source into a
    /// bounded pipe while the consumer streams it out as the `content` part
    /// of a multipart request. The rendezvous carries the producer's first
    /// read: the request is not issued until the source has proven
    /// non-empty, and an empty source aborts with `NoContentsToUpload`
    /// before any bytes leave the client. A producer failure is pushed into
    /// the pipe so the in-flight request aborts; a consumer failure closes
    /// the pipe so the producer stops. Both outcomes meet below, where the
    /// producer's error takes precedence as the root cause.
    async fn upload_multipart<R>(
        &self,
        method: Method,
        url: Url,
        metadata_json: Option<String>,
        name: &str,
        mut reader: R,
    ) -> Result<NodeRecord, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (mut body_tx, body_rx) =
            futures::channel::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(PIPE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel::<bool>();

        let producer = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            let mut sent: u64 = 0;
            loop {
                let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
                match reader.read_buf(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        sent += n as u64;
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(true);
                        }
                        if body_tx.send(Ok(chunk.freeze())).await.is_err() {
                            // Consumer dropped its end; its error wins below.
                            return Ok(sent);
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "reading the upload source failed");
                        let _ = body_tx
                            .send(Err(std::io::Error::new(err.kind(), err.to_string())))
                            .await;
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(false);
                        }
                        return Err(Error::ReadContents(err));
                    }
                }
            }
            if sent == 0 {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(false);
                }
                return Err(Error::NoContentsToUpload);
            }
            Ok(sent)
        });

        let response = if ready_rx.await.unwrap_or(false) {
            let mut form = reqwest::multipart::Form::new();
            if let Some(metadata_json) = metadata_json {
                form = form.text("metadata", metadata_json);
            }
            let content = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(body_rx))
                .file_name(name.to_string())
                .mime_str("application/octet-stream")
                .map_err(acd_core::Error::from)?;
            form = form.part("content", content);
            Some(
                self.drive
                    .execute(self.drive.request(method, url).multipart(form))
                    .await,
            )
        } else {
            // Dropping the pipe's read end here unblocks a producer stuck on
            // a full pipe.
            None
        };

        let produced = producer.await.map_err(|_| Error::UploadInterrupted)?;
        produced?;
        let response = response.ok_or(Error::UploadInterrupted)??;
        let record = response
            .json::<NodeRecord>()
            .await
            .map_err(acd_core::Error::from)?;
        Ok(record)
    }
}
