use std::sync::Arc;

use futures::TryStreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{Node, NodeRecord, Tree};
use crate::error::Error;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangesRequest<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    checkpoint: &'a str,
    chunk_size: u32,
}

/// One line of the change stream. `status_code` is sent by the server but
/// carries nothing the client acts on.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChangesPage {
    checkpoint: String,
    nodes: Vec<NodeRecord>,
    status_code: Option<i64>,
    reset: bool,
    end: bool,
}

impl Tree {
    /// Folds the server's change stream into the tree, advancing the
    /// checkpoint line by line and persisting the cache afterwards. Returns
    /// [`Error::MustFetchFresh`] when the server cannot match the
    /// checkpoint; the caller answers with [`Tree::fetch_fresh`] and syncs
    /// again.
    pub async fn sync(&self) -> Result<(), Error> {
        debug!("sync starting");
        let checkpoint = self.checkpoint();
        let request = ChangesRequest {
            checkpoint: &checkpoint,
            chunk_size: self.chunk_size,
        };
        let url = self.drive.metadata_url("changes")?;
        let response = self
            .drive
            .execute(self.drive.request(Method::POST, url).json(&request))
            .await?;
        let response_date = date_header(response.headers()).unwrap_or_else(OffsetDateTime::now_utc);

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut lines = BufReader::new(StreamReader::new(stream)).lines();
        while let Some(line) = lines.next_line().await.map_err(Error::ResponseRead)? {
            if line.trim().is_empty() {
                continue;
            }
            let page: ChangesPage = serde_json::from_str(&line).map_err(Error::JsonDecode)?;
            if page.end {
                // Nothing follows the end marker.
                break;
            }
            if page.reset {
                warn!("server could not match the checkpoint");
                return Err(Error::MustFetchFresh);
            }
            debug!(
                checkpoint = %page.checkpoint,
                nodes = page.nodes.len(),
                "applying change chunk"
            );
            self.apply_changes(page.nodes);
            *self.checkpoint.write().expect("tree lock poisoned") = page.checkpoint;
            *self.last_updated.write().expect("tree lock poisoned") = response_date;
        }

        self.relink_all();
        self.save_cache().await?;
        debug!("sync completed");
        Ok(())
    }

    /// Folds one chunk of deltas, in array order.
    pub(crate) fn apply_changes(&self, records: Vec<NodeRecord>) {
        for record in records {
            if record.is_root {
                let node = Arc::new(Node::from_record(record));
                self.insert(node.clone());
                *self.root.write().expect("tree lock poisoned") = Some(node);
                continue;
            }

            if !record.status.is_available() {
                debug!(id = %record.id, name = %record.name, "node left the namespace");
                if let Ok(existing) = self.find_by_id(&record.id) {
                    self.detach(&existing);
                }
                continue;
            }

            let existing = self.find_by_id(&record.id).ok();
            let node = Arc::new(Node::from_record(record));
            if let Some(old) = existing {
                // The server never sends children; carry the local map
                // forward, then unlink the superseded node everywhere.
                node.adopt_children_from(&old);
                for parent_id in old.parents() {
                    if let Ok(parent) = self.find_by_id(&parent_id) {
                        parent.remove_child(&old);
                    }
                }
            }
            self.insert(node.clone());
            for parent_id in node.parents() {
                self.ensure_parent(&parent_id).add_child(node.clone());
            }
        }
    }

    fn ensure_parent(&self, id: &str) -> Arc<Node> {
        if let Ok(parent) = self.find_by_id(id) {
            return parent;
        }
        debug!(parent_id = %id, "parent not yet known, creating a placeholder");
        let placeholder = Arc::new(Node::from_record(NodeRecord::placeholder(id)));
        self.insert(placeholder.clone());
        placeholder
    }
}

// HTTP dates are IMF-fixdate: "Sun, 06 Nov 1994 08:49:37 GMT".
fn date_header(headers: &reqwest::header::HeaderMap) -> Option<OffsetDateTime> {
    let value = headers.get(reqwest::header::DATE)?.to_str().ok()?;
    let format = time::macros::format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    PrimitiveDateTime::parse(value, format)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
