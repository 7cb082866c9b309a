use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{Node, NodeRecord, Tree};
use crate::error::Error;

const PAGE_LIMIT: &str = "200";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NodeListPage {
    count: u64,
    next_token: String,
    #[serde(rename = "data")]
    nodes: Vec<NodeRecord>,
}

impl Tree {
    /// Rebuilds the whole tree from a paginated full enumeration. Used when
    /// there is no usable cache and whenever the server rejects the sync
    /// checkpoint. The new index is swapped in atomically and the
    /// checkpoint is cleared; the next sync establishes a fresh one.
    pub async fn fetch_fresh(&self) -> Result<(), Error> {
        debug!("fresh fetch starting");
        let mut records: Vec<NodeRecord> = Vec::new();
        let mut next_token = String::new();
        loop {
            let mut url = self.drive.metadata_url("nodes")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", PAGE_LIMIT);
                if !next_token.is_empty() {
                    query.append_pair("startToken", &next_token);
                }
            }
            let response = self
                .drive
                .execute(self.drive.request(Method::GET, url))
                .await?;
            let page = response
                .json::<NodeListPage>()
                .await
                .map_err(acd_core::Error::from)?;

            next_token = page.next_token;
            records.extend(page.nodes);
            if next_token.is_empty() {
                break;
            }
        }
        debug!(nodes = records.len(), "fresh fetch enumerated the namespace");

        let mut index: HashMap<String, Arc<Node>> = HashMap::new();
        for record in records {
            if !record.status.is_available() {
                continue;
            }
            let node = Arc::new(Node::from_record(record));
            index.insert(node.id().to_string(), node);
        }

        let mut root: Option<Arc<Node>> = None;
        for node in index.values() {
            if node.is_root() || (node.name().is_empty() && node.is_dir() && node.parents().is_empty())
            {
                root = Some(node.clone());
            }
            for parent_id in node.parents() {
                if let Some(parent) = index.get(&parent_id) {
                    parent.add_child(node.clone());
                }
            }
        }
        if root.is_none() {
            warn!("the enumeration contained no root folder");
        }

        {
            let mut index_guard = self.index.write().expect("tree lock poisoned");
            let mut root_guard = self.root.write().expect("tree lock poisoned");
            *index_guard = index;
            if root.is_some() {
                *root_guard = root;
            }
        }
        *self.checkpoint.write().expect("tree lock poisoned") = String::new();
        *self.last_updated.write().expect("tree lock poisoned") = OffsetDateTime::now_utc();
        debug!("fresh fetch completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::tree_with_bases;
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method as http_method, path as http_path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_fresh_paginates_and_rebuilds_the_tree() {
        let server = MockServer::start().await;
        let tree = tree_with_bases(
            &format!("{}/metadata/", server.uri()),
            &format!("{}/content/", server.uri()),
        );
        tree.set_checkpoint("stale");

        Mock::given(http_method("GET"))
            .and(http_path("/metadata/nodes"))
            .and(query_param("limit", "200"))
            .and(query_param("startToken", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 1,
                "data": [
                    {"id": "f1", "name": "notes.txt", "kind": "FILE",
                     "status": "AVAILABLE", "parents": ["d1"]},
                    {"id": "gone", "name": "gone.txt", "kind": "FILE",
                     "status": "TRASH", "parents": ["d1"]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(http_method("GET"))
            .and(http_path("/metadata/nodes"))
            .and(query_param("limit", "200"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 2,
                "nextToken": "page2",
                "data": [
                    {"id": "root", "name": "", "kind": "FOLDER",
                     "status": "AVAILABLE", "parents": [], "isRoot": true},
                    {"id": "d1", "name": "docs", "kind": "FOLDER",
                     "status": "AVAILABLE", "parents": ["root"]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        tree.fetch_fresh().await.unwrap();

        assert_eq!(tree.checkpoint(), "");
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.find_node("/docs/notes.txt").unwrap().id(), "f1");
        assert!(matches!(tree.find_by_id("gone"), Err(Error::NodeNotFound)));
    }

    #[tokio::test]
    async fn fetch_fresh_identifies_an_unflagged_root() {
        let server = MockServer::start().await;
        let tree = tree_with_bases(
            &format!("{}/metadata/", server.uri()),
            &format!("{}/content/", server.uri()),
        );

        // No isRoot marker; the root is the available folder with an empty
        // name and no parents.
        Mock::given(http_method("GET"))
            .and(http_path("/metadata/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 2,
                "data": [
                    {"id": "top", "name": "", "kind": "FOLDER",
                     "status": "AVAILABLE", "parents": []},
                    {"id": "f1", "name": "a.txt", "kind": "FILE",
                     "status": "AVAILABLE", "parents": ["top"]}
                ]
            })))
            .mount(&server)
            .await;

        tree.fetch_fresh().await.unwrap();
        assert_eq!(tree.root_node().unwrap().id(), "top");
        assert_eq!(tree.find_node("/a.txt").unwrap().id(), "f1");
    }

    #[tokio::test]
    async fn fetch_fresh_replaces_a_previously_loaded_index() {
        let server = MockServer::start().await;
        let tree = tree_with_bases(
            &format!("{}/metadata/", server.uri()),
            &format!("{}/content/", server.uri()),
        );
        tree.seed(vec![
            super::super::testutil::root_record("root"),
            super::super::testutil::record(
                "old",
                "old.txt",
                super::super::NodeKind::File,
                &["root"],
            ),
        ]);

        Mock::given(http_method("GET"))
            .and(http_path("/metadata/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 1,
                "data": [
                    {"id": "root", "name": "", "kind": "FOLDER",
                     "status": "AVAILABLE", "parents": [], "isRoot": true}
                ]
            })))
            .mount(&server)
            .await;

        tree.fetch_fresh().await.unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(matches!(tree.find_node("/old.txt"), Err(Error::NodeNotFound)));
    }
}
