use std::collections::BTreeMap;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use acd_core::DriveClient;

use crate::error::Error;
use crate::node::NodeRecord;

/// The bulk purge endpoint caps each request at 50 ids.
pub(crate) const PURGE_BATCH_SIZE: usize = 50;
const PAGE_LIMIT: &str = "200";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TrashPage {
    count: u64,
    next_token: String,
    #[serde(rename = "data")]
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkPurgeRequest<'a> {
    recurse: &'a str,
    node_ids: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BulkPurgeResponse {
    error_map: BTreeMap<String, i64>,
}

/// Enumerates every node in the server-side trash.
pub(crate) async fn list_trash(drive: &DriveClient) -> Result<Vec<NodeRecord>, Error> {
    let mut nodes = Vec::new();
    let mut next_token = String::new();
    loop {
        let mut url = drive.metadata_url("trash")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", PAGE_LIMIT);
            if !next_token.is_empty() {
                query.append_pair("startToken", &next_token);
            }
        }
        let response = drive.execute(drive.request(Method::GET, url)).await?;
        let page = response
            .json::<TrashPage>()
            .await
            .map_err(acd_core::Error::from)?;

        next_token = page.next_token;
        nodes.extend(page.nodes);
        if next_token.is_empty() {
            break;
        }
    }
    debug!(nodes = nodes.len(), "listed the trash");
    Ok(nodes)
}

/// Purges the given nodes for good, batching the ids and aggregating every
/// per-node failure the server reports into a single error.
pub(crate) async fn purge_nodes(drive: &DriveClient, node_ids: &[String]) -> Result<(), Error> {
    let mut failures: BTreeMap<String, i64> = BTreeMap::new();
    for batch in node_ids.chunks(PURGE_BATCH_SIZE) {
        let body = BulkPurgeRequest {
            recurse: "true",
            node_ids: batch,
        };
        let url = drive.metadata_url("bulk/nodes/purge")?;
        let response = drive
            .execute(drive.request(Method::POST, url).json(&body))
            .await?;
        let outcome = response
            .json::<BulkPurgeResponse>()
            .await
            .map_err(acd_core::Error::from)?;
        failures.extend(outcome.error_map);
    }
    if failures.is_empty() {
        Ok(())
    } else {
        error!(?failures, "the server refused to purge some nodes");
        Err(Error::Purge(failures))
    }
}

/// Lists the trash and purges everything in it.
pub(crate) async fn purge_trash(drive: &DriveClient) -> Result<(), Error> {
    let nodes = list_trash(drive).await?;
    if nodes.is_empty() {
        return Ok(());
    }
    let node_ids: Vec<String> = nodes.into_iter().map(|node| node.id).collect();
    purge_nodes(drive, &node_ids).await
}
