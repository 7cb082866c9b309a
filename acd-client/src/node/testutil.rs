use std::path::PathBuf;

use acd_core::{ClientOptions, DriveClient};

use super::{NodeKind, NodeRecord, Tree};

pub(crate) fn tree_with_bases(metadata_url: &str, content_url: &str) -> Tree {
    let drive = DriveClient::with_endpoints(metadata_url, content_url, ClientOptions::default())
        .expect("test endpoints should parse");
    Tree::new(drive, PathBuf::from("acd-test-cache.json"), 25)
}

pub(crate) fn offline_tree() -> Tree {
    tree_with_bases("https://md.invalid/drive/v1/", "https://ct.invalid/drive/v1/")
}

pub(crate) fn record(id: &str, name: &str, kind: NodeKind, parents: &[&str]) -> NodeRecord {
    NodeRecord {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        parents: parents.iter().map(|p| p.to_string()).collect(),
        ..NodeRecord::default()
    }
}

pub(crate) fn root_record(id: &str) -> NodeRecord {
    NodeRecord {
        id: id.to_string(),
        is_root: true,
        ..NodeRecord::default()
    }
}

/// The fixture tree used across unit tests; the ids are the full paths of
/// the entries to keep assertions readable.
///
/// /
/// |-- README.md
/// |-- pictures
///     |-- logo.png
pub(crate) fn mocked_tree() -> Tree {
    let tree = offline_tree();
    tree.seed(vec![
        root_record("/"),
        record("/README.md", "README.md", NodeKind::File, &["/"]),
        record("/pictures", "pictures", NodeKind::Folder, &["/"]),
        record(
            "/pictures/logo.png",
            "logo.png",
            NodeKind::File,
            &["/pictures"],
        ),
    ]);
    tree
}

impl Tree {
    pub(crate) fn seed(&self, records: Vec<NodeRecord>) {
        for record in records {
            self.insert(std::sync::Arc::new(super::Node::from_record(record)));
        }
        self.relink_all();
    }

    pub(crate) fn seed_root(&self) {
        self.seed(vec![root_record("root")]);
    }

    pub(crate) fn set_checkpoint(&self, value: &str) {
        *self.checkpoint.write().expect("tree lock poisoned") = value.to_string();
    }
}
