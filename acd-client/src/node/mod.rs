mod cache;
mod download;
mod fetch;
mod sync;
mod tree;
mod upload;

#[cfg(test)]
pub(crate) mod testutil;

pub use tree::Tree;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

pub const PROPERTY_MAX_KEYS: usize = 10;
pub const PROPERTY_KEY_MAX_LEN: usize = 50;
pub const PROPERTY_VALUE_MAX_LEN: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    File,
    #[default]
    Folder,
    Asset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    #[default]
    Available,
    Trash,
    Purged,
}

impl NodeStatus {
    pub fn is_available(self) -> bool {
        self == NodeStatus::Available
    }
}

/// Application-owned key/value map attached to a node. The server bounds it
/// to 10 keys per owner, keys of at most 50 word characters, values of at
/// most 500 bytes; every mutation enforces those bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn all(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }

    pub fn remove_all<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            self.0.remove(key.as_ref());
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if !valid_property_key(key) || key.len() > PROPERTY_KEY_MAX_LEN {
            return Err(Error::PropertyInvalidKey);
        }
        if !self.has(key) && self.0.len() == PROPERTY_MAX_KEYS {
            return Err(Error::PropertyMaxKeys);
        }
        if value.len() > PROPERTY_VALUE_MAX_LEN {
            return Err(Error::PropertyInvalidValue);
        }
        self.0.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_all(&mut self, entries: &BTreeMap<String, String>) -> Vec<Error> {
        entries
            .iter()
            .filter_map(|(key, value)| self.set(key, value).err())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn valid_property_key(key: &str) -> bool {
    key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentProperties {
    pub version: u64,
    pub extension: String,
    pub size: u64,
    pub md5: String,
    pub content_type: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub content_date: Option<OffsetDateTime>,
}

/// The server's representation of a node, as sent by the changes stream,
/// the nodes enumeration, and every create/patch response. The children map
/// is not part of the record; it is derived locally from parent ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_date: Option<OffsetDateTime>,
    pub labels: Vec<String>,
    pub description: String,
    pub created_by: String,
    pub parents: Vec<String>,
    pub status: NodeStatus,
    pub properties: BTreeMap<String, Properties>,
    pub restricted: bool,
    pub is_root: bool,
    pub is_shared: bool,
    pub temp_link: Option<String>,
    pub content_properties: Option<ContentProperties>,
    pub e_tag_response: Option<String>,
}

impl NodeRecord {
    /// Stub for a parent id seen before its own delta arrives; the real
    /// record replaces it and inherits any children linked in the meantime.
    pub(crate) fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }
}

/// A file, folder or asset in the remote namespace. The identity is fixed at
/// construction; the record is swapped wholesale when the server sends an
/// update, and the children map lives outside the record so updates never
/// drop locally-known children.
pub struct Node {
    id: String,
    record: RwLock<NodeRecord>,
    children: RwLock<HashMap<String, Arc<Node>>>,
}

impl Node {
    pub fn from_record(record: NodeRecord) -> Self {
        Self {
            id: record.id.clone(),
            record: RwLock::new(record),
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn kind(&self) -> NodeKind {
        self.read().kind
    }

    pub fn status(&self) -> NodeStatus {
        self.read().status
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn parents(&self) -> Vec<String> {
        self.read().parents.clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.read().labels.clone()
    }

    pub fn description(&self) -> String {
        self.read().description.clone()
    }

    pub fn created_by(&self) -> String {
        self.read().created_by.clone()
    }

    pub fn modified_date(&self) -> Option<OffsetDateTime> {
        self.read().modified_date
    }

    pub fn created_date(&self) -> Option<OffsetDateTime> {
        self.read().created_date
    }

    pub fn content_properties(&self) -> Option<ContentProperties> {
        self.read().content_properties.clone()
    }

    pub fn temp_link(&self) -> Option<String> {
        self.read().temp_link.clone()
    }

    pub fn is_file(&self) -> bool {
        self.read().kind == NodeKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.read().kind == NodeKind::Folder
    }

    pub fn is_asset(&self) -> bool {
        self.read().kind == NodeKind::Asset
    }

    pub fn is_available(&self) -> bool {
        self.read().status.is_available()
    }

    pub fn is_root(&self) -> bool {
        self.read().is_root
    }

    /// Total content bytes in this subtree; for a non-folder node, the
    /// content size itself.
    pub fn size(&self) -> u64 {
        if !self.is_dir() {
            return self
                .read()
                .content_properties
                .as_ref()
                .map(|content| content.size)
                .unwrap_or(0);
        }
        self.children_snapshot()
            .into_iter()
            .map(|child| child.size())
            .sum()
    }

    /// Number of non-folder nodes in this subtree; 1 for a non-folder node.
    pub fn count(&self) -> u64 {
        if !self.is_dir() {
            return 1;
        }
        self.children_snapshot()
            .into_iter()
            .map(|child| child.count())
            .sum()
    }

    pub fn properties(&self, owner: &str) -> Option<Properties> {
        self.read().properties.get(owner).cloned()
    }

    pub fn property(&self, owner: &str, key: &str) -> Option<String> {
        self.read()
            .properties
            .get(owner)
            .and_then(|props| props.get(key))
            .map(str::to_string)
    }

    pub fn set_properties(&self, owner: &str, properties: Properties) {
        self.write().properties.insert(owner.to_string(), properties);
    }

    pub fn record(&self) -> NodeRecord {
        self.read().clone()
    }

    pub(crate) fn update_record(&self, record: NodeRecord) {
        *self.write() = record;
    }

    /// Child lookup is case-insensitive; pass any casing.
    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children
            .read()
            .expect("children lock poisoned")
            .get(&name.to_lowercase())
            .cloned()
    }

    pub fn children_snapshot(&self) -> Vec<Arc<Node>> {
        self.children
            .read()
            .expect("children lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn add_child(&self, child: Arc<Node>) {
        let key = child.name().to_lowercase();
        self.children
            .write()
            .expect("children lock poisoned")
            .insert(key, child);
    }

    pub(crate) fn remove_child(&self, child: &Node) {
        let key = child.name().to_lowercase();
        self.children
            .write()
            .expect("children lock poisoned")
            .remove(&key);
    }

    /// Carries the locally-known children of a superseded node forward onto
    /// this one; the server never sends children.
    pub(crate) fn adopt_children_from(&self, old: &Node) {
        let inherited = old
            .children
            .read()
            .expect("children lock poisoned")
            .clone();
        *self.children.write().expect("children lock poisoned") = inherited;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, NodeRecord> {
        self.record.read().expect("node lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, NodeRecord> {
        self.record.write().expect("node lock poisoned")
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.read();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &record.name)
            .field("kind", &record.kind)
            .field("status", &record.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_record(id: &str, name: &str, size: u64) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            name: name.to_string(),
            kind: NodeKind::File,
            content_properties: Some(ContentProperties {
                size,
                ..ContentProperties::default()
            }),
            ..NodeRecord::default()
        }
    }

    #[test]
    fn predicates_follow_kind_and_status() {
        let file = Node::from_record(file_record("f1", "a.txt", 3));
        assert!(file.is_file());
        assert!(!file.is_dir());
        assert!(file.is_available());

        let folder = Node::from_record(NodeRecord {
            id: "d1".to_string(),
            name: "docs".to_string(),
            status: NodeStatus::Trash,
            ..NodeRecord::default()
        });
        assert!(folder.is_dir());
        assert!(!folder.is_available());
    }

    #[test]
    fn children_are_keyed_case_insensitively() {
        let folder = Node::from_record(NodeRecord {
            id: "d1".to_string(),
            name: "docs".to_string(),
            ..NodeRecord::default()
        });
        let child = Arc::new(Node::from_record(file_record("f1", "README.md", 1)));
        folder.add_child(child.clone());

        assert_eq!(folder.child("readme.MD").unwrap().id(), "f1");
        // Adding under the same name replaces the entry.
        let replacement = Arc::new(Node::from_record(file_record("f2", "readme.md", 1)));
        folder.add_child(replacement);
        assert_eq!(folder.child("README.md").unwrap().id(), "f2");
        assert_eq!(folder.children_snapshot().len(), 1);
    }

    #[test]
    fn rollups_walk_the_subtree() {
        let root = Node::from_record(NodeRecord {
            id: "root".to_string(),
            ..NodeRecord::default()
        });
        let sub = Arc::new(Node::from_record(NodeRecord {
            id: "sub".to_string(),
            name: "sub".to_string(),
            ..NodeRecord::default()
        }));
        sub.add_child(Arc::new(Node::from_record(file_record("f1", "a", 10))));
        root.add_child(sub);
        root.add_child(Arc::new(Node::from_record(file_record("f2", "b", 5))));

        assert_eq!(root.size(), 15);
        assert_eq!(root.count(), 2);
    }

    #[test]
    fn adopted_children_survive_record_updates() {
        let old = Node::from_record(NodeRecord {
            id: "d1".to_string(),
            name: "docs".to_string(),
            ..NodeRecord::default()
        });
        old.add_child(Arc::new(Node::from_record(file_record("f1", "a.txt", 1))));

        let renamed = Node::from_record(NodeRecord {
            id: "d1".to_string(),
            name: "documents".to_string(),
            ..NodeRecord::default()
        });
        renamed.adopt_children_from(&old);
        assert_eq!(renamed.child("a.txt").unwrap().id(), "f1");
    }

    #[test]
    fn property_set_enforces_key_shape() {
        let mut props = Properties::new();
        assert!(matches!(
            props.set("not-a-key", "v"),
            Err(Error::PropertyInvalidKey)
        ));
        assert!(matches!(
            props.set(&"k".repeat(51), "v"),
            Err(Error::PropertyInvalidKey)
        ));
        props.set("ok_Key_9", "v").unwrap();
        assert_eq!(props.get("ok_Key_9"), Some("v"));
    }

    #[test]
    fn property_set_enforces_value_size() {
        let mut props = Properties::new();
        assert!(matches!(
            props.set("k", &"v".repeat(501)),
            Err(Error::PropertyInvalidValue)
        ));
        props.set("k", &"v".repeat(500)).unwrap();
    }

    #[test]
    fn property_set_rejects_the_eleventh_key() {
        let mut props = Properties::new();
        for i in 0..10 {
            props.set(&format!("key{i}"), "v").unwrap();
        }
        assert!(matches!(props.set("key10", "v"), Err(Error::PropertyMaxKeys)));
        // Updating an existing key is still allowed at the limit.
        props.set("key3", "updated").unwrap();
        assert_eq!(props.get("key3"), Some("updated"));
    }

    #[test]
    fn properties_serialize_as_a_plain_object() {
        let mut props = Properties::new();
        props.set("k", "v").unwrap();
        assert_eq!(serde_json::to_string(&props).unwrap(), r#"{"k":"v"}"#);
        assert_eq!(
            serde_json::to_string(&Properties::new()).unwrap(),
            "{}"
        );
        let decoded: Properties = serde_json::from_str("{}").unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn record_round_trips_through_json() {
        let json = serde_json::json!({
            "id": "n1",
            "name": "logo.png",
            "kind": "FILE",
            "version": 3,
            "status": "AVAILABLE",
            "parents": ["root"],
            "isRoot": false,
            "createdBy": "CloudDriveFiles",
            "modifiedDate": "2024-03-01T10:00:00Z",
            "properties": {"owner-app": {"pin": "1"}},
            "contentProperties": {
                "version": 1,
                "extension": "png",
                "size": 18750,
                "md5": "c2c88b2bc3574122210c9f0cb45b0593",
                "contentType": "image/png"
            }
        });
        let record: NodeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.kind, NodeKind::File);
        assert_eq!(record.parents, vec!["root".to_string()]);
        assert_eq!(
            record.properties.get("owner-app").and_then(|p| p.get("pin").map(str::to_string)),
            Some("1".to_string())
        );
        assert_eq!(
            record.content_properties.as_ref().unwrap().size,
            18750
        );

        let encoded = serde_json::to_value(&record).unwrap();
        let again: NodeRecord = serde_json::from_value(encoded).unwrap();
        assert_eq!(again.id, record.id);
        assert_eq!(again.modified_date, record.modified_date);
    }
}
