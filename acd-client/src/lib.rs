mod client;
mod config;
mod error;
mod node;
mod trash;

pub use acd_core::{
    AccountInfo, AccountQuota, AccountUsage, ApiErrorKind, ClientOptions, DriveClient,
};
pub use client::Client;
pub use config::Config;
pub use error::Error;
pub use node::{
    ContentProperties, Node, NodeKind, NodeRecord, NodeStatus, Properties, Tree,
    PROPERTY_KEY_MAX_LEN, PROPERTY_MAX_KEYS, PROPERTY_VALUE_MAX_LEN,
};
