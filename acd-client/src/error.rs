use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

/// Stable error kinds for the client. Callers match on variants; messages
/// are diagnostics only.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] acd_core::Error),
    #[error("json encoding failed: {0}")]
    JsonEncode(#[source] serde_json::Error),
    #[error("json decoding failed: {0}")]
    JsonDecode(#[source] serde_json::Error),
    #[error("reading the response body failed: {0}")]
    ResponseRead(#[source] std::io::Error),

    #[error("cacheFile is not set in the configuration")]
    CacheFileNotConfigured,
    #[error("loading the node cache failed")]
    LoadingCache,
    #[error("encoding the node cache failed: {0}")]
    CacheEncode(#[source] serde_json::Error),
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("creating file {path:?} failed: {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("opening file {path:?} failed: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("stat of file {path:?} failed: {source}")]
    StatFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("file not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("file {0:?} must be readable by the owner only")]
    WrongPermissions(PathBuf),

    #[error("node not found")]
    NodeNotFound,
    #[error("path is not a folder")]
    PathIsNotFolder,
    #[error("path is a folder")]
    PathIsFolder,
    #[error("file already exists")]
    FileExists,
    #[error("file already exists and is a folder")]
    FileExistsAndIsFolder,
    #[error("file already exists and is not a folder")]
    FileExistsAndIsNotFolder,
    #[error("file already exists with different contents")]
    FileExistsWithDifferentContents,
    #[error("cannot create the root node")]
    CannotCreateRootNode,
    #[error("cannot create a node under a file")]
    CannotCreateNodeUnderAFile,

    #[error("the checkpoint was not accepted, a fresh fetch is required")]
    MustFetchFresh,
    #[error("no contents to upload")]
    NoContentsToUpload,
    #[error("reading the upload contents failed: {0}")]
    ReadContents(#[source] std::io::Error),
    #[error("the upload worker exited unexpectedly")]
    UploadInterrupted,
    #[error("downloaded contents did not match: expected md5 {expected}, got {actual}")]
    DownloadIntegrity { expected: String, actual: String },

    #[error("property key is invalid")]
    PropertyInvalidKey,
    #[error("property value is invalid")]
    PropertyInvalidValue,
    #[error("property key limit reached")]
    PropertyMaxKeys,

    #[error("purge failed for {} node(s)", .0.len())]
    Purge(BTreeMap<String, i64>),
}

impl Error {
    /// The classified API error kind, when the failure came from a non-2xx
    /// response.
    pub fn api_kind(&self) -> Option<acd_core::ApiErrorKind> {
        match self {
            Error::Api(err) => err.api_kind(),
            _ => None,
        }
    }
}
