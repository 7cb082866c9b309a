use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

/// Well-known bootstrap URL that yields the per-account service bases.
pub const ENDPOINT_URL: &str = "https://drive.amazonaws.com/drive/v1/account/endpoint";
pub const TOKEN_URL: &str = "https://api.amazon.com/auth/token";

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        kind: ApiErrorKind,
        status: StatusCode,
        body: String,
    },
    #[error("token refresh rejected: {error}: {description}")]
    TokenRefresh { error: String, description: String },
    #[error("no refresh token is configured")]
    MissingRefreshToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    BadInput,
    InvalidToken,
    Forbidden,
    DuplicateExists,
    InternalServerError,
    Unavailable,
    Unknown,
}

impl ApiErrorKind {
    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST => ApiErrorKind::BadInput,
            StatusCode::UNAUTHORIZED => ApiErrorKind::InvalidToken,
            StatusCode::FORBIDDEN => ApiErrorKind::Forbidden,
            StatusCode::CONFLICT => ApiErrorKind::DuplicateExists,
            StatusCode::INTERNAL_SERVER_ERROR => ApiErrorKind::InternalServerError,
            StatusCode::SERVICE_UNAVAILABLE => ApiErrorKind::Unavailable,
            _ => ApiErrorKind::Unknown,
        }
    }
}

impl Error {
    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            Error::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { kind, .. } => matches!(
                *kind,
                ApiErrorKind::InternalServerError | ApiErrorKind::Unavailable
            ),
            Error::Request(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub headers: HashMap<String, String>,
    pub user_agent: Option<String>,
    /// None means no timeout at all.
    pub timeout: Option<Duration>,
    pub app_name: String,
    pub app_version: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub metadata_url: Url,
    pub content_url: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointDocument {
    metadata_url: String,
    content_url: String,
    #[serde(default)]
    customer_exists: bool,
    #[serde(default)]
    region: String,
}

/// Client for the Amazon Cloud Drive REST API. Cheap to clone; clones share
/// the header map, so a token rotated through one clone is visible to all.
#[derive(Clone, Debug)]
pub struct DriveClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    headers: Arc<RwLock<HashMap<String, String>>>,
    token_url: Url,
    pub(crate) app_name: String,
    pub(crate) app_version: String,
    pub(crate) refresh_token: Option<String>,
}

impl DriveClient {
    /// Resolves the service endpoints and returns a ready client. The
    /// bootstrap call happens exactly once, here; a failure aborts
    /// construction.
    pub async fn connect(options: ClientOptions) -> Result<Self, Error> {
        Self::connect_with_urls(ENDPOINT_URL, TOKEN_URL, options).await
    }

    pub async fn connect_with_urls(
        endpoint_url: &str,
        token_url: &str,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        let http = build_http(&options)?;
        let token_url = Url::parse(token_url)?;
        let headers = Arc::new(RwLock::new(options.headers));

        // A client configured with only a refresh credential has no access
        // token yet; obtain one before the authenticated bootstrap call.
        let needs_token = !headers
            .read()
            .expect("header lock poisoned")
            .contains_key(crate::auth::ACCESS_TOKEN_HEADER);
        if needs_token {
            if let Some(refresh_token) = options.refresh_token.as_deref() {
                let token = crate::auth::exchange_refresh_token(
                    &http,
                    &token_url,
                    &options.app_name,
                    &options.app_version,
                    refresh_token,
                )
                .await?;
                headers
                    .write()
                    .expect("header lock poisoned")
                    .insert(crate::auth::ACCESS_TOKEN_HEADER.to_string(), token);
            }
        }

        let mut builder = http.get(Url::parse(endpoint_url)?);
        builder = apply_headers(builder, &headers);
        let response = builder.send().await.inspect_err(log_transport_error)?;
        let response = Self::check_response(response).await?;
        let document = response.json::<EndpointDocument>().await?;
        debug!(
            metadata_url = %document.metadata_url,
            content_url = %document.content_url,
            region = %document.region,
            customer_exists = document.customer_exists,
            "resolved drive endpoints"
        );

        Ok(Self {
            http,
            endpoints: Endpoints {
                metadata_url: parse_base(&document.metadata_url)?,
                content_url: parse_base(&document.content_url)?,
            },
            headers,
            token_url,
            app_name: options.app_name,
            app_version: options.app_version,
            refresh_token: options.refresh_token,
        })
    }

    /// Builds a client from already-resolved bases, skipping the bootstrap
    /// call.
    pub fn with_endpoints(
        metadata_url: &str,
        content_url: &str,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        Ok(Self {
            http: build_http(&options)?,
            endpoints: Endpoints {
                metadata_url: parse_base(metadata_url)?,
                content_url: parse_base(content_url)?,
            },
            headers: Arc::new(RwLock::new(options.headers)),
            token_url: Url::parse(TOKEN_URL)?,
            app_name: options.app_name,
            app_version: options.app_version,
            refresh_token: options.refresh_token,
        })
    }

    pub fn metadata_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self
            .endpoints
            .metadata_url
            .join(path.trim_start_matches('/'))?)
    }

    pub fn content_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self
            .endpoints
            .content_url
            .join(path.trim_start_matches('/'))?)
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn set_header(&self, name: &str, value: &str) {
        self.headers
            .write()
            .expect("header lock poisoned")
            .insert(name.to_string(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .read()
            .expect("header lock poisoned")
            .get(name)
            .cloned()
    }

    /// Starts a request with a snapshot of the current headers. The snapshot
    /// is taken under the read lock so an in-flight token rotation never
    /// produces a half-applied header set.
    pub fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        apply_headers(self.http.request(method, url), &self.headers)
    }

    pub async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, Error> {
        let response = builder.send().await.inspect_err(log_transport_error)?;
        Self::check_response(response).await
    }

    /// Maps any non-2xx status to a stable error kind, consuming the body
    /// best-effort for diagnostics. Does not retry.
    pub async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let kind = ApiErrorKind::from_status(status);
        error!(%status, ?kind, %body, "api request failed");
        Err(Error::Api { kind, status, body })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        let response = self.execute(self.request(Method::GET, url)).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn account_info(&self) -> Result<AccountInfo, Error> {
        self.get_json(self.metadata_url("account/info")?).await
    }

    pub async fn account_quota(&self) -> Result<AccountQuota, Error> {
        self.get_json(self.metadata_url("account/quota")?).await
    }

    pub async fn account_usage(&self) -> Result<AccountUsage, Error> {
        self.get_json(self.metadata_url("account/usage")?).await
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn token_url(&self) -> &Url {
        &self.token_url
    }
}

fn build_http(options: &ClientOptions) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(user_agent) = options.user_agent.as_deref() {
        builder = builder.user_agent(user_agent.to_string());
    }
    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &Arc<RwLock<HashMap<String, String>>>,
) -> reqwest::RequestBuilder {
    let snapshot = headers.read().expect("header lock poisoned").clone();
    for (name, value) in snapshot {
        builder = builder.header(name, value);
    }
    builder
}

// Service bases must end with a slash so that joining a relative path
// appends instead of replacing the last segment.
fn parse_base(value: &str) -> Result<Url, Error> {
    if value.ends_with('/') {
        Ok(Url::parse(value)?)
    } else {
        Ok(Url::parse(&format!("{value}/"))?)
    }
}

fn log_transport_error(err: &reqwest::Error) {
    error!(error = %err, "http transport error");
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountInfo {
    pub terms_of_use: String,
    pub status: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountQuota {
    pub quota: u64,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_calculated: Option<time::OffsetDateTime>,
    pub available: u64,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UsageTotals {
    pub bytes: u64,
    pub count: u64,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UsageCategory {
    pub billable: UsageTotals,
    pub total: UsageTotals,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountUsage {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_calculated: Option<time::OffsetDateTime>,
    pub doc: UsageCategory,
    pub other: UsageCategory,
    pub photo: UsageCategory,
    pub video: UsageCategory,
}

impl AccountUsage {
    pub fn billable(&self) -> UsageTotals {
        self.fold(|category| &category.billable)
    }

    pub fn total(&self) -> UsageTotals {
        self.fold(|category| &category.total)
    }

    fn fold<'a>(&'a self, pick: impl Fn(&'a UsageCategory) -> &'a UsageTotals) -> UsageTotals {
        [&self.doc, &self.other, &self.photo, &self.video]
            .into_iter()
            .map(pick)
            .fold(UsageTotals::default(), |acc, totals| UsageTotals {
                bytes: acc.bytes + totals.bytes,
                count: acc.count + totals.count,
            })
    }
}
