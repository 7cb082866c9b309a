mod auth;
mod client;

pub use auth::ACCESS_TOKEN_HEADER;
pub use client::{
    AccountInfo, AccountQuota, AccountUsage, ApiErrorKind, ClientOptions, DriveClient, Endpoints,
    Error, UsageCategory, UsageTotals, ENDPOINT_URL, TOKEN_URL,
};
