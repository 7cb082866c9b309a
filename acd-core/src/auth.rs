use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::client::{DriveClient, Error};

pub const ACCESS_TOKEN_HEADER: &str = "x-amz-access-token";

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    app_name: &'a str,
    app_version: &'a str,
    requested_token_type: &'a str,
    source_token: &'a str,
    source_token_type: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenResponse {
    access_token: String,
    error: String,
    error_description: String,
    expires_in: u64,
    request_id: String,
    token_type: String,
}

impl DriveClient {
    /// Exchanges the configured refresh token for a fresh access token and
    /// rotates the auth header shared by every clone of this client.
    pub async fn refresh_access_token(&self) -> Result<String, Error> {
        let source_token = self
            .refresh_token
            .as_deref()
            .ok_or(Error::MissingRefreshToken)?;
        let token = exchange_refresh_token(
            self.http(),
            self.token_url(),
            &self.app_name,
            &self.app_version,
            source_token,
        )
        .await?;
        self.set_header(ACCESS_TOKEN_HEADER, &token);
        Ok(token)
    }
}

pub(crate) async fn exchange_refresh_token(
    http: &reqwest::Client,
    token_url: &Url,
    app_name: &str,
    app_version: &str,
    source_token: &str,
) -> Result<String, Error> {
    let request = TokenRequest {
        app_name,
        app_version,
        requested_token_type: "access_token",
        source_token,
        source_token_type: "refresh_token",
    };

    let response = http
        .post(token_url.clone())
        .json(&request)
        .send()
        .await
        .inspect_err(|err| error!(error = %err, "token refresh request failed"))?;
    let response = DriveClient::check_response(response).await?;
    let token = response.json::<TokenResponse>().await?;

    if !token.error.is_empty() || !token.error_description.is_empty() {
        error!(
            error = %token.error,
            description = %token.error_description,
            request_id = %token.request_id,
            "token endpoint rejected the refresh"
        );
        return Err(Error::TokenRefresh {
            error: token.error,
            description: token.error_description,
        });
    }

    debug!(
        token_type = %token.token_type,
        expires_in = token.expires_in,
        "access token refreshed"
    );
    Ok(token.access_token)
}
