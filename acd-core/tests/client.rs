use std::collections::HashMap;

use acd_core::{ApiErrorKind, ClientOptions, DriveClient};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn options_with_token(token: &str) -> ClientOptions {
    ClientOptions {
        headers: HashMap::from([("x-amz-access-token".to_string(), token.to_string())]),
        ..ClientOptions::default()
    }
}

async fn connected_client(server: &MockServer) -> DriveClient {
    Mock::given(method("GET"))
        .and(path("/account/endpoint"))
        .and(header("x-amz-access-token", "test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadataUrl": format!("{}/metadata/", server.uri()),
            "contentUrl": format!("{}/content/", server.uri()),
            "customerExists": true,
            "region": "us-east-1"
        })))
        .mount(server)
        .await;

    DriveClient::connect_with_urls(
        &format!("{}/account/endpoint", server.uri()),
        &format!("{}/auth/token", server.uri()),
        options_with_token("test-token"),
    )
    .await
    .expect("client should connect")
}

#[tokio::test]
async fn connect_resolves_endpoint_bases() {
    let server = MockServer::start().await;
    let client = connected_client(&server).await;

    let url = client.metadata_url("changes").unwrap();
    assert_eq!(url.as_str(), format!("{}/metadata/changes", server.uri()));

    let url = client.content_url("nodes?suppress=deduplication").unwrap();
    assert_eq!(
        url.as_str(),
        format!("{}/content/nodes?suppress=deduplication", server.uri())
    );
}

#[tokio::test]
async fn connect_fails_when_endpoint_call_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/endpoint"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = DriveClient::connect_with_urls(
        &format!("{}/account/endpoint", server.uri()),
        &format!("{}/auth/token", server.uri()),
        options_with_token("expired"),
    )
    .await
    .expect_err("expected construction to abort");

    assert_eq!(err.api_kind(), Some(ApiErrorKind::InvalidToken));
}

#[tokio::test]
async fn base_without_trailing_slash_still_joins_paths() {
    let client = DriveClient::with_endpoints(
        "https://md.example/drive/v1",
        "https://ct.example/drive/v1",
        ClientOptions::default(),
    )
    .unwrap();

    assert_eq!(
        client.metadata_url("trash/n1").unwrap().as_str(),
        "https://md.example/drive/v1/trash/n1"
    );
}

#[tokio::test]
async fn non_2xx_statuses_map_to_stable_kinds() {
    let cases = [
        (400, ApiErrorKind::BadInput),
        (401, ApiErrorKind::InvalidToken),
        (403, ApiErrorKind::Forbidden),
        (409, ApiErrorKind::DuplicateExists),
        (500, ApiErrorKind::InternalServerError),
        (503, ApiErrorKind::Unavailable),
        (418, ApiErrorKind::Unknown),
    ];

    for (status, kind) in cases {
        let server = MockServer::start().await;
        let client = connected_client(&server).await;
        Mock::given(method("GET"))
            .and(path("/metadata/account/info"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = client
            .account_info()
            .await
            .expect_err("expected classified error");
        assert_eq!(err.api_kind(), Some(kind), "status {status}");
    }
}

#[tokio::test]
async fn account_usage_rolls_up_categories() {
    let server = MockServer::start().await;
    let client = connected_client(&server).await;
    Mock::given(method("GET"))
        .and(path("/metadata/account/usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lastCalculated": "2024-05-01T00:00:00Z",
            "doc":   {"billable": {"bytes": 10, "count": 1}, "total": {"bytes": 20, "count": 2}},
            "other": {"billable": {"bytes": 5,  "count": 1}, "total": {"bytes": 5,  "count": 1}},
            "photo": {"billable": {"bytes": 0,  "count": 0}, "total": {"bytes": 40, "count": 4}},
            "video": {"billable": {"bytes": 1,  "count": 1}, "total": {"bytes": 1,  "count": 1}}
        })))
        .mount(&server)
        .await;

    let usage = client.account_usage().await.unwrap();
    assert_eq!(usage.billable().bytes, 16);
    assert_eq!(usage.billable().count, 3);
    assert_eq!(usage.total().bytes, 66);
    assert_eq!(usage.total().count, 8);
}

#[tokio::test]
async fn rotated_header_applies_to_later_requests() {
    let server = MockServer::start().await;
    let client = connected_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/metadata/account/info"))
        .and(header("x-amz-access-token", "rotated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "termsOfUse": "1.0", "status": "ACTIVE"
        })))
        .mount(&server)
        .await;

    client.set_header("x-amz-access-token", "rotated");
    let info = client.account_info().await.unwrap();
    assert_eq!(info.status, "ACTIVE");
}
