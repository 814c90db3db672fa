//! Retry behaviour against a local mock server: classification decides
//! whether the budget is spent or the call fails fast.

use std::sync::Arc;
use std::time::Duration;

use gaw_remote::{ApiClient, FixedJitter, RemoteError, RetryPolicy};
use httpmock::prelude::*;
use serde_json::json;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter_cap_ms: 0,
        attempt_timeout: Duration::from_secs(5),
    }
}

fn client() -> ApiClient {
    ApiClient::new(fast_policy(), Arc::new(FixedJitter(0))).expect("client")
}

#[tokio::test]
async fn success_returns_parsed_array_on_first_attempt() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/summary")
                .header("authorization", "Bearer tok-1");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"[{"ID":"R1","Updated_On":"2024-08-01 10:00:00"}]"#);
        })
        .await;

    let rows = client()
        .post_json(&server.url("/summary"), &json!({"status": "Completed"}), "tok-1")
        .await
        .expect("success");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["ID"], "R1");
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn server_errors_exhaust_the_attempt_budget() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/summary");
            then.status(503);
        })
        .await;

    let err = client()
        .post_json(&server.url("/summary"), &json!({}), "tok")
        .await
        .expect_err("must fail after retries");
    assert!(matches!(err, RemoteError::Retryable { .. }), "got {err}");
    assert_eq!(mock.hits_async().await, 5);
}

#[tokio::test]
async fn throttling_is_retried_like_a_server_error() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/details");
            then.status(429);
        })
        .await;

    let err = client()
        .post_json(&server.url("/details"), &json!({}), "tok")
        .await
        .expect_err("must fail after retries");
    assert!(matches!(err, RemoteError::Retryable { .. }));
    assert_eq!(mock.hits_async().await, 5);
}

#[tokio::test]
async fn auth_rejection_fails_fast() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/summary");
            then.status(401);
        })
        .await;

    let err = client()
        .post_json(&server.url("/summary"), &json!({}), "stale-token")
        .await
        .expect_err("must fail");
    assert!(matches!(err, RemoteError::FatalAuth { status: 401 }));
    assert!(err.is_fatal_auth());
    assert_eq!(mock.hits_async().await, 1, "fatal auth must not be retried");
}

#[tokio::test]
async fn unexpected_status_is_non_retryable() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/summary");
            then.status(404).body("no such endpoint");
        })
        .await;

    let err = client()
        .post_json(&server.url("/summary"), &json!({}), "tok")
        .await
        .expect_err("must fail");
    match err {
        RemoteError::NonRetryable { status, detail } => {
            assert_eq!(status, 404);
            assert!(detail.contains("no such endpoint"));
        }
        other => panic!("expected NonRetryable, got {other}"),
    }
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn non_array_body_is_bad_shape() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/details");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"error":"wrapped"}"#);
        })
        .await;

    let err = client()
        .post_json(&server.url("/details"), &json!({}), "tok")
        .await
        .expect_err("must fail");
    assert!(matches!(err, RemoteError::BadShape { .. }), "got {err}");
    assert_eq!(mock.hits_async().await, 1, "bad shape must not be retried");
}

#[tokio::test]
async fn non_json_body_is_bad_shape() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/details");
            then.status(200).body("<html>gateway</html>");
        })
        .await;

    let err = client()
        .post_json(&server.url("/details"), &json!({}), "tok")
        .await
        .expect_err("must fail");
    assert!(matches!(err, RemoteError::BadShape { .. }));
}
