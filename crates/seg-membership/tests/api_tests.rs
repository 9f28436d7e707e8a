//! HTTP API Tests
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use seg_membership::{
    router, AppState, InMemoryMembershipStore, MembershipStore, SegmentService, ServiceConfig,
};

fn app() -> (Router, Arc<InMemoryMembershipStore>) {
    let store = Arc::new(InMemoryMembershipStore::new());
    let service = Arc::new(SegmentService::new(store.clone(), ServiceConfig::default()));
    (router(AppState::new(service)), store)
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn create(app: &Router, name: &str) -> StatusCode {
    send(app, json_request(Method::POST, "/segment/create", json!({ "name": name })))
        .await
        .0
}

#[tokio::test]
async fn test_create_segment() {
    let (app, store) = app();

    assert_eq!(create(&app, "beta").await, StatusCode::CREATED);
    assert!(store.find_segment("beta").await.unwrap().is_some());

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/segment/create", json!({ "name": "beta" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "CONFLICT");
}

#[tokio::test]
async fn test_create_segment_rejects_bad_body() {
    let (app, _) = app();

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/segment/create", json!({ "name": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    let (status, _) = send(
        &app,
        json_request(Method::POST, "/segment/create", json!({ "title": "beta" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_segment() {
    let (app, store) = app();
    create(&app, "beta").await;

    let (status, _) = send(
        &app,
        empty_request(Method::DELETE, "/segment/delete?segmentName=beta"),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(store.find_segment("beta").await.unwrap().is_none());

    let (status, body) = send(
        &app,
        empty_request(Method::DELETE, "/segment/delete?segmentName=beta"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn test_delete_segment_requires_name() {
    let (app, _) = app();

    let (status, _) = send(&app, empty_request(Method::DELETE, "/segment/delete")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_add_user() {
    let (app, store) = app();
    create(&app, "beta").await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/segment/addUser",
            json!({ "user-id": 42, "segment-name": "beta", "timeout-hours": 0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["userId"], 42);
    assert_eq!(body["segmentName"], "beta");
    assert!(body["expiresAt"].is_null());

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/segment/addUser",
            json!({ "user-id": 43, "segment-name": "beta", "timeout-hours": 2 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["expiresAt"].is_string());

    assert_eq!(store.count_segment_members("beta").await.unwrap(), 2);
}

#[tokio::test]
async fn test_add_user_validation() {
    let (app, _) = app();
    create(&app, "beta").await;

    for body in [
        json!({ "user-id": 0, "segment-name": "beta", "timeout-hours": 0 }),
        json!({ "user-id": 1, "segment-name": "", "timeout-hours": 0 }),
        json!({ "user-id": 1, "segment-name": "beta", "timeout-hours": -1 }),
        json!({ "segment-name": "beta" }),
    ] {
        let (status, _) = send(&app, json_request(Method::POST, "/segment/addUser", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_add_user_to_missing_segment() {
    let (app, _) = app();

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/segment/addUser",
            json!({ "user-id": 42, "segment-name": "ghost", "timeout-hours": 0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Segment not found: ghost");
}

#[tokio::test]
async fn test_remove_user_is_idempotent() {
    let (app, store) = app();
    create(&app, "beta").await;
    store.insert_permanent_membership(42, "beta").await.unwrap();

    for _ in 0..2 {
        let (status, _) = send(
            &app,
            empty_request(Method::DELETE, "/segment/removeUser?userId=42&segmentName=beta"),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    assert_eq!(store.count_segment_members("beta").await.unwrap(), 0);

    let (status, _) = send(
        &app,
        empty_request(Method::DELETE, "/segment/removeUser?userId=abc&segmentName=beta"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_segment_and_user_segments() {
    let (app, store) = app();
    create(&app, "beta").await;
    create(&app, "alpha").await;
    store.insert_permanent_membership(42, "beta").await.unwrap();
    store.insert_permanent_membership(42, "alpha").await.unwrap();

    let (status, body) = send(&app, empty_request(Method::GET, "/segment/beta")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "beta");
    assert_eq!(body["members"], 1);
    assert!(body["createdAt"].is_string());

    let (status, _) = send(&app, empty_request(Method::GET, "/segment/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, empty_request(Method::GET, "/users/42/segments")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["segmentName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let (status, _) = send(&app, empty_request(Method::GET, "/users/nobody/segments")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_probes() {
    let (app, _) = app();

    for path in ["/q/health", "/q/health/live", "/q/health/ready"] {
        let (status, body) = send(&app, empty_request(Method::GET, path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "UP");
    }
}
