//! Integration tests for the installer probe endpoints

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use cni_lib::{create_router, InstallerMetrics, ReadinessFlag, ReadinessResponse};
use tower::ServiceExt;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_string(app: Router, uri: &str) -> (StatusCode, String) {
    let response = app.oneshot(get(uri)).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_healthz_always_ok() {
    let app = create_router(ReadinessFlag::new());

    let response = app.oneshot(get("/healthz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_not_ready_before_install() {
    let app = create_router(ReadinessFlag::new());

    let (status, body) = body_string(app, "/readyz").await;
    let readiness: ReadinessResponse = serde_json::from_str(&body).unwrap();

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!readiness.ready);
    assert!(readiness.reason.is_some());
}

#[tokio::test]
async fn test_readyz_follows_flag() {
    let flag = ReadinessFlag::new();
    let app = create_router(flag.clone());

    flag.set_ready();
    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    flag.set_not_ready();
    let response = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let metrics = InstallerMetrics::new();
    metrics.inc_installs();
    let app = create_router(ReadinessFlag::new());

    let (status, body) = body_string(app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("msm_cni_installs_total"));
    assert!(body.contains("msm_cni_ready"));
}

#[tokio::test]
async fn test_unknown_path() {
    let app = create_router(ReadinessFlag::new());

    let response = app.oneshot(get("/version")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
