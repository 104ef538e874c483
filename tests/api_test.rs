//! HTTP surface tests driven through the router without a listener.

mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use helpers::*;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use imagegen_tasks::app_state::AppState;
use imagegen_tasks::models::task::TaskStatus;
use imagegen_tasks::routes::{self, auth::JwtKeys};

const SECRET: &str = "test-secret";

fn app(h: &Harness) -> Router {
    routes::router(AppState::new(h.engine.clone(), JwtKeys::new(SECRET), None))
}

fn token(owner: &str) -> String {
    JwtKeys::new(SECRET)
        .issue(owner, Duration::from_secs(3600))
        .unwrap()
}

fn request(method: &str, uri: &str, owner: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner) = owner {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(owner)));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_submit_requires_token() {
    let h = Harness::new(FakeProvider::succeeding());
    let app = app(&h);

    let (status, body) = send(
        &app,
        request("POST", "/api/v1/tasks", None, Some(json!({ "prompt": "a red bicycle" }))),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let forged = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks")
        .header(
            header::AUTHORIZATION,
            format!(
                "Bearer {}",
                JwtKeys::new("other-secret")
                    .issue(OWNER, Duration::from_secs(60))
                    .unwrap()
            ),
        )
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "prompt": "a red bicycle" }).to_string()))
        .unwrap();
    let (status, _) = send(&app, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.store.task_count(), 0);
}

#[tokio::test]
async fn test_submit_poll_and_cancel() {
    let h = Harness::new(FakeProvider::succeeding());
    h.fund(OWNER, 3).await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/tasks",
            Some(OWNER),
            Some(json!({ "prompt": "a red bicycle", "aspect_ratio": "16:9" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let (status, view) = send(
        &app,
        request("GET", &format!("/api/v1/tasks/{task_id}"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "pending");
    assert_eq!(view["progress_percentage"], 0);
    assert!(view["estimated_remaining_secs"].is_u64());
    assert!(view["poll_after_ms"].is_u64());

    let (status, _) = send(
        &app,
        request("GET", &format!("/api/v1/tasks/{task_id}"), Some(OTHER_OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, cancelled) = send(
        &app,
        request("POST", &format!("/api/v1/tasks/{task_id}/cancel"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["newly_cancelled"], true);

    let (status, again) = send(
        &app,
        request("POST", &format!("/api/v1/tasks/{task_id}/cancel"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["newly_cancelled"], false);

    let (status, logs) = send(
        &app,
        request("GET", &format!("/api/v1/tasks/{task_id}/logs"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs["entries"].as_array().unwrap().len(), 2);

    let (status, credits) = send(&app, request("GET", "/api/v1/credits", Some(OWNER), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(credits["balance"], 3);
}

#[tokio::test]
async fn test_resubmission_returns_existing_task() {
    let h = Harness::new(FakeProvider::succeeding());
    h.fund(OWNER, 3).await;
    let app = app(&h);
    let payload = json!({
        "prompt": "a red bicycle",
        "client_request_id": "6c1f1f0e-2b4f-4a8e-9a53-0d7c0c2f8e11"
    });

    let (first, _) = send(
        &app,
        request("POST", "/api/v1/tasks", Some(OWNER), Some(payload.clone())),
    )
    .await;
    let (second, body) = send(
        &app,
        request("POST", "/api/v1/tasks", Some(OWNER), Some(payload)),
    )
    .await;

    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["task_id"], "6c1f1f0e-2b4f-4a8e-9a53-0d7c0c2f8e11");
    assert_eq!(h.store.task_count(), 1);
}

#[tokio::test]
async fn test_error_statuses() {
    let h = Harness::new(FakeProvider::succeeding());
    let app = app(&h);

    let (status, body) = send(
        &app,
        request("POST", "/api/v1/tasks", Some(OWNER), Some(json!({ "prompt": "a red bicycle" }))),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert!(body["error"].is_string());

    h.fund(OWNER, 1).await;
    let (status, _) = send(
        &app,
        request("POST", "/api/v1/tasks", Some(OWNER), Some(json!({ "prompt": "" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request(
            "GET",
            "/api/v1/tasks/00000000-0000-0000-0000-000000000000",
            Some(OWNER),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_non_uuid_request_id_is_rejected_as_validation() {
    let h = Harness::new(FakeProvider::succeeding());
    h.fund(OWNER, 3).await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/tasks",
            Some(OWNER),
            Some(json!({ "prompt": "a red bicycle", "client_request_id": "req-42" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert_eq!(h.store.task_count(), 0);
}

#[tokio::test]
async fn test_cancel_completed_task_conflicts() {
    let h = Harness::new(FakeProvider::succeeding());
    h.fund(OWNER, 3).await;
    let app = app(&h);

    let task = h.submit("a red bicycle").await;
    h.engine.pool.start();
    let done = h.wait_terminal(task.id, Duration::from_secs(5)).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let (status, view) = send(
        &app,
        request("GET", &format!("/api/v1/tasks/{}", task.id), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["progress_percentage"], 100);
    assert_eq!(view["result_ref"], PLAIN_LOCATOR);
    assert!(view.get("poll_after_ms").is_none());

    let (status, body) = send(
        &app,
        request("POST", &format!("/api/v1/tasks/{}/cancel", task.id), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn test_health_reports_components() {
    let h = Harness::new(FakeProvider::succeeding());
    let app = app(&h);

    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["checks"]["cancel_channel"]["status"], "ok");
    assert_eq!(body["checks"]["cancel_channel"]["backend"], "local");
    assert_eq!(body["checks"]["worker_pool"]["status"], "error");

    h.engine.pool.start();
    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
