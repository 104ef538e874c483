//! End-to-end tests against a running server.
//!
//! These tests require:
//! 1. The API server running with migrations applied
//! 2. Provider credentials configured on the server
//! 3. `JWT_SECRET` matching the server's secret
//! 4. Credits granted to the test owner (`E2E_OWNER`, default `e2e-user`)
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

use serde_json::{json, Value};
use std::time::Duration;

use imagegen_tasks::routes::auth::JwtKeys;

fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

fn bearer() -> String {
    dotenvy::dotenv().ok();
    let secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    let owner = std::env::var("E2E_OWNER").unwrap_or_else(|_| "e2e-user".to_string());
    let token = JwtKeys::new(&secret)
        .issue(&owner, Duration::from_secs(600))
        .expect("Failed to issue token");
    format!("Bearer {token}")
}

async fn submit(client: &reqwest::Client, prompt: &str) -> String {
    let response = client
        .post(format!("{}/api/v1/tasks", base_url()))
        .header("Authorization", bearer())
        .json(&json!({ "prompt": prompt }))
        .send()
        .await
        .expect("Submit request failed");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let body: Value = response.json().await.expect("Invalid submit response");
    assert_eq!(body["status"], "pending");
    body["task_id"].as_str().expect("Missing task_id").to_string()
}

async fn poll(client: &reqwest::Client, task_id: &str) -> Value {
    client
        .get(format!("{}/api/v1/tasks/{task_id}", base_url()))
        .header("Authorization", bearer())
        .send()
        .await
        .expect("Poll request failed")
        .json()
        .await
        .expect("Invalid task view")
}

#[tokio::test]
#[ignore] // Requires running server and infrastructure
async fn test_e2e_health_check() {
    let response = reqwest::get(format!("{}/health", base_url()))
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
}

#[tokio::test]
#[ignore] // Requires running server and infrastructure
async fn test_e2e_generation_reaches_terminal_state() {
    let client = reqwest::Client::new();
    let task_id = submit(&client, "a watercolor fox in the snow").await;
    println!("Submitted task {task_id}");

    let mut last_progress = 0;
    for _ in 0..120 {
        let view = poll(&client, &task_id).await;
        let progress = view["progress_percentage"].as_u64().unwrap_or(0);
        let status = view["status"].as_str().unwrap_or_default().to_string();

        if status == "completed" {
            assert_eq!(progress, 100);
            assert!(view["result_ref"].is_string());
            println!("Completed: {}", view["result_ref"]);
            return;
        }
        if status == "failed" {
            assert_eq!(progress, 0);
            println!("Failed: {}", view["error_message"]);
            return;
        }
        assert!(progress >= last_progress, "progress went backwards");
        last_progress = progress;

        let wait = view["poll_after_ms"].as_u64().unwrap_or(2000);
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }
    panic!("task {task_id} did not finish in time");
}

#[tokio::test]
#[ignore] // Requires running server and infrastructure
async fn test_e2e_cancel_is_idempotent() {
    let client = reqwest::Client::new();
    let task_id = submit(&client, "a lighthouse at dusk").await;
    let url = format!("{}/api/v1/tasks/{task_id}/cancel", base_url());

    let first = client
        .post(&url)
        .header("Authorization", bearer())
        .send()
        .await
        .expect("Cancel request failed");
    if first.status() == reqwest::StatusCode::CONFLICT {
        // The task already finished; nothing left to cancel.
        return;
    }
    assert!(first.status().is_success());
    let body: Value = first.json().await.expect("Invalid cancel response");
    assert_eq!(body["status"], "cancelled");

    let second: Value = client
        .post(&url)
        .header("Authorization", bearer())
        .send()
        .await
        .expect("Cancel request failed")
        .json()
        .await
        .expect("Invalid cancel response");
    assert_eq!(second["status"], "cancelled");
    assert_eq!(second["newly_cancelled"], false);
}
