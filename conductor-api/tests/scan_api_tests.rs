//! Scan control through the HTTP API

use std::time::Duration;

use axum::http::StatusCode;
use conductor_test_utils::fixtures;
use serde_json::json;

#[path = "support/app.rs"]
mod app_support;
use app_support::{str_field, TestApp, TestResult, OPPORTUNITIES_PER_RUN};

#[tokio::test]
async fn test_scan_runs_to_completion() -> TestResult {
    let app = TestApp::pipeline().await?;

    let (status, body) = app
        .post(
            "/scan/start",
            Some(json!({
                "workflow": fixtures::pipeline_name(),
                "entities": [{ "name": "a" }, { "name": "b" }, { "name": "c" }],
                "batchSize": 2
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    let session_id = str_field(&body, "sessionId")?.to_string();

    // The scan is accounted to a real session.
    let (status, _) = app.get(&format!("/sessions/{}", session_id)).await?;
    assert_eq!(status, StatusCode::OK);

    let record = app
        .wait_for(&format!("/progress?sessionId={}", session_id), |b| {
            b["status"] == "completed" || b["status"] == "error"
        })
        .await?;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["totalEntities"], 3);
    assert_eq!(record["processedEntities"], 3);
    assert_eq!(record["totalBatches"], 2);
    assert_eq!(record["opportunitiesFound"], 3 * OPPORTUNITIES_PER_RUN);
    Ok(())
}

#[tokio::test]
async fn test_scan_uses_requested_session() -> TestResult {
    let app = TestApp::pipeline().await?;
    let (status, body) = app
        .post(
            "/scan/start",
            Some(json!({
                "sessionId": "scanA",
                "workflow": fixtures::pipeline_name(),
                "entities": [{ "name": "a" }]
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(str_field(&body, "sessionId")?, "scanA");

    app.wait_for("/progress?sessionId=scanA", |b| b["status"] == "completed")
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_second_scan_conflicts_and_stop_halts() -> TestResult {
    let app = TestApp::slow_pipeline(Duration::from_millis(300)).await?;
    let start = json!({
        "workflow": fixtures::pipeline_name(),
        "entities": [{ "name": "a" }, { "name": "b" }, { "name": "c" }],
        "batchSize": 1
    });

    let (status, body) = app.post("/scan/start", Some(start.clone())).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    let session_id = str_field(&body, "sessionId")?.to_string();

    let (status, body) = app.post("/scan/start", Some(start)).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "STATE_CONFLICT");

    let (status, _) = app.post("/scan/stop", None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, record) = app.get(&format!("/progress?sessionId={}", session_id)).await?;
    assert_eq!(record["status"], "stopped");
    assert!(record["processedEntities"].as_u64().unwrap_or(u64::MAX) < 3);
    assert!(!app.state.scans.is_running().await);
    Ok(())
}

#[tokio::test]
async fn test_scan_request_validation() -> TestResult {
    let app = TestApp::pipeline().await?;

    let (status, _) = app
        .post("/scan/start", Some(json!({ "entities": [{ "name": "a" }] })))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(
            "/scan/start",
            Some(json!({
                "workflow": fixtures::pipeline_name(),
                "entities": [],
                "batchSize": 1000
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_stop_without_scan_is_no_op() -> TestResult {
    let app = TestApp::bare()?;
    let (status, _) = app.post("/scan/stop", None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    Ok(())
}
