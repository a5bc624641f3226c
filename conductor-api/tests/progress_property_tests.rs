//! Property-Based Tests for the Progress API
//!
//! For any sequence of partial counter updates posted to `POST /progress`,
//! the record served by `GET /progress` keeps its counters within their
//! known totals, and every post is answered with 200.

use axum::http::StatusCode;
use conductor_core::ProgressUpdate;
use conductor_test_utils::generators::arb_counter_update;
use proptest::prelude::*;
use serde_json::json;
use tokio::runtime::Runtime;

#[path = "support/app.rs"]
mod app_support;
use app_support::TestApp;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn fail(e: impl std::fmt::Display) -> TestCaseError {
    TestCaseError::fail(e.to_string())
}

fn counter(body: &serde_json::Value, field: &str) -> Result<u64, TestCaseError> {
    body[field]
        .as_u64()
        .ok_or_else(|| TestCaseError::fail(format!("{} missing from {}", field, body)))
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Counters never exceed a known total, whatever order updates arrive in.
    #[test]
    fn prop_counters_stay_within_totals(
        updates in proptest::collection::vec(arb_counter_update(), 1..8)
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let app = TestApp::bare().map_err(fail)?;

            for update in &updates {
                let mut body = serde_json::to_value(update).map_err(fail)?;
                body["sessionId"] = json!("prop-scan");
                let (status, _) = app.post("/progress", Some(body)).await.map_err(fail)?;
                prop_assert_eq!(status, StatusCode::OK);
            }

            let (status, record) = app
                .get("/progress?sessionId=prop-scan")
                .await
                .map_err(fail)?;
            prop_assert_eq!(status, StatusCode::OK);

            let total = counter(&record, "totalEntities")?;
            let processed = counter(&record, "processedEntities")?;
            prop_assert!(total == 0 || processed <= total);

            let batches = counter(&record, "totalBatches")?;
            let batch = counter(&record, "currentBatch")?;
            prop_assert!(batches == 0 || batch <= batches);

            let last_found = updates.iter().rev().find_map(|u| u.opportunities_found);
            prop_assert_eq!(counter(&record, "opportunitiesFound")?, last_found.unwrap_or(0));
            Ok(())
        })?;
    }

    /// Fields absent from an update are left untouched.
    #[test]
    fn prop_merge_is_shallow(
        total in 1u64..1_000,
        processed in 0u64..1_000,
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let app = TestApp::bare().map_err(fail)?;

            let seed = ProgressUpdate::default().with_totals(total, 4);
            let mut body = serde_json::to_value(&seed).map_err(fail)?;
            body["sessionId"] = json!("prop-merge");
            body["status"] = json!("starting");
            app.post("/progress", Some(body)).await.map_err(fail)?;

            let (status, record) = app
                .post(
                    "/progress",
                    Some(json!({ "sessionId": "prop-merge", "processedEntities": processed })),
                )
                .await
                .map_err(fail)?;
            prop_assert_eq!(status, StatusCode::OK);
            prop_assert_eq!(counter(&record, "totalEntities")?, total);
            prop_assert_eq!(counter(&record, "totalBatches")?, 4);
            prop_assert_eq!(counter(&record, "processedEntities")?, processed.min(total));
            prop_assert_eq!(&record["status"], "starting");
            Ok(())
        })?;
    }
}
