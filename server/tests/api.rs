mod common;

use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use common::*;

#[tokio::test]
async fn health_check_responds() {
    let app = TestApp::new();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!("OK"));
}

#[tokio::test]
async fn agreeing_sources_verify_the_milestone() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;

    let (status, body) = app
        .post(
            &format!("/api/milestones/{}/verifications", milestone_id),
            OPERATOR,
            json!({ "evidence": [{ "kind": "meter_reading", "meter_id": "m-1", "reading_kwh": 100.0 }] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let receipt = &body["data"];
    assert_eq!(receipt["status"], "VERIFIED");
    assert!(receipt["confidence"].as_u64().unwrap() >= 80);
    let aggregate = receipt["measurements"][0]["aggregate_value"].as_f64().unwrap();
    assert!((aggregate - 100.0).abs() < 1e-9);

    let (status, view) = app
        .get(&format!("/api/milestones/{}/verification", milestone_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["data"]["status"], "VERIFIED");
    assert_eq!(view["data"]["history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn an_outlier_source_blocks_consensus() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 140.0, 95.0]).await;

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/milestones/{}/verifications", milestone_id),
            Some(OPERATOR),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "FAILED");
    assert_eq!(body["data"]["failure_reason"], "ConsensusNotReached");
    assert_eq!(body["data"]["measurements"][0]["consensus_reached"], false);
}

#[tokio::test]
async fn unmet_target_fails_with_reason() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[60.0, 61.0, 59.0]).await;

    let (_, body) = app
        .post(
            &format!("/api/milestones/{}/verifications", milestone_id),
            OPERATOR,
            json!({}),
        )
        .await;
    assert_eq!(body["data"]["status"], "FAILED");
    assert_eq!(body["data"]["failure_reason"], "TargetNotMet");
}

#[tokio::test]
async fn stale_reading_is_rejected_at_ingestion() {
    let app = TestApp::new();
    let project_id = Uuid::new_v4();
    let meters = meters(1);
    let feed_id = subscribe_energy_feed(&app, project_id, &meters).await;

    let (status, body) = app
        .post(
            &format!("/api/feeds/{}/data-points", feed_id),
            OPERATOR,
            meters[0].reading(100.0, 0.9, 20 * 60),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "StaleData");

    let (_, audit) = app.get("/api/audit?kind=stale_data_rejected").await;
    assert_eq!(audit["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let app = TestApp::new();
    let meters = meters(1);
    let feed_id = subscribe_energy_feed(&app, Uuid::new_v4(), &meters).await;

    let mut reading = meters[0].reading(100.0, 0.9, 0);
    reading["value"] = json!(100.5);
    let (status, body) = app
        .post(&format!("/api/feeds/{}/data-points", feed_id), OPERATOR, reading)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidSignature");
}

#[tokio::test]
async fn resubmitting_after_verification_conflicts() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;
    let uri = format!("/api/milestones/{}/verifications", milestone_id);

    let (status, _) = app.post(&uri, OPERATOR, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.post(&uri, OPERATOR, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "AlreadyVerified");
}

#[tokio::test]
async fn failed_attempt_can_be_retried() {
    let app = TestApp::new();
    let project_id = Uuid::new_v4();
    let meters = meters(3);
    let feed_id = subscribe_energy_feed(&app, project_id, &meters).await;
    let milestone_id = register_milestone(&app, project_id, 90.0).await;
    let uri = format!("/api/milestones/{}/verifications", milestone_id);

    report(&app, feed_id, &meters, &[100.0, 140.0, 95.0], 0.9).await;
    let (_, first) = app.post(&uri, OPERATOR, json!({})).await;
    assert_eq!(first["data"]["status"], "FAILED");

    // Newer readings agree. Every source lost some reliability in the failed round,
    // so they report with full confidence to clear the threshold.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    report(&app, feed_id, &meters, &[100.0, 101.0, 99.0], 1.0).await;
    let (_, second) = app.post(&uri, OPERATOR, json!({})).await;
    assert_eq!(second["data"]["status"], "VERIFIED");

    let (_, view) = app
        .get(&format!("/api/milestones/{}/verification", milestone_id))
        .await;
    assert_eq!(view["data"]["history"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn override_requires_role_and_justification() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 140.0, 95.0]).await;
    let uri = format!("/api/milestones/{}/override", milestone_id);
    let justification = "Site inspection confirmed full commissioning on 2026-10-01";

    let (status, body) = app
        .post(&uri, OPERATOR, json!({ "justification": justification }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "Unauthorized");

    let (status, body) = app
        .post(&uri, ADMIN, json!({ "justification": "looks fine" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "Validation");

    let (status, body) = app
        .post(
            &uri,
            ADMIN,
            json!({
                "justification": justification,
                "evidence": [{ "kind": "inspection_report", "inspector": "J. Doe", "summary": "All panels online" }],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "MANUAL_OVERRIDE");

    let (_, view) = app
        .get(&format!("/api/milestones/{}/verification", milestone_id))
        .await;
    assert_eq!(view["data"]["status"], "MANUAL_OVERRIDE");
    assert_eq!(view["data"]["history"][0]["justification"], justification);
}

#[tokio::test]
async fn requests_without_an_actor_are_refused() {
    let app = TestApp::new();
    let (status, body) = app
        .send("POST", "/api/allocations", None, Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "Unauthorized");
}

#[tokio::test]
async fn unknown_evidence_shape_is_rejected() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;

    let (status, body) = app
        .post(
            &format!("/api/milestones/{}/verifications", milestone_id),
            OPERATOR,
            json!({ "evidence": [{ "kind": "photo", "url": "https://example.org/p.jpg" }] }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "Validation");
}

#[tokio::test]
async fn deactivated_feeds_are_ignored_by_verification() {
    let app = TestApp::new();
    let (milestone_id, feed_id) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;

    let (status, body) = app
        .send("DELETE", &format!("/api/feeds/{}", feed_id), Some(OPERATOR), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], false);

    let (_, body) = app
        .post(
            &format!("/api/milestones/{}/verifications", milestone_id),
            OPERATOR,
            json!({}),
        )
        .await;
    assert_eq!(body["data"]["status"], "FAILED");
    assert_eq!(body["data"]["failure_reason"], "ConsensusNotReached");
}

#[tokio::test]
async fn high_value_release_needs_two_approvals() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;
    let (_, verified) = app
        .post(
            &format!("/api/milestones/{}/verifications", milestone_id),
            OPERATOR,
            json!({}),
        )
        .await;
    assert_eq!(verified["data"]["status"], "VERIFIED");

    // $50,000 in cents
    let allocation_id = create_allocation(&app, milestone_id, 5_000_000).await;
    let approvals_uri = format!("/api/allocations/{}/approvals", allocation_id);
    let release_uri = format!("/api/allocations/{}/release", allocation_id);
    let release_body = json!({ "recipient": "GDEVELOPERWALLET", "amount": 5_000_000 });

    let (status, _) = app.post(&approvals_uri, APPROVER_A, json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.post(&release_uri, OPERATOR, release_body.clone()).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "InsufficientApprovals");

    let (_, count) = app.post(&approvals_uri, APPROVER_B, json!({})).await;
    assert_eq!(count["data"]["approvals"], 2);

    let (status, body) = app.post(&release_uri, OPERATOR, release_body.clone()).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "CONFIRMED");
    assert!(body["data"]["external_ref"].as_str().unwrap().starts_with("sim_"));

    let (status, body) = app.post(&release_uri, OPERATOR, release_body).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "AlreadyReleased");

    let (_, trail) = app
        .get(&format!("/api/milestones/{}/audit", milestone_id))
        .await;
    let kinds: Vec<&str> = trail["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds.first(), Some(&"release_decision"));
    assert!(kinds.contains(&"release_execution"));
    assert!(kinds.contains(&"verification_started"));
}

#[tokio::test]
async fn approvals_need_an_approving_role() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;
    let allocation_id = create_allocation(&app, milestone_id, 1_000).await;

    let (status, body) = app
        .post(&format!("/api/allocations/{}/approvals", allocation_id), OPERATOR, json!({}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "Unauthorized");
}

#[tokio::test]
async fn release_before_verification_is_refused() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;
    let allocation_id = create_allocation(&app, milestone_id, 1_000).await;

    let (status, body) = app
        .post(
            &format!("/api/allocations/{}/release", allocation_id),
            OPERATOR,
            json!({ "recipient": "GDEVELOPERWALLET", "amount": 1_000 }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "NotVerified");

    let (status, body) = app
        .post(
            &format!("/api/allocations/{}/release", allocation_id),
            OPERATOR,
            json!({ "recipient": "GSOMEONEELSE", "amount": 1_000 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "Validation");
}

#[tokio::test]
async fn performance_stats_cover_verification() {
    let app = TestApp::new();
    let (milestone_id, _) = milestone_with_readings(&app, &[100.0, 101.0, 99.0]).await;
    app.post(
        &format!("/api/milestones/{}/verifications", milestone_id),
        OPERATOR,
        json!({}),
    )
    .await;

    let (status, body) = app.get("/api/audit/stats?operation=verification").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["operation"], "verification");
    assert_eq!(body["data"][0]["sample_count"], 1);

    let (_, summary) = app
        .get(&format!("/api/audit/summary?milestone_id={}", milestone_id))
        .await;
    assert!(summary["data"]["total"].as_u64().unwrap() >= 4);
}
