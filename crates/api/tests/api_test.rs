use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use billing_api::create_app;
use billing_core::models::{InternalTaskState, LifecycleStage, ManagerState};
use billing_domain::{paths, BillingCopy, ManagerKind};
use billing_testing_utils::{at, InternalTaskBuilder, ManagerMetadataBuilder, TestHarness};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn onboarding_body(account: &str) -> Value {
    json!({
        "billing_account_id": account,
        "customer_id": "customer-1",
        "project_id": "customer-project",
        "dataset_id": "billing_export",
        "table_id": "gcp_billing_export_v1"
    })
}

#[tokio::test]
async fn test_health_check() {
    let harness = TestHarness::new();
    let (status, body) = call(create_app(harness.context()), "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "billing-pipeline");
}

#[tokio::test]
async fn test_external_cycle_returns_report() {
    let harness = TestHarness::new();
    let (status, body) = call(
        create_app(harness.context()),
        "POST",
        "/managers/external/run",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["iteration"], 1);
    assert_eq!(body["data"]["dispatched"], 0);
}

#[tokio::test]
async fn test_held_lease_is_a_conflict() {
    let harness = TestHarness::new();
    harness
        .seed_manager(
            ManagerKind::Internal,
            ManagerMetadataBuilder::new()
                .with_iteration(4)
                .with_state(ManagerState::TasksCreated)
                .with_ttl(Utc::now() + Duration::minutes(30))
                .build(),
        )
        .await
        .unwrap();

    let (status, body) = call(
        create_app(harness.context()),
        "POST",
        "/managers/internal/run",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "LEASE_HELD");
    assert_eq!(body["error"]["code"], 409);
}

#[tokio::test]
async fn test_onboard_then_duplicate() {
    let harness = TestHarness::new();
    harness
        .tables
        .insert_rows(
            BillingCopy::Source,
            "NEW-001",
            [at("2024-06-01T00:00:00Z"), at("2024-06-03T00:00:00Z")],
        )
        .await;
    let app = create_app(harness.context());

    let (status, body) = call(
        app.clone(),
        "POST",
        "/accounts/onboard",
        Some(onboarding_body("NEW-001")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["location"], "US");
    let task = harness.internal_task("NEW-001").await.unwrap();
    assert_eq!(task.state, InternalTaskState::Onboarding);

    let (status, body) = call(
        app,
        "POST",
        "/accounts/onboard",
        Some(onboarding_body("NEW-001")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn test_offboard_validates_account() {
    let harness = TestHarness::new();
    harness
        .seed_internal(InternalTaskBuilder::new("AAA-111").build())
        .await
        .unwrap();
    let app = create_app(harness.context());

    let (status, _) = call(
        app.clone(),
        "POST",
        "/accounts/offboard",
        Some(json!({"billing_account_id": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        app.clone(),
        "POST",
        "/accounts/offboard",
        Some(json!({"billing_account_id": "MISSING"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        app,
        "POST",
        "/accounts/offboard",
        Some(json!({"billing_account_id": "AAA-111"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        harness.internal_task("AAA-111").await.unwrap().lifecycle_stage,
        LifecycleStage::Deprecated
    );
}

#[tokio::test]
async fn test_stage_callback_submits_job() {
    let harness = TestHarness::new();
    harness
        .seed_internal(
            InternalTaskBuilder::new("AAA-111")
                .with_state(InternalTaskState::Pending)
                .with_iteration(2)
                .with_segment(at("2024-05-01T00:00:00Z"), at("2024-05-02T00:00:00Z"))
                .build(),
        )
        .await
        .unwrap();
    let app = create_app(harness.context());
    let body = json!({"billing_account_id": "AAA-111", "iteration": 2});

    let (status, response) = call(app.clone(), "POST", paths::INTERNAL_TASK, Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"]["outcome"], "submitted");

    // 重复投递
    let (status, response) = call(app.clone(), "POST", paths::INTERNAL_TASK, Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"]["outcome"], "skipped");

    let stale = json!({"billing_account_id": "AAA-111", "iteration": 1});
    let (status, response) = call(app, "POST", paths::INTERNAL_TASK, Some(stale)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["error"]["type"], "STALE_ITERATION");
}

#[tokio::test]
async fn test_reconciliation_endpoints() {
    let harness = TestHarness::new();
    harness
        .seed_internal(InternalTaskBuilder::new("NEW-001").onboarding().build())
        .await
        .unwrap();
    let app = create_app(harness.context());

    let (status, body) = call(
        app.clone(),
        "POST",
        "/reconciliation/monitor",
        Some(json!({"billing_account_id": "NEW-001"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["skipped"], true);

    let (status, body) = call(app, "POST", "/reconciliation/sanity-check", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_reset_recreates_managers() {
    let harness = TestHarness::new();
    harness
        .seed_internal(InternalTaskBuilder::new("AAA-111").build())
        .await
        .unwrap();

    let (status, _) = call(create_app(harness.context()), "POST", "/admin/reset", None).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(harness.internal_task("AAA-111").await.unwrap_err().is_not_found());
    assert_eq!(
        harness.manager(ManagerKind::External).await.unwrap().state,
        ManagerState::Done
    );
}
