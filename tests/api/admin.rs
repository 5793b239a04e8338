use crate::helpers::spawn_app;
use newsletter_delivery::domain::SuppressionReason;
use newsletter_delivery::store::SuppressionStore;
use uuid::Uuid;

#[tokio::test]
async fn admin_endpoints_reject_anonymous_and_wrong_passwords() {
    // arrange
    let app = spawn_app().await;

    // act
    let anonymous = app
        .api_client
        .get(&format!("{}/admin/queue", &app.address))
        .send()
        .await
        .expect("Failed to execute request.");
    let wrong_password = app
        .api_client
        .get(&format!("{}/admin/queue", &app.address))
        .basic_auth(&app.admin.username, Some(Uuid::new_v4().to_string()))
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(401, anonymous.status().as_u16());
    assert_eq!(r#"Basic realm="admin""#, anonymous.headers()["WWW-Authenticate"]);
    assert_eq!(401, wrong_password.status().as_u16());
}

#[tokio::test]
async fn suppressions_can_be_added_looked_up_and_removed() {
    // arrange
    let app = spawn_app().await;

    // act - part 1: add
    let response = app
        .admin_post("/admin/suppressions")
        .json(&serde_json::json!({"email": "Reader@Example.com"}))
        .send()
        .await
        .expect("Failed to execute request.");

    // assert - part 1
    assert_eq!(201, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["email"], "reader@example.com");
    assert_eq!(body["reason"], "MANUAL");
    assert_eq!(body["source"], app.admin.username.as_str());

    // act - part 2: look up
    let found = app
        .admin_get("/admin/suppressions/reader@example.com")
        .send()
        .await
        .expect("Failed to execute request.");
    assert_eq!(200, found.status().as_u16());

    // act - part 3: remove twice
    let removed = app
        .admin_delete("/admin/suppressions/reader@example.com")
        .send()
        .await
        .expect("Failed to execute request.");
    let removed_again = app
        .admin_delete("/admin/suppressions/reader@example.com")
        .send()
        .await
        .expect("Failed to execute request.");

    // assert - parts 2 and 3
    assert_eq!(204, removed.status().as_u16());
    assert_eq!(404, removed_again.status().as_u16());
    assert!(app.store.get_suppression("reader@example.com").await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_suppression_addresses_are_a_400() {
    // arrange
    let app = spawn_app().await;

    // act
    let response = app
        .admin_post("/admin/suppressions")
        .json(&serde_json::json!({"email": "not-an-email", "reason": "COMPLAINT"}))
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(400, response.status().as_u16());
}

#[tokio::test]
async fn bulk_imports_report_added_and_failed_rows() {
    // arrange
    let app = spawn_app().await;
    let body = serde_json::json!([
        {"email": "one@example.com", "reason": "HARD_BOUNCE"},
        {"email": "two@example.com", "reason": "COMPLAINT", "source": "legacy-import"},
        {"email": "broken", "reason": "MANUAL"},
    ]);

    // act
    let response = app
        .admin_post("/admin/suppressions/bulk")
        .json(&body)
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(200, response.status().as_u16());
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["added"], 2);
    assert_eq!(report["failed"], 1);
    let one = app.store.get_suppression("one@example.com").await.unwrap().unwrap();
    assert_eq!(one.reason, SuppressionReason::HardBounce);
    assert_eq!(one.source.as_deref(), Some(app.admin.username.as_str()));
    let two = app.store.get_suppression("two@example.com").await.unwrap().unwrap();
    assert_eq!(two.source.as_deref(), Some("legacy-import"));
}

#[tokio::test]
async fn queue_overview_reports_stats_and_throttle_usage() {
    // arrange
    let app = spawn_app().await;

    // act
    let response = app
        .admin_get("/admin/queue")
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(200, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["stats"]["queued"], 0);
    assert!(body["throttle"].is_array());
    assert!(body["warmupCap"].is_null());
}

#[tokio::test]
async fn scheduler_status_is_exposed() {
    // arrange
    let app = spawn_app().await;

    // act
    let response = app
        .admin_get("/admin/scheduler")
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(200, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["isRunning"], false);
}

#[tokio::test]
async fn dlq_endpoints_validate_input_and_report_skips() {
    // arrange
    let app = spawn_app().await;
    let unknown = Uuid::new_v4();

    // act
    let listing = app
        .admin_get("/admin/dlq?page=1&per_page=10")
        .send()
        .await
        .expect("Failed to execute request.");
    let bad_threshold = app
        .admin_post("/admin/dlq/move")
        .json(&serde_json::json!({"campaignId": unknown, "minAttempts": 0}))
        .send()
        .await
        .expect("Failed to execute request.");
    let moved = app
        .admin_post("/admin/dlq/move")
        .json(&serde_json::json!({"campaignId": unknown}))
        .send()
        .await
        .expect("Failed to execute request.");
    let redrive = app
        .admin_post("/admin/dlq/redrive")
        .json(&serde_json::json!({"ids": [unknown]}))
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(200, listing.status().as_u16());
    let listing: serde_json::Value = listing.json().await.unwrap();
    assert_eq!(listing["total"], 0);
    assert_eq!(listing["perPage"], 10);
    assert_eq!(400, bad_threshold.status().as_u16());
    let moved: serde_json::Value = moved.json().await.unwrap();
    assert_eq!(moved["moved"], 0);
    let redrive: serde_json::Value = redrive.json().await.unwrap();
    assert_eq!(redrive["succeeded"], 0);
    assert_eq!(redrive["skipped"][0]["id"], unknown.to_string());
}
