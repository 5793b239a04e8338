use crate::helpers::{spawn_app, spawn_app_with};
use newsletter_delivery::domain::SuppressionReason;
use newsletter_delivery::store::{EventStore, SuppressionStore};

fn bounce(event_id: &str, email: &str, kind: &str) -> serde_json::Value {
    serde_json::json!([{
        "email": email,
        "event": "bounce",
        "type": kind,
        "sg_event_id": event_id,
        "status": "5.1.1",
        "reason": "550 unknown user"
    }])
}

#[tokio::test]
async fn a_signed_bounce_is_acknowledged_and_suppresses_the_address() {
    // arrange
    let app = spawn_app().await;

    // act
    let response = app.post_sendgrid(&bounce("sg-1", "gone@example.com", "bounce")).await;

    // assert
    assert_eq!(200, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["processed"], 1);
    let entry = app.store.get_suppression("gone@example.com").await.unwrap().unwrap();
    assert_eq!(entry.reason, SuppressionReason::HardBounce);
    assert_eq!(entry.error_message.as_deref(), Some("550 unknown user"));
}

#[tokio::test]
async fn redelivered_events_are_recorded_once() {
    // arrange
    let app = spawn_app().await;
    let payload = bounce("sg-1", "gone@example.com", "blocked");

    // act
    app.post_sendgrid(&payload).await;
    let response = app.post_sendgrid(&payload).await;

    // assert
    assert_eq!(200, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["processed"], 0);
    assert_eq!(app.store.events_for("gone@example.com").await.unwrap().len(), 1);
}

#[tokio::test]
async fn unsigned_requests_are_rejected_with_a_401() {
    // arrange
    let app = spawn_app().await;
    let test_cases = vec![
        ("sendgrid", vec![]),
        (
            "sendgrid",
            vec![
                ("X-Twilio-Email-Event-Webhook-Signature", "bm9wZQ=="),
                ("X-Twilio-Email-Event-Webhook-Timestamp", "1"),
            ],
        ),
        // no Mailgun key is configured in tests
        ("mailgun", vec![]),
    ];

    for (provider, headers) in test_cases {
        // act
        let mut request = app
            .post(&format!("/webhooks?provider={}", provider))
            .header("Content-Type", "application/json")
            .body(r#"[{"email":"a@example.com","event":"spamreport"}]"#);
        for (name, value) in &headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await.expect("Failed to execute request.");

        // assert
        assert_eq!(
            401,
            response.status().as_u16(),
            "The API did not reject a {} request with headers {:?}",
            provider,
            headers
        );
    }
    assert!(app.store.events_for("a@example.com").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_providers_and_garbage_bodies_are_a_400() {
    // arrange
    let app = spawn_app().await;

    // act
    let unknown = app
        .post("/webhooks?provider=sparkpost")
        .body("[]")
        .send()
        .await
        .expect("Failed to execute request.");
    let garbage = app
        .post("/webhooks?provider=sendgrid")
        .body("not json")
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(400, unknown.status().as_u16());
    assert_eq!(400, garbage.status().as_u16());
}

#[tokio::test]
async fn callers_over_the_rate_limit_get_a_429_with_retry_after() {
    // arrange
    let app = spawn_app_with(|c| c.webhooks.rate_limit_per_minute = 1).await;
    let payload = serde_json::json!([]);

    // act
    let first = app.post_sendgrid(&payload).await;
    let second = app.post_sendgrid(&payload).await;

    // assert
    assert_eq!(200, first.status().as_u16());
    assert_eq!(429, second.status().as_u16());
    let retry_after: u64 = second
        .headers()
        .get("Retry-After")
        .expect("Retry-After header missing")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
}
