use crate::helpers::spawn_app;
use chrono::Duration;
use newsletter_delivery::clock::Clock;
use newsletter_delivery::domain::{DeliveryStatus, SuppressionReason};
use newsletter_delivery::store::{DeliveryStore, SuppressionStore};
use uuid::Uuid;

fn campaign_body(scheduled_at: Option<chrono::DateTime<chrono::Utc>>) -> serde_json::Value {
    serde_json::json!({
        "title": "October issue",
        "subject": "News from the newsroom",
        "templateId": "monthly-digest",
        "scheduledAt": scheduled_at,
    })
}

#[tokio::test]
async fn creating_a_campaign_requires_authentication() {
    // arrange
    let app = spawn_app().await;

    // act
    let response = app
        .post("/campaigns")
        .json(&campaign_body(None))
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(401, response.status().as_u16());
    assert_eq!(
        r#"Basic realm="admin""#,
        response.headers()["WWW-Authenticate"]
    );
}

#[tokio::test]
async fn invalid_campaigns_are_rejected_with_a_400() {
    // arrange
    let app = spawn_app().await;
    let test_cases = vec![
        (
            serde_json::json!({"title": " ", "subject": "s", "templateId": "t"}),
            "blank title",
        ),
        (
            serde_json::json!({
                "title": "t", "subject": "s", "templateId": "t",
                "recipientFilter": {
                    "statuses": ["ACTIVE"],
                    "subscribedAfter": "2024-02-01T00:00:00Z",
                    "subscribedBefore": "2024-01-01T00:00:00Z"
                }
            }),
            "inverted date range",
        ),
        (serde_json::json!({"title": "t"}), "missing fields"),
    ];

    for (body, description) in test_cases {
        // act
        let response = app.create_campaign(&body).await;

        // assert
        assert_eq!(
            400,
            response.status().as_u16(),
            "The API did not fail with 400 Bad Request when the payload had a {}.",
            description
        );
    }
}

#[tokio::test]
async fn unscheduled_campaigns_are_drafts_and_scheduled_ones_can_be_cancelled() {
    // arrange
    let app = spawn_app().await;
    let later = app.clock.now() + Duration::hours(2);

    // act
    let draft: serde_json::Value = app.create_campaign(&campaign_body(None)).await.json().await.unwrap();
    let scheduled_response = app.create_campaign(&campaign_body(Some(later))).await;
    assert_eq!(201, scheduled_response.status().as_u16());
    let scheduled: serde_json::Value = scheduled_response.json().await.unwrap();
    let cancelled = app
        .admin_post(&format!("/campaigns/{}/cancel", scheduled["id"].as_str().unwrap()))
        .send()
        .await
        .expect("Failed to execute request.");
    let cancel_draft = app
        .admin_post(&format!("/campaigns/{}/cancel", draft["id"].as_str().unwrap()))
        .send()
        .await
        .expect("Failed to execute request.");
    let missing = app
        .admin_post(&format!("/campaigns/{}/cancel", Uuid::new_v4()))
        .send()
        .await
        .expect("Failed to execute request.");

    // assert
    assert_eq!(draft["status"], "DRAFT");
    assert_eq!(200, cancelled.status().as_u16());
    let cancelled: serde_json::Value = cancelled.json().await.unwrap();
    assert_eq!(cancelled["status"], "DRAFT");
    assert_eq!(409, cancel_draft.status().as_u16());
    assert_eq!(404, missing.status().as_u16());
}

#[tokio::test]
async fn a_due_campaign_is_sent_and_bounces_feed_the_suppression_list() {
    // arrange
    let app = spawn_app().await;
    for email in ["one@example.com", "two@example.com", "three@example.com"] {
        app.add_subscriber(email).await;
    }
    let campaign: serde_json::Value = app.create_campaign(&campaign_body(None)).await.json().await.unwrap();
    let campaign_id: Uuid = campaign["id"].as_str().unwrap().parse().unwrap();

    // act - part 1: send now and run the scheduler
    let send = app
        .admin_post(&format!("/campaigns/{}/send", campaign_id))
        .send()
        .await
        .expect("Failed to execute request.");
    assert_eq!(200, send.status().as_u16());
    let run: serde_json::Value = app
        .admin_post("/admin/scheduler/run")
        .send()
        .await
        .expect("Failed to execute request.")
        .json()
        .await
        .unwrap();

    // assert - part 1
    assert_eq!(run["campaignsStarted"], 1);
    assert_eq!(run["deliveries"]["accepted"], 3);
    assert_eq!(app.email_client.sent_emails.lock().unwrap().len(), 3);

    // act - part 2: the provider reports a bounce for one recipient
    let bounce = serde_json::json!([{
        "email": "two@example.com",
        "event": "bounce",
        "type": "bounce",
        "sg_event_id": "sg-bounce-1",
        "campaign_id": campaign_id.to_string(),
    }]);
    let response = app.post_sendgrid(&bounce).await;

    // assert - part 2
    assert_eq!(200, response.status().as_u16());
    let delivery = app
        .store
        .find_delivery(campaign_id, "two@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Bounced);
    assert!(delivery.bounced_at.is_some());
    let entry = app.store.get_suppression("two@example.com").await.unwrap().unwrap();
    assert_eq!(entry.reason, SuppressionReason::HardBounce);
    assert_eq!(entry.source, Some(campaign_id.to_string()));
}
