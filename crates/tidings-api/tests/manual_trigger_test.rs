//! Manual trigger endpoint tests over mock storage.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{NaiveDate, TimeZone, Utc};
use tidings_api::{create_router, AppState, Config};
use tidings_core::EventBus;
use tidings_engine::{
    storage::{mock::MockEngineStorage, EngineStorage},
    HourlySweeper, SweeperConfig,
};
use tidings_testing::{fixtures, TestClock};
use tower::util::ServiceExt;

fn router_with_storage(storage: Arc<MockEngineStorage>, now: chrono::DateTime<Utc>) -> axum::Router {
    let clock = Arc::new(TestClock::starting_at(now));
    let sweeper = Arc::new(HourlySweeper::new(storage, clock, SweeperConfig::default()));
    let state = AppState::new(sweeper, Arc::new(EventBus::new()));
    create_router(state, &Config::default())
}

async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = router_with_storage(
        Arc::new(MockEngineStorage::new()),
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    );

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("X-Request-Id"));

    let body = response_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn manual_trigger_forces_dispatch_before_send_hour() {
    // Early morning on the recipient's birthday; the record's send
    // instant is hours away, so a normal sweep would leave it. The
    // trigger bypasses the clock gate entirely.
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
    let storage = Arc::new(MockEngineStorage::new());

    let recipient =
        fixtures::recipient("John", "Doe", "john@x", NaiveDate::from_ymd_opt(1990, 6, 1).unwrap(), "America/New_York");
    storage.insert_recipient(recipient.clone()).await;

    // 06:00Z on June 1 is 02:00 in New York; 09:00 local is 13:00Z and
    // has not arrived yet.
    let send = fixtures::new_birthday_send(
        recipient.id,
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap(),
        tidings_core::SendStatus::Pending,
    );
    let key = send.idempotency_key();
    storage.create_send_if_absent(send).await.unwrap();

    let app = router_with_storage(storage.clone(), now);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/manual/send-birthday-message")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["queued"], 1);
    assert_eq!(body["data"]["skippedNotDue"], 0);
    assert_eq!(body["data"]["skippedAlreadyQueued"], 0);
    assert_eq!(body["data"]["failed"], 0);

    assert!(storage.job_exists(&key).await.unwrap(), "forced sweep must enqueue the record");
}

#[tokio::test]
async fn manual_trigger_reports_already_queued_records() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 0).unwrap();
    let storage = Arc::new(MockEngineStorage::new());

    let recipient = fixtures::recipient(
        "John",
        "Doe",
        "john@x",
        NaiveDate::from_ymd_opt(1990, 6, 1).unwrap(),
        "America/New_York",
    );
    storage.insert_recipient(recipient.clone()).await;

    let send = fixtures::new_birthday_send(
        recipient.id,
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap(),
        tidings_core::SendStatus::Pending,
    );
    let key = send.idempotency_key();
    storage.create_send_if_absent(send).await.unwrap();
    storage
        .enqueue_job(tidings_engine::storage::mock::due_job(&key, recipient.id, now))
        .await
        .unwrap();

    let app = router_with_storage(storage, now);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/manual/send-birthday-message")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = response_json(response).await;
    assert_eq!(body["data"]["queued"], 0);
    assert_eq!(body["data"]["skippedAlreadyQueued"], 1);
}
