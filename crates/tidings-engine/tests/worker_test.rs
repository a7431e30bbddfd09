//! Delivery worker tests against mock storage and a mock endpoint.
//!
//! Exercises the full classification table: 2xx commit, 4xx permanent
//! failure, 5xx retry with backoff, exhausted attempts, circuit-open
//! fast failure, and the idempotency guards.

use std::{sync::Arc, time::Duration};

use chrono::{NaiveDate, TimeZone, Utc};
use tidings_core::{models::QueueJob, Clock, SendStatus};
use tidings_engine::{
    storage::{mock::MockEngineStorage, EngineStorage},
    CircuitState, ClientConfig, DeliveryConfig, EmailClient, EngineStats,
};
use tidings_testing::{fixtures, TestClock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct TestRig {
    storage: Arc<MockEngineStorage>,
    clock: Arc<TestClock>,
    worker: tidings_engine::worker::DeliveryWorker,
    circuit: Arc<tidings_engine::CircuitBreaker>,
}

fn start_instant() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
}

fn rig(server_uri: &str) -> TestRig {
    let storage = Arc::new(MockEngineStorage::new());
    let clock = Arc::new(TestClock::starting_at(start_instant()));
    let config = DeliveryConfig {
        client_config: ClientConfig {
            api_url: format!("{server_uri}/send-email"),
            timeout: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = Arc::new(EmailClient::new(config.client_config.clone()).unwrap());
    let circuit = Arc::new(tidings_engine::CircuitBreaker::new(config.circuit_config.clone()));
    let worker = tidings_engine::worker::DeliveryWorker::new(
        0,
        storage.clone(),
        config,
        client,
        circuit.clone(),
        Arc::new(tokio::sync::RwLock::new(EngineStats::default())),
        CancellationToken::new(),
        clock.clone(),
    );

    TestRig { storage, clock, worker, circuit }
}

/// Seeds a pending send plus its queued job, returning the idempotency
/// key.
async fn seed_pending_send(rig: &TestRig, email: &str) -> String {
    let birth = NaiveDate::from_ymd_opt(1990, 1, 15).unwrap();
    let recipient = fixtures::recipient("John", "Doe", email, birth, "America/New_York");
    let scheduled_date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();

    let new_send = fixtures::new_birthday_send(
        recipient.id,
        scheduled_date,
        start_instant(),
        SendStatus::Pending,
    );
    let key = new_send.idempotency_key();

    rig.storage.insert_recipient(recipient.clone()).await;
    rig.storage.create_send_if_absent(new_send).await.unwrap();
    rig.storage
        .enqueue_job(tidings_engine::storage::mock::due_job(
            &key,
            recipient.id,
            rig.clock.now_utc(),
        ))
        .await
        .unwrap();

    key
}

async fn claim_one(rig: &TestRig) -> QueueJob {
    let jobs = rig.storage.claim_due_jobs(10, rig.clock.now_utc()).await.unwrap();
    assert_eq!(jobs.len(), 1, "expected exactly one due job");
    jobs.into_iter().next().unwrap()
}

#[tokio::test]
async fn successful_delivery_commits_sent() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/send-email"))
        .and(matchers::body_json(serde_json::json!({
            "email": "john@x",
            "message": "Hey, John Doe it's your birthday",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;

    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Sent);
    assert_eq!(send.attempt_count, 1);
    assert!(send.sent_at.is_some());
    assert!(send.error_message.is_none());
    assert!(rig.storage.all_jobs().await.is_empty(), "completed job must be removed");

    server.verify().await;
}

#[tokio::test]
async fn server_error_schedules_retry_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;

    let before = rig.clock.now_utc();
    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Retrying);
    assert_eq!(send.attempt_count, 1);
    assert!(send.error_message.as_deref().unwrap_or_default().contains("HTTP 503"));

    let job = rig.storage.job(&key).await.unwrap();
    assert_eq!(job.attempts_made, 1);
    // First retry backs off by 2s.
    assert_eq!(job.run_at, before + chrono::Duration::seconds(2));
}

#[tokio::test]
async fn transient_errors_then_success_ends_sent_after_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;

    for _ in 0..3 {
        // Jump past any backoff so the job is claimable again.
        rig.clock.advance(Duration::from_secs(60));
        let job = claim_one(&rig).await;
        rig.worker.process_job(&job).await.unwrap();
    }

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Sent);
    assert_eq!(send.attempt_count, 3);
    assert!(send.error_message.is_none(), "success clears the error detail");
    assert!(rig.storage.all_jobs().await.is_empty());
}

#[tokio::test]
async fn client_error_fails_permanently_without_retry() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad address"))
        .expect(1)
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "nope").await;

    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Failed);
    assert!(send.error_message.as_deref().unwrap_or_default().contains("HTTP 422"));
    assert!(
        rig.storage.all_jobs().await.is_empty(),
        "permanent failures acknowledge the job instead of retrying"
    );

    server.verify().await;
}

#[tokio::test]
async fn exhausted_attempts_finalise_failed_and_retain_job() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;

    for _ in 0..5 {
        rig.clock.advance(Duration::from_secs(120));
        let job = claim_one(&rig).await;
        rig.worker.process_job(&job).await.unwrap();
    }

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Failed);
    assert_eq!(send.attempt_count, 5);

    let job = rig.storage.job(&key).await.unwrap();
    assert_eq!(job.status, tidings_core::JobStatus::Failed);
    assert!(job.last_error.is_some());
}

#[tokio::test]
async fn already_sent_record_acknowledges_duplicate_job() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;

    // Walk the record to sent through legal transitions.
    let send = rig.storage.send_by_key(&key).await.unwrap();
    rig.storage.transition_send(send.id, SendStatus::Processing, None).await.unwrap();
    rig.storage.transition_send(send.id, SendStatus::Sent, None).await.unwrap();

    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Sent);
    assert_eq!(send.attempt_count, 1, "duplicate job must not add an attempt");
    assert!(rig.storage.all_jobs().await.is_empty());

    server.verify().await;
}

#[tokio::test]
async fn deleted_recipient_finalises_failed_without_delivery() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;

    // Soft-delete the recipient after planning.
    let send = rig.storage.send_by_key(&key).await.unwrap();
    let mut recipient = rig.storage.find_recipient(send.recipient_id).await.unwrap().unwrap();
    recipient.deleted_at = Some(Utc::now());
    rig.storage.insert_recipient(recipient).await;

    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Failed);
    assert_eq!(send.error_message.as_deref(), Some("recipient unavailable"));
    assert!(rig.storage.all_jobs().await.is_empty());

    server.verify().await;
}

#[tokio::test]
async fn job_without_record_is_failed_terminally() {
    let server = MockServer::start().await;
    let rig = rig(&server.uri());

    let orphan_id = format!("{}:birthday:2024-01-15", Uuid::new_v4());
    rig.storage
        .enqueue_job(tidings_engine::storage::mock::due_job(
            &orphan_id,
            tidings_core::RecipientId::new(),
            rig.clock.now_utc(),
        ))
        .await
        .unwrap();

    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let job = rig.storage.job(&orphan_id).await.unwrap();
    assert_eq!(job.status, tidings_core::JobStatus::Failed);
}

#[tokio::test]
async fn open_circuit_fails_fast_and_schedules_retry() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;
    rig.circuit.force_state(CircuitState::Open).await;

    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Retrying);
    assert!(send
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("circuit breaker open"));

    let job = rig.storage.job(&key).await.unwrap();
    assert_eq!(job.status, tidings_core::JobStatus::Queued);

    server.verify().await;
}

#[tokio::test]
async fn cancelled_record_drops_obsolete_job() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let rig = rig(&server.uri());
    let key = seed_pending_send(&rig, "john@x").await;

    // A birthdate edit cancelled the record after the job was claimed.
    let send = rig.storage.send_by_key(&key).await.unwrap();
    rig.storage
        .transition_send(send.id, SendStatus::Failed, Some("cancelled due to birthdate change".into()))
        .await
        .unwrap();

    let job = claim_one(&rig).await;
    rig.worker.process_job(&job).await.unwrap();

    let send = rig.storage.send_by_key(&key).await.unwrap();
    assert_eq!(send.status, SendStatus::Failed);
    assert_eq!(send.attempt_count, 0, "obsolete job must not start an attempt");
    assert!(rig.storage.all_jobs().await.is_empty());

    server.verify().await;
}
