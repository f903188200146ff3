//! Submission retries: bounded attempts with exponential spacing, blob
//! cleanup and the terminal `messageFailed` notification.

use std::time::Duration;

use account_registry::AccountState;
use imap_client::{OpError, QueuedMessage, SubmitEnvelope, SubmitReceipt};
use queue_engine::{JobOptions, SubmitPayload};

use engine_integration::{TestEngine, WebhookServer, test_account};

/// Store a blob and its submit job directly, as the queue API contract
/// describes: `{attempts: 3, baseDelayMs: 100}`.
async fn enqueue_submission(engine: &TestEngine, account: &str, queue_id: &str) {
    let blob = QueuedMessage {
        raw: b"Message-ID: <q@example.com>\r\nSubject: queued\r\n\r\nhello\r\n".to_vec(),
        envelope: SubmitEnvelope {
            mail_from: format!("{account}@example.com"),
            rcpt_to: vec!["rcpt@example.com".to_string()],
        },
    };
    queue_engine::store_message_blob(
        &engine.store,
        account,
        queue_id,
        rmp_serde::to_vec_named(&blob).unwrap(),
    )
    .await
    .unwrap();

    let payload = SubmitPayload {
        account: account.to_string(),
        queue_id: queue_id.to_string(),
        message_id: "<q@example.com>".to_string(),
    };
    engine
        .submit_queue
        .enqueue(
            serde_json::to_vec(&payload).unwrap(),
            JobOptions {
                attempts: 3,
                backoff_base: Duration::from_millis(100),
                dedupe_key: Some(format!("{account}:{queue_id}")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_submissions_retry_then_fail_with_notification() {
    let engine = TestEngine::start(1).await;
    let server = WebhookServer::start(200).await;
    engine.enable_webhooks(&server.url).await;

    engine.registry.create(test_account("a1")).await.unwrap();
    engine.wait_for_state("a1", AccountState::Connected).await;

    // Every submit attempt fails at the transport level.
    engine.connector.script_submits(
        "a1",
        (0..3)
            .map(|n| Err(OpError::transport(format!("connection refused {n}"))))
            .collect(),
    );

    enqueue_submission(&engine, "a1", "q-1").await;

    // Three attempts, exponentially spaced.
    for _ in 0..200 {
        if engine.submit_queue.counts().await.unwrap().failed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let times = engine.connector.submit_times();
    assert_eq!(times.len(), 3, "expected exactly three attempts");
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(
        (80..=1_000).contains(&first_gap),
        "first retry after {first_gap}ms"
    );
    assert!(
        second_gap >= first_gap,
        "backoff shrank: {first_gap}ms then {second_gap}ms"
    );

    // Terminal failure: job retained, blob gone, user informed.
    let counts = engine.submit_queue.counts().await.unwrap();
    assert_eq!(counts.failed, 1);
    let blob = queue_engine::load_message_blob(&engine.store, "a1", "q-1")
        .await
        .unwrap();
    assert!(blob.is_none(), "terminal failure must drop the blob");

    let deliveries = server.wait_for_deliveries(1).await;
    let failed = deliveries
        .iter()
        .find(|delivery| delivery.body["event"] == "messageFailed")
        .expect("no messageFailed notification");
    assert_eq!(failed.body["data"]["queueId"], "q-1");
    assert_eq!(failed.body["data"]["messageId"], "<q@example.com>");

    engine.shutdown.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_submission_cleans_up_and_reports_sent() {
    let engine = TestEngine::start(1).await;
    let server = WebhookServer::start(200).await;
    engine.enable_webhooks(&server.url).await;

    engine.registry.create(test_account("a1")).await.unwrap();
    engine.wait_for_state("a1", AccountState::Connected).await;

    engine.connector.script_submits(
        "a1",
        vec![Ok(SubmitReceipt {
            response: "250 2.0.0 accepted".to_string(),
            message_id: "<q@example.com>".to_string(),
        })],
    );

    enqueue_submission(&engine, "a1", "q-2").await;

    for _ in 0..200 {
        if engine.submit_queue.counts().await.unwrap().completed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(engine.submit_queue.counts().await.unwrap().completed, 1);

    let blob = queue_engine::load_message_blob(&engine.store, "a1", "q-2")
        .await
        .unwrap();
    assert!(blob.is_none(), "completion must drop the blob");

    let deliveries = server.wait_for_deliveries(1).await;
    let sent = deliveries
        .iter()
        .find(|delivery| delivery.body["event"] == "messageSent")
        .expect("no messageSent notification");
    assert_eq!(sent.body["data"]["response"], "250 2.0.0 accepted");

    engine.shutdown.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_blob_drops_the_job_silently() {
    let engine = TestEngine::start(1).await;

    engine.registry.create(test_account("a1")).await.unwrap();
    engine.wait_for_state("a1", AccountState::Connected).await;

    // A job whose blob was already deleted (account deletion race).
    let payload = SubmitPayload {
        account: "a1".to_string(),
        queue_id: "q-gone".to_string(),
        message_id: String::new(),
    };
    engine
        .submit_queue
        .enqueue(
            serde_json::to_vec(&payload).unwrap(),
            JobOptions::default(),
        )
        .await
        .unwrap();

    for _ in 0..200 {
        if engine.submit_queue.counts().await.unwrap().completed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let counts = engine.submit_queue.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);
    assert!(engine.connector.submit_times().is_empty());

    engine.shutdown.send(true).unwrap();
}
