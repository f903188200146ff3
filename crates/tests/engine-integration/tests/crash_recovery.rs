//! Crash recovery: active jobs come back through lease expiry after a
//! restart, and durable blobs survive intact.

use std::time::Duration;

use imap_client::{QueuedMessage, SubmitEnvelope};
use kv_store::Store;
use queue_engine::{JobOptions, JobStatus, QueueEngine, QueueName, SubmitPayload};

#[tokio::test]
async fn active_jobs_and_blobs_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.mp");

    let queue_params = queue_engine::Params {
        lease: Duration::from_millis(300),
        queue_keep: 100,
    };

    let job_id;
    {
        // First process: enqueue, reserve, then "crash" mid-processing.
        let store = Store::open(kv_store::Params {
            prefix: String::new(),
            snapshot_path: Some(path.clone()),
        })
        .await
        .unwrap();
        let queue = QueueEngine::new(store.clone(), QueueName::Submit, queue_params.clone());

        let blob = QueuedMessage {
            raw: b"Subject: survivor\r\n\r\nstill here\r\n".to_vec(),
            envelope: SubmitEnvelope {
                mail_from: "a1@example.com".to_string(),
                rcpt_to: vec!["rcpt@example.com".to_string()],
            },
        };
        queue_engine::store_message_blob(
            &store,
            "a1",
            "q-1",
            rmp_serde::to_vec_named(&blob).unwrap(),
        )
        .await
        .unwrap();

        let payload = SubmitPayload {
            account: "a1".to_string(),
            queue_id: "q-1".to_string(),
            message_id: "<s@example.com>".to_string(),
        };
        job_id = queue
            .enqueue(
                serde_json::to_vec(&payload).unwrap(),
                JobOptions::default(),
            )
            .await
            .unwrap();

        let reserved = queue.reserve("crashed-worker").await.unwrap().unwrap();
        assert_eq!(reserved.job.id, job_id);
        // The process dies here: no ack, no fail.
    }

    // Second process: reopen from the snapshot.
    let store = Store::open(kv_store::Params {
        prefix: String::new(),
        snapshot_path: Some(path),
    })
    .await
    .unwrap();
    let queue = QueueEngine::new(store.clone(), QueueName::Submit, queue_params);

    // The job is still leased until the lease expires.
    assert!(queue.reserve("restarted-worker").await.unwrap().is_none());
    let job = queue.job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Active);

    tokio::time::sleep(Duration::from_millis(400)).await;
    queue.promote_due().await.unwrap();

    let reserved = queue.reserve("restarted-worker").await.unwrap().unwrap();
    assert_eq!(reserved.job.id, job_id);
    assert_eq!(reserved.job.attempts_made, 0);

    // Nothing was lost: the durable blob decodes to the original message.
    let raw = queue_engine::load_message_blob(&store, "a1", "q-1")
        .await
        .unwrap()
        .expect("blob must survive the crash");
    let decoded: QueuedMessage = rmp_serde::from_slice(&raw).unwrap();
    assert_eq!(decoded.envelope.mail_from, "a1@example.com");

    queue.ack(&reserved.lease, None).await.unwrap();
}
