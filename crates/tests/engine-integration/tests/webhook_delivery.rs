//! Webhook delivery: per-connection ordering, signatures, and the
//! permanent self-disable on 404/410.

use account_registry::AccountState;
use chrono::Utc;
use imap_client::{MessageEnvelope, SessionEvent};

use engine_integration::{TestEngine, WebhookServer, test_account};

fn message_new(id: &str) -> SessionEvent {
    SessionEvent::MessageNew {
        mailbox: "INBOX".to_string(),
        id: id.to_string(),
        internal_date: Utc::now(),
        envelope: MessageEnvelope {
            id: id.to_string(),
            subject: format!("message {id}"),
            from: "sender@example.com".to_string(),
            ..Default::default()
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_deliver_in_connection_order_with_signatures() {
    let engine = TestEngine::start(1).await;
    let server = WebhookServer::start(200).await;
    engine.enable_webhooks(&server.url).await;

    engine.registry.create(test_account("a1")).await.unwrap();
    engine.wait_for_state("a1", AccountState::Connected).await;
    let session = engine.connector.wait_for_session("a1").await;

    session.push(message_new("1")).await;
    session
        .push(SessionEvent::MessageDeleted {
            mailbox: "INBOX".to_string(),
            id: "0".to_string(),
        })
        .await;
    session.push(message_new("2")).await;

    let deliveries = server.wait_for_deliveries(3).await;

    let kinds: Vec<(String, String)> = deliveries
        .iter()
        .map(|delivery| {
            (
                delivery.body["event"].as_str().unwrap_or_default().to_string(),
                delivery.body["data"]["id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            )
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("messageNew".to_string(), "1".to_string()),
            ("messageDeleted".to_string(), "0".to_string()),
            ("messageNew".to_string(), "2".to_string()),
        ]
    );

    // Every delivery is signed and attributed.
    let service_secret = engine.settings.service_secret().await.unwrap();
    for delivery in &deliveries {
        assert_eq!(delivery.body["account"], "a1");
        assert!(delivery.body["nonce"].as_str().is_some_and(|n| !n.is_empty()));

        let signature = delivery
            .headers
            .iter()
            .find(|(name, _)| name == "x-webhook-signature")
            .map(|(_, value)| value.clone())
            .expect("delivery carried no signature");
        assert_eq!(signature, notify_worker::sign(&service_secret, &delivery.raw));

        let user_agent = delivery
            .headers
            .iter()
            .find(|(name, _)| name == "user-agent")
            .map(|(_, value)| value.as_str());
        assert_eq!(user_agent, Some("mailsync-tests/0.0"));
    }

    engine.shutdown.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gone_endpoints_disable_webhooks_after_one_attempt() {
    let engine = TestEngine::start(1).await;
    let server = WebhookServer::start(410).await;
    engine.enable_webhooks(&server.url).await;

    engine.registry.create(test_account("a1")).await.unwrap();
    engine.wait_for_state("a1", AccountState::Connected).await;
    let session = engine.connector.wait_for_session("a1").await;

    session.push(message_new("1")).await;

    // Exactly one POST; the job completes and webhooks turn off.
    server.wait_for_deliveries(1).await;
    for _ in 0..200 {
        if !engine.settings.webhooks().await.unwrap().enabled {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert!(!engine.settings.webhooks().await.unwrap().enabled);

    // A subsequent event completes without touching the endpoint.
    session.push(message_new("2")).await;
    for _ in 0..200 {
        let counts = engine.notify_queue.counts().await.unwrap();
        if counts.completed >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    let counts = engine.notify_queue.counts().await.unwrap();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.failed, 0);
    assert_eq!(server.deliveries().len(), 1);

    engine.shutdown.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notify_from_suppresses_older_messages() {
    let engine = TestEngine::start(1).await;
    let server = WebhookServer::start(200).await;
    engine.enable_webhooks(&server.url).await;

    let mut account = test_account("a1");
    account.meta.notify_from = Some(Utc::now());
    engine.registry.create(account).await.unwrap();
    engine.wait_for_state("a1", AccountState::Connected).await;
    let session = engine.connector.wait_for_session("a1").await;

    // A backlog message from before the watermark stays quiet.
    session
        .push(SessionEvent::MessageNew {
            mailbox: "INBOX".to_string(),
            id: "old".to_string(),
            internal_date: Utc::now() - chrono::Duration::hours(1),
            envelope: MessageEnvelope::default(),
        })
        .await;
    session.push(message_new("fresh")).await;

    let deliveries = server.wait_for_deliveries(1).await;
    assert_eq!(deliveries[0].body["data"]["id"], "fresh");
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(server.deliveries().len(), 1);

    engine.shutdown.send(true).unwrap();
}
