use std::sync::Arc;
use std::time::Duration;

use account_registry::{
    AccountMeta, AccountState, Credentials, ImapCredentials, NewAccount, Registry, SecurityMode,
    SmtpCredentials,
};
use kv_store::Store;
use secret_store::SecretVault;
use tokio::sync::{mpsc, watch};

use super::*;

fn test_account(id: &str) -> NewAccount {
    NewAccount {
        id: id.to_string(),
        credentials: Credentials::ImapSmtp {
            imap: ImapCredentials {
                host: "imap.example.com".to_string(),
                port: 993,
                security: SecurityMode::Tls,
                user: "u@example.com".to_string(),
                secret: "secret".to_string(),
            },
            smtp: SmtpCredentials {
                host: "smtp.example.com".to_string(),
                port: 465,
                security: SecurityMode::Tls,
                user: "u@example.com".to_string(),
                secret: "secret".to_string(),
            },
        },
        meta: AccountMeta::default(),
    }
}

/// What a stub worker saw, forwarded to the test.
#[derive(Debug)]
enum Seen {
    Assigned { worker: String, account: String },
    Deleted { worker: String, account: String },
    Settings,
}

/// A worker factory that reports ready, forwards observations and
/// answers calls with `Done` after a configurable delay.
fn stub_worker(seen: mpsc::Sender<Seen>, call_delay: Duration) -> WorkerFactory {
    Arc::new(move |mut ctx: WorkerContext| {
        let seen = seen.clone();
        Box::pin(async move {
            ctx.supervisor.ready(&ctx.worker_id).await;
            loop {
                tokio::select! {
                    message = ctx.inbox.recv() => {
                        let Some(message) = message else { return };
                        match message {
                            WorkerMessage::Assign { account } => {
                                let _ = seen.send(Seen::Assigned {
                                    worker: ctx.worker_id.clone(),
                                    account,
                                }).await;
                            }
                            WorkerMessage::Delete { account } => {
                                let _ = seen.send(Seen::Deleted {
                                    worker: ctx.worker_id.clone(),
                                    account,
                                }).await;
                            }
                            WorkerMessage::Settings(_) => {
                                let _ = seen.send(Seen::Settings).await;
                            }
                            WorkerMessage::Call { mid, .. } => {
                                let supervisor = ctx.supervisor.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(call_delay).await;
                                    supervisor.respond(mid, Ok(AccountResponse::Done)).await;
                                });
                            }
                            WorkerMessage::Update { .. }
                            | WorkerMessage::CountConnections => {}
                        }
                    }
                    _ = ctx.shutdown.changed() => {
                        if *ctx.shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    })
}

struct Harness {
    store: Store,
    registry: Registry,
    handle: SupervisorHandle,
    seen: mpsc::Receiver<Seen>,
    shutdown: watch::Sender<bool>,
}

async fn start(workers: usize, rpc_timeout: Duration, call_delay: Duration) -> Harness {
    let store = Store::in_memory().await;
    let registry = Registry::new(store.clone(), SecretVault::new(None));
    let metrics = Arc::new(Metrics::new(store.clone(), 7));
    let (seen_tx, seen_rx) = mpsc::channel(256);

    let supervisor = Supervisor::new(Params {
        store: store.clone(),
        registry: registry.clone(),
        metrics,
        workers: vec![WorkerSpec {
            kind: "imap".to_string(),
            count: workers,
            assignable: true,
            factory: stub_worker(seen_tx, call_delay),
        }],
        rpc_timeout,
    });
    let handle = supervisor.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(supervisor.run(shutdown_rx));
    // Give workers a beat to report ready.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        store,
        registry,
        handle,
        seen: seen_rx,
        shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn new_accounts_are_assigned_to_ready_workers() {
    let mut harness = start(2, Duration::from_secs(10), Duration::ZERO).await;

    harness.registry.create(test_account("a1")).await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv())
        .await
        .unwrap()
        .unwrap();
    let Seen::Assigned { account, .. } = seen else {
        panic!("expected an assignment, got {seen:?}");
    };
    assert_eq!(account, "a1");

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn calls_route_to_the_owner_and_unowned_accounts_get_503() {
    let mut harness = start(1, Duration::from_secs(10), Duration::ZERO).await;

    harness.registry.create(test_account("a1")).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv()).await;

    let result = harness
        .handle
        .account_call("a1", AccountRequest::BuildContacts)
        .await;
    assert!(matches!(result, Ok(AccountResponse::Done)));

    let err = harness
        .handle
        .account_call("ghost", AccountRequest::BuildContacts)
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 503);
    assert!(err.message.starts_with("No active handler"));

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn slow_calls_time_out_with_504() {
    let mut harness = start(
        1,
        Duration::from_millis(100),
        Duration::from_secs(5),
    )
    .await;

    harness.registry.create(test_account("a1")).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv()).await;

    let started = std::time::Instant::now();
    let err = harness
        .handle
        .account_call("a1", AccountRequest::BuildContacts)
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 504);
    assert_eq!(err.code, "Timeout");
    assert!(started.elapsed() < Duration::from_secs(2));

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn released_accounts_read_disconnected_and_come_back() {
    let mut harness = start(1, Duration::from_secs(10), Duration::ZERO).await;

    harness.registry.create(test_account("a1")).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv()).await;

    harness.handle.release("a1", Some("socket reset".to_string())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The registry reflects the cooling state.
    let account = harness.registry.load("a1").await.unwrap().unwrap();
    assert_eq!(account.state, AccountState::Disconnected);

    // First release has no damping delay, so the account is reassigned.
    let seen = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(seen, Seen::Assigned { account, .. } if account == "a1"));

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn deleting_an_account_notifies_its_owner() {
    let mut harness = start(1, Duration::from_secs(10), Duration::ZERO).await;

    harness.registry.create(test_account("a1")).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv()).await;

    harness.registry.delete("a1").await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(seen, Seen::Deleted { account, .. } if account == "a1"));

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn settings_broadcasts_reach_every_worker() {
    let mut harness = start(3, Duration::from_secs(10), Duration::ZERO).await;

    harness
        .handle
        .notify(Inbound::BroadcastSettings(SettingsUpdate {
            max_log_lines: Some(500),
            queue_keep: None,
        }))
        .await;

    for _ in 0..3 {
        let seen = tokio::time::timeout(Duration::from_secs(2), harness.seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(seen, Seen::Settings));
    }

    harness.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn change_broadcasts_reach_the_change_channel() {
    let harness = start(1, Duration::from_secs(10), Duration::ZERO).await;
    let mut changes = harness.store.subscribe(CHANGE_CHANNEL);

    harness
        .handle
        .change("a1", "state", serde_json::json!({"state": "connected"}))
        .await;

    let payload = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(decoded["account"], "a1");
    assert_eq!(decoded["payload"]["state"], "connected");

    harness.shutdown.send(true).unwrap();
}
