//! Assignment under churn: many accounts, a worker dies, ownership moves
//! without ever doubling up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use account_registry::Registry;
use kv_store::Store;
use secret_store::SecretVault;
use supervisor::{Metrics, Supervisor, WorkerContext, WorkerMessage, WorkerSpec};
use tokio::sync::watch;

use engine_integration::test_account;

/// Assignment log entry: (account, worker).
type AssignLog = Arc<Mutex<Vec<(String, String)>>>;

/// A worker that records assignments and can be killed by name.
fn recording_worker(log: AssignLog, kill: watch::Receiver<Option<String>>) -> supervisor::WorkerFactory {
    Arc::new(move |mut ctx: WorkerContext| {
        let log = log.clone();
        let mut kill = kill.clone();
        Box::pin(async move {
            ctx.supervisor.ready(&ctx.worker_id).await;
            loop {
                tokio::select! {
                    message = ctx.inbox.recv() => {
                        let Some(message) = message else { return };
                        match message {
                            WorkerMessage::Assign { account } => {
                                log.lock().unwrap().push((account, ctx.worker_id.clone()));
                            }
                            WorkerMessage::Call { mid, .. } => {
                                ctx.supervisor
                                    .respond(mid, Ok(supervisor::AccountResponse::Done))
                                    .await;
                            }
                            _ => {}
                        }
                    }
                    changed = kill.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if kill.borrow().as_deref() == Some(ctx.worker_id.as_str()) {
                            // Simulated crash.
                            return;
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

/// Latest owner per account from the assignment log.
fn owners(log: &AssignLog) -> HashMap<String, String> {
    let mut owners = HashMap::new();
    for (account, worker) in log.lock().unwrap().iter() {
        owners.insert(account.clone(), worker.clone());
    }
    owners
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accounts_spread_over_workers_and_survive_worker_loss() {
    let store = Store::in_memory().await;
    let registry = Registry::new(store.clone(), SecretVault::new(None));
    let metrics = Arc::new(Metrics::new(store.clone(), 1));

    let log: AssignLog = Arc::new(Mutex::new(Vec::new()));
    let (kill_tx, kill_rx) = watch::channel(None::<String>);

    let supervisor = Supervisor::new(supervisor::Params {
        store: store.clone(),
        registry: registry.clone(),
        metrics,
        workers: vec![WorkerSpec {
            kind: "imap".to_string(),
            count: 3,
            assignable: true,
            factory: recording_worker(log.clone(), kill_rx),
        }],
        rpc_timeout: Duration::from_secs(5),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(supervisor.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Watch state-change broadcasts for the disconnected transitions.
    let mut changes = store.subscribe(supervisor::CHANGE_CHANNEL);
    let disconnected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let disconnected = disconnected.clone();
        tokio::spawn(async move {
            while let Ok(payload) = changes.recv().await {
                let Ok(decoded) = serde_json::from_slice::<serde_json::Value>(&payload) else {
                    continue;
                };
                if decoded["payload"]["state"] == "disconnected" {
                    disconnected
                        .lock()
                        .unwrap()
                        .push(decoded["account"].as_str().unwrap_or_default().to_string());
                }
            }
        });
    }

    for n in 0..100 {
        registry
            .create(test_account(&format!("account-{n}")))
            .await
            .unwrap();
    }

    // Every account lands on exactly one worker.
    for _ in 0..200 {
        if log.lock().unwrap().len() >= 100 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let initial = owners(&log);
    assert_eq!(initial.len(), 100);
    {
        let entries = log.lock().unwrap();
        assert_eq!(entries.len(), 100, "an account was assigned twice");
    }

    // The hash spreads accounts across all three workers.
    for worker in ["imap-1", "imap-2", "imap-3"] {
        assert!(
            initial.values().any(|owner| owner == worker),
            "{worker} got no accounts"
        );
    }

    let lost: Vec<String> = initial
        .iter()
        .filter(|(_, worker)| *worker == "imap-2")
        .map(|(account, _)| account.clone())
        .collect();
    let kept: Vec<String> = initial
        .iter()
        .filter(|(_, worker)| *worker != "imap-2")
        .map(|(account, _)| account.clone())
        .collect();

    // Kill worker 2. The release-and-replan runs before the respawned
    // imap-2 reports ready, so its accounts land on the survivors.
    kill_tx.send(Some("imap-2".to_string())).unwrap();

    for _ in 0..200 {
        if owners(&log).len() == 100 && log.lock().unwrap().len() >= 100 + lost.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let after = owners(&log);
    assert_eq!(after.len(), 100);
    for account in &lost {
        let owner = after.get(account).unwrap_or_else(|| panic!("{account} vanished"));
        assert_ne!(owner, "imap-2", "{account} went back to the dead worker");
    }
    // Accounts on the surviving workers never moved.
    for account in &kept {
        assert_eq!(after[account], initial[account], "{account} moved needlessly");
    }

    // Reassigned accounts were reported disconnected before coming back.
    let disconnected = disconnected.lock().unwrap().clone();
    for account in &lost {
        assert!(
            disconnected.contains(account),
            "{account} never read disconnected"
        );
    }

    shutdown_tx.send(true).unwrap();
}
