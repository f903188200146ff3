//! Reconnect damping: tight connect-failure loops back off, and the
//! account recovers once the server behaves again.

use std::time::Duration;

use account_registry::AccountState;
use imap_client::ConnectError;

use engine_integration::{TestEngine, test_account};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tight_failure_loops_grow_the_reconnect_delay() {
    let engine = TestEngine::start(1).await;

    engine
        .connector
        .fail_connects(
            "flappy",
            (0..4)
                .map(|n| ConnectError::Transport(format!("connection reset {n}")))
                .collect(),
        );

    engine.registry.create(test_account("flappy")).await.unwrap();

    // Four transport failures, then a clean connect.
    engine
        .wait_for_state("flappy", AccountState::Connected)
        .await;

    let times = engine.connector.connect_times("flappy");
    assert_eq!(times.len(), 5, "expected 4 failures plus one success");

    // First retry is undamped; afterwards each gap grows.
    let gaps: Vec<i64> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert!(
        gaps[1] >= 900,
        "second retry should carry the seed delay, waited {}ms",
        gaps[1]
    );
    assert!(
        gaps[2] >= gaps[1],
        "damping shrank: {}ms then {}ms",
        gaps[1],
        gaps[2]
    );
    assert!(
        gaps[3] >= gaps[2],
        "damping shrank: {}ms then {}ms",
        gaps[2],
        gaps[3]
    );
    assert!(gaps.iter().all(|gap| *gap <= 61_000));

    // While cooling, reads showed the account disconnected, and the
    // failures were recorded on the account.
    let account = engine.registry.load("flappy").await.unwrap().unwrap();
    assert_eq!(account.state, AccountState::Connected);
    assert!(account.last_error.is_none(), "error survives reconnection");

    engine.shutdown.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auth_rejection_parks_the_account_until_updated() {
    let engine = TestEngine::start(1).await;

    engine
        .connector
        .fail_connects("locked", vec![ConnectError::Auth("LOGIN failed".to_string())]);

    engine.registry.create(test_account("locked")).await.unwrap();
    engine
        .wait_for_state("locked", AccountState::AuthenticationError)
        .await;

    let account = engine.registry.load("locked").await.unwrap().unwrap();
    assert_eq!(account.last_error.unwrap().code, "EAUTH");

    // No reconnect storm: the account waits for the operator.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.connector.connect_times("locked").len(), 1);

    // An authenticationError event was emitted for the webhook pipeline.
    let counts = engine.notify_queue.counts().await.unwrap();
    assert!(counts.pending + counts.completed >= 1);

    // A credentials update brings it back.
    engine
        .registry
        .update(
            "locked",
            account_registry::AccountPatch {
                credentials: test_account("locked").credentials.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine
        .wait_for_state("locked", AccountState::Connected)
        .await;

    engine.shutdown.send(true).unwrap();
}
