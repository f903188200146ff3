//! The IMAP worker: hosts a set of per-account connections.
//!
//! One worker owns many accounts; each owned account runs as its own
//! task holding the connection state machine. The worker loop routes
//! supervisor messages to account tasks and reports readiness, call
//! responses and connection counts back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use account_registry::Registry;
use imap_client::MailConnector;
use kv_store::Store;
use queue_engine::QueueEngine;
use supervisor::{SupervisorHandle, WorkerContext, WorkerMessage, no_active_handler};
use tokio::sync::{mpsc, oneshot};

mod account;

use account::AccountCommand;

/// Capacity of a per-account command channel.
const ACCOUNT_COMMAND_CAPACITY: usize = 64;

/// Worker construction params.
#[derive(Clone)]
pub struct Params {
    /// Backing store.
    pub store: Store,

    /// Account catalog.
    pub registry: Registry,

    /// The notification queue, target of emitted events.
    pub notify_queue: QueueEngine,

    /// The submission queue, target of `queueMessage`.
    pub submit_queue: QueueEngine,

    /// The mail-session connector.
    pub connector: Arc<dyn MailConnector>,

    /// OAuth2 token refresher for provider-backed accounts.
    pub refresher: Option<Arc<oauth2_refresh::Refresher>>,

    /// Cap on per-account log rings, shared so settings changes apply
    /// to live accounts.
    pub max_log_lines: Arc<AtomicUsize>,
}

/// A live account entry.
struct AccountEntry {
    /// The account task's command channel.
    cmd_tx: mpsc::Sender<AccountCommand>,
}

/// Run an IMAP worker until shutdown.
pub async fn run(mut ctx: WorkerContext, params: Params) {
    let mut accounts: HashMap<String, AccountEntry> = HashMap::new();
    let mut tasks: tokio::task::JoinSet<String> = tokio::task::JoinSet::new();

    ctx.supervisor.ready(&ctx.worker_id).await;
    tracing::info!(worker = %ctx.worker_id, "IMAP worker ready");

    loop {
        tokio::select! {
            message = ctx.inbox.recv() => {
                let Some(message) = message else { break };
                handle_message(
                    &ctx.worker_id,
                    &ctx.supervisor,
                    &params,
                    &mut accounts,
                    &mut tasks,
                    &ctx.shutdown,
                    message,
                )
                .await;
            }
            joined = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(Ok(account)) = joined
                    && accounts
                        .get(&account)
                        .is_some_and(|entry| entry.cmd_tx.is_closed())
                {
                    accounts.remove(&account);
                }
            }
            _ = ctx.shutdown.changed() => {
                if *ctx.shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Account tasks watch the same shutdown signal and close their
    // sessions on their own.
    drop(accounts);
    while tasks.join_next().await.is_some() {}
    tracing::info!(worker = %ctx.worker_id, "IMAP worker stopped");
}

/// Dispatch one supervisor message.
async fn handle_message(
    worker_id: &str,
    supervisor: &SupervisorHandle,
    params: &Params,
    accounts: &mut HashMap<String, AccountEntry>,
    tasks: &mut tokio::task::JoinSet<String>,
    shutdown: &tokio::sync::watch::Receiver<bool>,
    message: WorkerMessage,
) {
    match message {
        WorkerMessage::Assign { account } => {
            if accounts
                .get(&account)
                .is_some_and(|entry| !entry.cmd_tx.is_closed())
            {
                tracing::debug!(worker = %worker_id, %account, "already hosting account");
                return;
            }

            let (cmd_tx, cmd_rx) = mpsc::channel(ACCOUNT_COMMAND_CAPACITY);
            let task = account::AccountTask::new(
                account.clone(),
                worker_id.to_string(),
                params.clone(),
                supervisor.clone(),
            );
            let account_for_join = account.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                task.run(cmd_rx, shutdown).await;
                account_for_join
            });
            accounts.insert(account, AccountEntry { cmd_tx });
        }
        WorkerMessage::Delete { account } => {
            if let Some(entry) = accounts.remove(&account) {
                let _ = entry.cmd_tx.send(AccountCommand::Delete).await;
            }
        }
        WorkerMessage::Update { account } => {
            if let Some(entry) = accounts.get(&account) {
                let _ = entry.cmd_tx.send(AccountCommand::Update).await;
            }
        }
        WorkerMessage::Settings(update) => {
            if let Some(max_log_lines) = update.max_log_lines {
                params.max_log_lines.store(max_log_lines, Ordering::Relaxed);
            }
            if let Some(queue_keep) = update.queue_keep {
                params.notify_queue.set_queue_keep(queue_keep);
                params.submit_queue.set_queue_keep(queue_keep);
            }
        }
        WorkerMessage::Call {
            mid,
            account,
            request,
        } => {
            let Some(entry) = accounts.get(&account) else {
                supervisor.respond(mid, Err(no_active_handler())).await;
                return;
            };

            let (reply, reply_rx) = oneshot::channel();
            if entry
                .cmd_tx
                .send(AccountCommand::Op { request, reply })
                .await
                .is_err()
            {
                supervisor.respond(mid, Err(no_active_handler())).await;
                return;
            }

            // Await the account task off the worker loop so one slow op
            // cannot stall routing for other accounts.
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                let result = reply_rx
                    .await
                    .unwrap_or_else(|_| Err(no_active_handler()));
                supervisor.respond(mid, result).await;
            });
        }
        WorkerMessage::CountConnections => {
            supervisor.metric("connections", accounts.len() as i64).await;
        }
    }
}
