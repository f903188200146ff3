//! The process supervisor.
//!
//! Spawns and restarts worker tasks, owns the assignment controller,
//! routes account-scoped RPC through a correlation map with per-call
//! deadlines, broadcasts state changes and aggregates metrics. All
//! supervisor state is mutated only from the single run loop; workers
//! talk to it exclusively through messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};

use account_registry::{AccountState, ControlCommand, Registry};
use assignment::Assignments;
use kv_store::Store;

mod metrics;
mod msg;

#[cfg(test)]
mod tests;

pub use metrics::Metrics;
pub use msg::{
    AccountRequest, AccountResponse, CallResult, Inbound, SettingsUpdate, WorkerMessage,
    no_active_handler, timeout,
};

/// Pub/sub channel carrying account state-change broadcasts.
pub const CHANGE_CHANNEL: &str = "change";

/// Capacity of the supervisor inbox.
const INBOX_CAPACITY: usize = 1024;

/// Capacity of a worker inbox.
const WORKER_INBOX_CAPACITY: usize = 256;

/// Grace period for workers to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(2_500);

/// Cadence of connection-count collection from IMAP workers.
const COUNT_CONNECTIONS_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that stop the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Registry access failed during startup.
    #[error("registry: {0}")]
    Registry(#[from] account_registry::RegistryError),
}

/// Everything a worker task is constructed with.
pub struct WorkerContext {
    /// The worker's id, e.g. `imap-2`.
    pub worker_id: String,

    /// Messages from the supervisor.
    pub inbox: mpsc::Receiver<WorkerMessage>,

    /// Handle back into the supervisor.
    pub supervisor: SupervisorHandle,

    /// Engine shutdown signal.
    pub shutdown: watch::Receiver<bool>,
}

/// Builds a worker task future from its context.
pub type WorkerFactory = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// A class of workers to spawn and keep alive.
pub struct WorkerSpec {
    /// Worker kind, used as the id prefix.
    pub kind: String,

    /// How many instances to run.
    pub count: usize,

    /// Whether accounts are assigned to these workers.
    pub assignable: bool,

    /// The task factory.
    pub factory: WorkerFactory,
}

/// Cloneable handle into the supervisor loop.
#[derive(Clone)]
pub struct SupervisorHandle {
    /// Supervisor inbox.
    tx: mpsc::Sender<Inbound>,

    /// Per-call deadline for account RPC.
    rpc_timeout: Duration,
}

impl SupervisorHandle {
    /// Issue an account-scoped RPC to the owning worker.
    ///
    /// Fails with `No active handler…` (503) when the account is
    /// unowned and `Timeout` (504) when the deadline passes.
    pub async fn account_call(&self, account: &str, request: AccountRequest) -> CallResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::AccountCall {
                account: account.to_string(),
                request,
                reply,
            })
            .await
            .map_err(|_| msg::no_active_handler())?;
        rx.await.unwrap_or_else(|_| Err(msg::no_active_handler()))
    }

    /// Send a fire-and-forget message into the supervisor loop.
    pub async fn notify(&self, inbound: Inbound) {
        let _ = self.tx.send(inbound).await;
    }

    /// Report that this worker is set up and accepting work.
    pub async fn ready(&self, worker: &str) {
        self.notify(Inbound::Ready {
            worker: worker.to_string(),
        })
        .await;
    }

    /// Respond to a `Call` command.
    pub async fn respond(&self, mid: u64, result: CallResult) {
        self.notify(Inbound::Resp { mid, result }).await;
    }

    /// Broadcast an account change to API consumers.
    pub async fn change(&self, account: &str, kind: &str, payload: serde_json::Value) {
        self.notify(Inbound::Change {
            account: account.to_string(),
            kind: kind.to_string(),
            payload,
        })
        .await;
    }

    /// Release an account whose connection dropped.
    pub async fn release(&self, account: &str, error: Option<String>) {
        self.notify(Inbound::Released {
            account: account.to_string(),
            error,
        })
        .await;
    }

    /// Increment a metric counter.
    pub async fn metric(&self, counter: &str, delta: i64) {
        self.notify(Inbound::Metrics {
            counter: counter.to_string(),
            delta,
        })
        .await;
    }

    /// Record a request duration into the histogram counters.
    pub async fn observe_duration(&self, name: &str, duration: Duration) {
        self.notify(Inbound::Duration {
            name: name.to_string(),
            millis: duration.as_millis() as u64,
        })
        .await;
    }
}

/// A live worker entry.
struct WorkerEntry {
    /// Index into the spec list, for respawning.
    spec: usize,

    /// The worker's inbox sender.
    tx: mpsc::Sender<WorkerMessage>,

    /// Whether the worker has reported ready.
    online: bool,
}

/// Supervisor params.
pub struct Params {
    /// Backing store.
    pub store: Store,

    /// Account catalog.
    pub registry: Registry,

    /// Metrics sink.
    pub metrics: Arc<Metrics>,

    /// Worker classes to run.
    pub workers: Vec<WorkerSpec>,

    /// Per-call RPC deadline.
    pub rpc_timeout: Duration,
}

/// The process supervisor.
pub struct Supervisor {
    /// Backing store.
    store: Store,

    /// Account catalog.
    registry: Registry,

    /// Metrics sink.
    metrics: Arc<Metrics>,

    /// Worker classes.
    specs: Vec<WorkerSpec>,

    /// Inbox receiver.
    rx: mpsc::Receiver<Inbound>,

    /// Handle template.
    handle: SupervisorHandle,

    /// Assignment controller state.
    assignments: Assignments,

    /// Live workers by id.
    workers: HashMap<String, WorkerEntry>,

    /// Outstanding calls by correlation id.
    calls: HashMap<u64, oneshot::Sender<CallResult>>,

    /// Next correlation id.
    next_mid: u64,
}

impl Supervisor {
    /// Build a supervisor.
    pub fn new(params: Params) -> Self {
        let Params {
            store,
            registry,
            metrics,
            workers,
            rpc_timeout,
        } = params;

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = SupervisorHandle { tx, rpc_timeout };

        Self {
            store,
            registry,
            metrics,
            specs: workers,
            rx,
            handle,
            assignments: Assignments::new(),
            workers: HashMap::new(),
            calls: HashMap::new(),
            next_mid: 0,
        }
    }

    /// A handle into this supervisor.
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        for id in self.registry.ids().await? {
            self.assignments.add_account(&id);
        }

        self.spawn_control_listener(shutdown.clone());

        let mut join_set: tokio::task::JoinSet<String> = tokio::task::JoinSet::new();
        for spec_idx in 0..self.specs.len() {
            for instance in 1..=self.specs[spec_idx].count {
                let worker_id = format!("{}-{instance}", self.specs[spec_idx].kind);
                self.spawn_worker(&mut join_set, spec_idx, worker_id, shutdown.clone());
            }
        }

        let mut count_interval = tokio::time::interval(COUNT_CONNECTIONS_INTERVAL);
        count_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        count_interval.reset();

        loop {
            tokio::select! {
                inbound = self.rx.recv() => {
                    let Some(inbound) = inbound else { break };
                    self.handle_inbound(inbound).await;
                }
                joined = join_set.join_next(), if !join_set.is_empty() => {
                    if let Some(Ok(worker_id)) = joined {
                        self.handle_worker_exit(&mut join_set, worker_id, shutdown.clone()).await;
                    }
                }
                _ = count_interval.tick() => {
                    for entry in self.workers.values() {
                        let _ = entry.tx.send(WorkerMessage::CountConnections).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("supervisor closing, draining workers");
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        Ok(())
    }

    /// Forward registry control messages into the inbox.
    fn spawn_control_listener(&self, mut shutdown: watch::Receiver<bool>) {
        let mut control = self.store.subscribe(account_registry::CONTROL_CHANNEL);
        let tx = self.handle.tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = control.recv() => {
                        let Ok(payload) = received else { continue };
                        match serde_json::from_slice(&payload) {
                            Ok(message) => {
                                if tx.send(Inbound::Control(message)).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%err, "undecodable control message");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Spawn one worker instance.
    fn spawn_worker(
        &mut self,
        join_set: &mut tokio::task::JoinSet<String>,
        spec: usize,
        worker_id: String,
        shutdown: watch::Receiver<bool>,
    ) {
        let (tx, inbox) = mpsc::channel(WORKER_INBOX_CAPACITY);
        let context = WorkerContext {
            worker_id: worker_id.clone(),
            inbox,
            supervisor: self.handle(),
            shutdown,
        };

        let future = (self.specs[spec].factory)(context);
        let id_for_join = worker_id.clone();
        join_set.spawn(async move {
            future.await;
            id_for_join
        });

        tracing::info!(worker = %worker_id, kind = %self.specs[spec].kind, "worker spawned");
        self.workers.insert(
            worker_id,
            WorkerEntry {
                spec,
                tx,
                online: false,
            },
        );
    }

    /// Handle a worker task exit: release accounts, restart.
    async fn handle_worker_exit(
        &mut self,
        join_set: &mut tokio::task::JoinSet<String>,
        worker_id: String,
        shutdown: watch::Receiver<bool>,
    ) {
        let Some(entry) = self.workers.remove(&worker_id) else {
            return;
        };
        tracing::warn!(worker = %worker_id, "worker exited");
        self.metrics.increment("worker_exits", 1).await;

        if self.specs[entry.spec].assignable {
            let now = chrono::Utc::now().timestamp_millis();
            let released = self.assignments.worker_gone(&worker_id, now);
            for account in released {
                self.publish_disconnected(&account).await;
            }
        }

        if *shutdown.borrow() {
            return;
        }
        self.spawn_worker(join_set, entry.spec, worker_id, shutdown);
        self.try_assign().await;
    }

    /// Record and broadcast the `disconnected` state for an account so
    /// API reads stay accurate during the cooling delay.
    async fn publish_disconnected(&self, account: &str) {
        if let Err(err) = self
            .registry
            .set_state(account, AccountState::Disconnected)
            .await
        {
            tracing::warn!(account, %err, "state write failed");
        }
        self.broadcast_change(
            account,
            "state",
            serde_json::json!({"state": AccountState::Disconnected.as_str()}),
        );
    }

    /// Publish a change broadcast for API consumers.
    fn broadcast_change(&self, account: &str, kind: &str, payload: serde_json::Value) {
        let message = serde_json::json!({
            "account": account,
            "kind": kind,
            "payload": payload,
        });
        match serde_json::to_vec(&message) {
            Ok(encoded) => self.store.publish(CHANGE_CHANNEL, encoded),
            Err(err) => tracing::error!(%err, "change broadcast encode failed"),
        }
    }

    /// Run an assignment cycle and schedule the next damping wake-up.
    ///
    /// The loop itself serializes cycles; no two can overlap.
    async fn try_assign(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        let planned = self.assignments.plan(now);
        for assignment in planned {
            let Some(entry) = self.workers.get(&assignment.worker) else {
                continue;
            };
            tracing::info!(
                account = %assignment.account,
                worker = %assignment.worker,
                "assigning account"
            );
            let sent = entry
                .tx
                .send(WorkerMessage::Assign {
                    account: assignment.account.clone(),
                })
                .await;
            if sent.is_err() {
                // The worker died between planning and sending; its join
                // handler will release the account again.
                tracing::warn!(worker = %assignment.worker, "assign to dead worker dropped");
            }
        }

        if let Some(wake_at) = self.assignments.next_wake(now) {
            let tx = self.handle.tx.clone();
            let delay = Duration::from_millis((wake_at - now).max(0) as u64);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Inbound::AssignWake).await;
            });
        }
    }

    /// Dispatch one inbound message.
    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Ready { worker } => {
                let Some(entry) = self.workers.get_mut(&worker) else {
                    return;
                };
                entry.online = true;
                if self.specs[entry.spec].assignable {
                    self.assignments.worker_ready(&worker);
                    self.try_assign().await;
                }
            }
            Inbound::Resp { mid, result } => {
                if let Some(reply) = self.calls.remove(&mid) {
                    let _ = reply.send(result);
                }
            }
            Inbound::Change {
                account,
                kind,
                payload,
            } => {
                self.broadcast_change(&account, &kind, payload);
            }
            Inbound::Released { account, error } => {
                let now = chrono::Utc::now().timestamp_millis();
                let delay_ms = self.assignments.release_account(&account, now);
                tracing::info!(
                    account = %account,
                    delay_ms,
                    error = error.as_deref().unwrap_or("none"),
                    "account released"
                );
                self.metrics.increment("account_releases", 1).await;
                self.publish_disconnected(&account).await;
                self.try_assign().await;
            }
            Inbound::Metrics { counter, delta } => {
                self.metrics.increment(&counter, delta).await;
            }
            Inbound::Duration { name, millis } => {
                self.metrics
                    .observe_duration(&name, Duration::from_millis(millis))
                    .await;
            }
            Inbound::AccountCall {
                account,
                request,
                reply,
            } => {
                self.route_call(&account, request, reply).await;
            }
            Inbound::BroadcastSettings(update) => {
                for entry in self.workers.values() {
                    let _ = entry.tx.send(WorkerMessage::Settings(update.clone())).await;
                }
            }
            Inbound::CallExpired { mid } => {
                if let Some(reply) = self.calls.remove(&mid) {
                    let _ = reply.send(Err(msg::timeout()));
                }
            }
            Inbound::Control(message) => {
                self.handle_control(message).await;
            }
            Inbound::AssignWake => {
                self.try_assign().await;
            }
        }
    }

    /// React to an account membership change from the registry.
    async fn handle_control(&mut self, message: account_registry::ControlMessage) {
        match message.cmd {
            ControlCommand::New => {
                self.assignments.add_account(&message.account);
                self.try_assign().await;
            }
            ControlCommand::Update => {
                match self.assignments.owner(&message.account) {
                    Some(worker) => {
                        if let Some(entry) = self.workers.get(worker) {
                            let _ = entry
                                .tx
                                .send(WorkerMessage::Update {
                                    account: message.account.clone(),
                                })
                                .await;
                        }
                    }
                    None => {
                        self.assignments.add_account(&message.account);
                        self.try_assign().await;
                    }
                }
            }
            ControlCommand::Delete => {
                if let Some(worker) = self.assignments.remove_account(&message.account)
                    && let Some(entry) = self.workers.get(&worker)
                {
                    let _ = entry
                        .tx
                        .send(WorkerMessage::Delete {
                            account: message.account.clone(),
                        })
                        .await;
                }
            }
        }
    }

    /// Route an account RPC to its owning worker with a deadline.
    async fn route_call(
        &mut self,
        account: &str,
        request: AccountRequest,
        reply: oneshot::Sender<CallResult>,
    ) {
        let Some(worker) = self.assignments.owner(account) else {
            let _ = reply.send(Err(msg::no_active_handler()));
            return;
        };
        let Some(entry) = self.workers.get(worker) else {
            let _ = reply.send(Err(msg::no_active_handler()));
            return;
        };
        if !entry.online {
            let _ = reply.send(Err(msg::no_active_handler()));
            return;
        }

        self.next_mid += 1;
        let mid = self.next_mid;

        let sent = entry
            .tx
            .send(WorkerMessage::Call {
                mid,
                account: account.to_string(),
                request,
            })
            .await;
        if sent.is_err() {
            let _ = reply.send(Err(msg::no_active_handler()));
            return;
        }

        self.calls.insert(mid, reply);

        let tx = self.handle.tx.clone();
        let deadline = self.handle.rpc_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = tx.send(Inbound::CallExpired { mid }).await;
        });
    }
}
