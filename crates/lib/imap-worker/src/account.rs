//! The per-account connection task.
//!
//! Owns the session lifecycle for one account: resolves credentials,
//! connects through the mail-session capability, pumps change events
//! into the notification queue and serves account-scoped operations.
//! Every state transition is written to the account record and broadcast
//! on the change channel.

use std::sync::atomic::Ordering;
use std::time::Duration;

use account_registry::{AccountState, Credentials, LastError};
use chrono::Utc;
use event_core::{Event, EventKind};
use imap_client::{
    Auth, ConnectError, ConnectSpec, FlagUpdate, MailOps, OpError, QueuedMessage, Security,
    ServerSpec, SessionEvent, SessionHandle,
};
use queue_engine::{JobOptions, SubmitPayload};
use supervisor::{AccountRequest, AccountResponse, CallResult, SupervisorHandle};
use tokio::sync::{mpsc, oneshot, watch};

use crate::Params;

/// Attempt budget for notification jobs.
const NOTIFY_ATTEMPTS: u32 = 10;

/// Base backoff of notification jobs.
const NOTIFY_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Attempt budget for queued submissions.
const SUBMIT_ATTEMPTS: u32 = 10;

/// Base backoff of queued submissions.
const SUBMIT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Commands from the worker loop to an account task.
#[derive(Debug)]
pub(crate) enum AccountCommand {
    /// Connection-affecting fields changed; reconnect.
    Update,

    /// The account is being deleted; close and stop.
    Delete,

    /// Serve an operation.
    Op {
        /// The request.
        request: AccountRequest,

        /// Where to deliver the outcome.
        reply: oneshot::Sender<CallResult>,
    },
}

/// What ended a connection round.
enum RoundEnd {
    /// Reconnect with freshly loaded credentials.
    Reconnect,

    /// Stop the task entirely.
    Stop,
}

/// The per-account connection task.
pub(crate) struct AccountTask {
    /// Account id.
    account: String,

    /// Hosting worker id, for logging.
    worker: String,

    /// Shared worker params.
    params: Params,

    /// Handle into the supervisor.
    supervisor: SupervisorHandle,

    /// Whether per-account logging is enabled.
    logs_enabled: bool,

    /// Events before this watermark are not emitted as `messageNew`.
    notify_from: Option<chrono::DateTime<Utc>>,
}

impl AccountTask {
    /// Build a task.
    pub(crate) fn new(
        account: String,
        worker: String,
        params: Params,
        supervisor: SupervisorHandle,
    ) -> Self {
        Self {
            account,
            worker,
            params,
            supervisor,
            logs_enabled: false,
            notify_from: None,
        }
    }

    /// Drive the account until it is deleted, released or shut down.
    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<AccountCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                self.set_state(AccountState::Disconnected).await;
                return;
            }

            match self.connection_round(&mut cmd_rx, &mut shutdown).await {
                RoundEnd::Reconnect => continue,
                RoundEnd::Stop => return,
            }
        }
    }

    /// One connect-serve-close round.
    async fn connection_round(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<AccountCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RoundEnd {
        let account = match self.params.registry.load(&self.account).await {
            Ok(Some(account)) => account,
            Ok(None) => return RoundEnd::Stop,
            Err(err) => {
                tracing::error!(account = %self.account, %err, "account load failed");
                self.supervisor
                    .release(&self.account, Some(err.to_string()))
                    .await;
                return RoundEnd::Stop;
            }
        };
        let Some(credentials) = account.credentials else {
            // Tombstoned mid-flight: auth is gone for good.
            self.set_state(AccountState::Unset).await;
            return RoundEnd::Stop;
        };
        self.logs_enabled = account.meta.logs;
        self.notify_from = account.meta.notify_from;

        self.set_state(AccountState::Connecting).await;
        self.log("connecting").await;

        let spec = match self.build_spec(credentials, account.meta.copy_on_send).await {
            Ok(spec) => spec,
            Err(SpecError::Auth(message)) => {
                return self.auth_error_park(cmd_rx, shutdown, message).await;
            }
            Err(SpecError::Transport(message)) => {
                self.transport_failure(message).await;
                return RoundEnd::Stop;
            }
        };

        let handle = match self.params.connector.connect(spec).await {
            Ok(handle) => handle,
            Err(ConnectError::Auth(message)) => {
                return self.auth_error_park(cmd_rx, shutdown, message).await;
            }
            Err(ConnectError::Transport(message)) => {
                self.transport_failure(message).await;
                return RoundEnd::Stop;
            }
        };

        self.set_state(AccountState::Syncing).await;
        self.serve_session(handle, cmd_rx, shutdown).await
    }

    /// Steady state: pump session events and serve commands.
    async fn serve_session(
        &mut self,
        handle: SessionHandle,
        cmd_rx: &mut mpsc::Receiver<AccountCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RoundEnd {
        let SessionHandle {
            mut events,
            mut ops,
            stop,
        } = handle;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        self.transport_failure("session channel closed".to_string()).await;
                        return RoundEnd::Stop;
                    };
                    match event {
                        SessionEvent::Closed { error: Some(message) } => {
                            self.transport_failure(message).await;
                            return RoundEnd::Stop;
                        }
                        SessionEvent::Closed { error: None } => {
                            self.set_state(AccountState::Disconnected).await;
                            return RoundEnd::Stop;
                        }
                        other => self.handle_session_event(other).await,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(AccountCommand::Delete) => {
                            let _ = stop.send(true);
                            drain_until_closed(&mut events).await;
                            self.log("closed for deletion").await;
                            return RoundEnd::Stop;
                        }
                        Some(AccountCommand::Update) => {
                            let _ = stop.send(true);
                            drain_until_closed(&mut events).await;
                            self.log("reconnecting after update").await;
                            return RoundEnd::Reconnect;
                        }
                        Some(AccountCommand::Op { request, reply }) => {
                            let result = self.dispatch(&mut ops, request).await;
                            let _ = reply.send(result);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = stop.send(true);
                        drain_until_closed(&mut events).await;
                        self.set_state(AccountState::Disconnected).await;
                        return RoundEnd::Stop;
                    }
                }
            }
        }
    }

    /// Map one session event into state and queue effects.
    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SyncCompleted { mailboxes } => {
                tracing::info!(
                    account = %self.account,
                    worker = %self.worker,
                    mailboxes = mailboxes.len(),
                    "account connected"
                );
                if let Err(err) = self.params.registry.set_last_error(&self.account, None).await {
                    tracing::warn!(account = %self.account, %err, "error clear failed");
                }
                self.set_state(AccountState::Connected).await;
                self.log("connected").await;
            }
            SessionEvent::MessageNew {
                mailbox,
                id,
                internal_date,
                envelope,
            } => {
                if let Some(watermark) = self.notify_from
                    && internal_date < watermark
                {
                    tracing::debug!(
                        account = %self.account,
                        message = %id,
                        "suppressing messageNew before notifyFrom"
                    );
                    return;
                }
                self.emit(
                    EventKind::MessageNew,
                    serde_json::json!({
                        "mailbox": mailbox,
                        "id": id,
                        "date": internal_date,
                        "envelope": envelope,
                    }),
                )
                .await;
            }
            SessionEvent::MessageDeleted { mailbox, id } => {
                self.emit(
                    EventKind::MessageDeleted,
                    serde_json::json!({"mailbox": mailbox, "id": id}),
                )
                .await;
            }
            SessionEvent::MessageUpdated { mailbox, id, flags } => {
                self.emit(
                    EventKind::MessageUpdated,
                    serde_json::json!({"mailbox": mailbox, "id": id, "flags": flags}),
                )
                .await;
            }
            SessionEvent::MailboxNew { mailbox } => {
                self.emit(EventKind::MailboxNew, serde_json::json!({"mailbox": mailbox}))
                    .await;
            }
            SessionEvent::MailboxDeleted { mailbox } => {
                self.emit(
                    EventKind::MailboxDeleted,
                    serde_json::json!({"mailbox": mailbox}),
                )
                .await;
            }
            SessionEvent::MailboxReset { mailbox } => {
                self.emit(EventKind::MailboxReset, serde_json::json!({"mailbox": mailbox}))
                    .await;
            }
            SessionEvent::Closed { .. } => {}
        }
    }

    /// Serve one account-scoped operation.
    async fn dispatch(
        &mut self,
        ops: &mut Box<dyn MailOps>,
        request: AccountRequest,
    ) -> CallResult {
        match request {
            AccountRequest::ListMessages {
                mailbox,
                page,
                page_size,
            } => ops
                .list_messages(&mailbox, page, page_size)
                .await
                .map(AccountResponse::MessageList),
            AccountRequest::GetMessage { mailbox, id } => ops
                .get_message(&mailbox, &id)
                .await
                .map(AccountResponse::Message),
            AccountRequest::GetText {
                mailbox,
                id,
                max_bytes,
            } => ops
                .get_text(&mailbox, &id, max_bytes)
                .await
                .map(AccountResponse::Text),
            AccountRequest::GetRawMessage { mailbox, id } => ops
                .get_raw_message(&mailbox, &id)
                .await
                .map(AccountResponse::Raw),
            AccountRequest::GetAttachment { mailbox, id, index } => ops
                .get_attachment(&mailbox, &id, index)
                .await
                .map(AccountResponse::Attachment),
            AccountRequest::UpdateMessage {
                mailbox,
                id,
                add,
                remove,
            } => ops
                .update_message(&mailbox, &id, FlagUpdate { add, remove })
                .await
                .map(|()| AccountResponse::Done),
            AccountRequest::MoveMessage {
                mailbox,
                id,
                target,
            } => ops
                .move_message(&mailbox, &id, &target)
                .await
                .map(|()| AccountResponse::Done),
            AccountRequest::DeleteMessage { mailbox, id } => ops
                .delete_message(&mailbox, &id)
                .await
                .map(|()| AccountResponse::Done),
            AccountRequest::SubmitMessage { raw, envelope } => ops
                .submit_message(&raw, &envelope)
                .await
                .map(AccountResponse::Submitted),
            AccountRequest::QueueMessage { raw, envelope } => {
                self.queue_submission(raw, envelope).await
            }
            AccountRequest::UploadMessage {
                mailbox,
                raw,
                flags,
            } => ops
                .upload_message(&mailbox, &raw, &flags)
                .await
                .map(|id| AccountResponse::Uploaded { id }),
            AccountRequest::CreateMailbox { mailbox } => ops
                .create_mailbox(&mailbox)
                .await
                .map(|()| AccountResponse::Done),
            AccountRequest::DeleteMailbox { mailbox } => ops
                .delete_mailbox(&mailbox)
                .await
                .map(|()| AccountResponse::Done),
            AccountRequest::BuildContacts => {
                ops.build_contacts().await.map(AccountResponse::Contacts)
            }
        }
    }

    /// Durably queue a submission: blob first, then the job referencing
    /// it, so losing the job never loses the message.
    async fn queue_submission(
        &self,
        raw: Vec<u8>,
        envelope: imap_client::SubmitEnvelope,
    ) -> CallResult {
        let queue_id = uuid::Uuid::new_v4().simple().to_string();
        let message_id = extract_message_id(&raw).unwrap_or_default();

        let blob = QueuedMessage { raw, envelope };
        let encoded = rmp_serde::to_vec_named(&blob)
            .map_err(|err| OpError::permanent(err.to_string()))?;
        queue_engine::store_message_blob(&self.params.store, &self.account, &queue_id, encoded)
            .await
            .map_err(|err| OpError::transport(err.to_string()))?;

        let payload = SubmitPayload {
            account: self.account.clone(),
            queue_id: queue_id.clone(),
            message_id,
        };
        let payload = serde_json::to_vec(&payload)
            .map_err(|err| OpError::permanent(err.to_string()))?;
        self.params
            .submit_queue
            .enqueue(
                payload,
                JobOptions {
                    attempts: SUBMIT_ATTEMPTS,
                    backoff_base: SUBMIT_BACKOFF_BASE,
                    dedupe_key: Some(format!("{}:{queue_id}", self.account)),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| OpError::transport(err.to_string()))?;

        self.supervisor.metric("submissions_queued", 1).await;
        Ok(AccountResponse::Queued { queue_id })
    }

    /// Resolve credentials into a connect spec.
    async fn build_spec(
        &self,
        credentials: Credentials,
        copy_on_send: bool,
    ) -> Result<ConnectSpec, SpecError> {
        match credentials {
            Credentials::ImapSmtp { imap, smtp } => Ok(ConnectSpec {
                account: self.account.clone(),
                imap: ServerSpec {
                    host: imap.host,
                    port: imap.port,
                    security: map_security(imap.security),
                    auth: Auth::Login {
                        user: imap.user,
                        password: imap.secret,
                    },
                },
                smtp: Some(ServerSpec {
                    host: smtp.host,
                    port: smtp.port,
                    security: map_security(smtp.security),
                    auth: Auth::Login {
                        user: smtp.user,
                        password: smtp.secret,
                    },
                }),
                copy_on_send,
            }),
            Credentials::OAuth2(oauth2) => {
                let endpoints = provider_endpoints(&oauth2.provider).ok_or_else(|| {
                    SpecError::Auth(format!("unknown OAuth2 provider {}", oauth2.provider))
                })?;

                let access_token = self.resolve_access_token(&oauth2).await?;
                let auth = Auth::OAuth2 {
                    user: oauth2.user.clone(),
                    access_token,
                };

                Ok(ConnectSpec {
                    account: self.account.clone(),
                    imap: ServerSpec {
                        host: endpoints.imap_host.to_string(),
                        port: endpoints.imap_port,
                        security: Security::Tls,
                        auth: auth.clone(),
                    },
                    smtp: Some(ServerSpec {
                        host: endpoints.smtp_host.to_string(),
                        port: endpoints.smtp_port,
                        security: Security::StartTls,
                        auth,
                    }),
                    copy_on_send,
                })
            }
        }
    }

    /// A live access token: the cached one when fresh, otherwise a
    /// refresh persisted back through the registry.
    async fn resolve_access_token(
        &self,
        oauth2: &account_registry::OAuth2Credentials,
    ) -> Result<String, SpecError> {
        let Some(refresher) = &self.params.refresher else {
            return Err(SpecError::Auth(
                "no OAuth2 providers configured".to_string(),
            ));
        };

        if let Some(cached) = &oauth2.access_token
            && refresher.is_fresh(oauth2.expires_at)
        {
            return Ok(cached.clone());
        }

        let tokens = refresher
            .refresh(&oauth2.provider, &oauth2.refresh_token)
            .await
            .map_err(|err| match err {
                oauth2_refresh::RefreshError::Transport(message) => {
                    SpecError::Transport(message)
                }
                other => SpecError::Auth(other.to_string()),
            })?;

        if let Err(err) = self
            .params
            .registry
            .store_access_token(
                &self.account,
                &tokens.access_token,
                &tokens.refresh_token,
                tokens.expires_at,
            )
            .await
        {
            tracing::warn!(account = %self.account, %err, "token cache write failed");
        }

        Ok(tokens.access_token)
    }

    /// Park in `authenticationError` until the operator changes the
    /// account or it goes away.
    async fn auth_error_park(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<AccountCommand>,
        shutdown: &mut watch::Receiver<bool>,
        message: String,
    ) -> RoundEnd {
        tracing::warn!(account = %self.account, %message, "authentication rejected");
        self.record_error("EAUTH", &message).await;
        self.set_state(AccountState::AuthenticationError).await;
        self.emit(
            EventKind::AuthenticationError,
            serde_json::json!({"error": message}),
        )
        .await;
        self.log("authentication failed").await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(AccountCommand::Update) => return RoundEnd::Reconnect,
                        None | Some(AccountCommand::Delete) => return RoundEnd::Stop,
                        Some(AccountCommand::Op { reply, .. }) => {
                            let _ = reply.send(Err(OpError {
                                code: "EAUTH".to_string(),
                                status_code: 401,
                                message: "account is in authenticationError state".to_string(),
                            }));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return RoundEnd::Stop;
                    }
                }
            }
        }
    }

    /// Record a transport failure and hand the account back for damped
    /// reassignment.
    async fn transport_failure(&mut self, message: String) {
        tracing::warn!(account = %self.account, %message, "connection failed");
        self.record_error("ECONNECT", &message).await;
        self.set_state(AccountState::ConnectError).await;
        self.emit(EventKind::ConnectError, serde_json::json!({"error": message}))
            .await;
        self.log("connection lost").await;
        self.supervisor.release(&self.account, Some(message)).await;
    }

    /// Write `lastError` on the account record.
    async fn record_error(&self, code: &str, message: &str) {
        let error = LastError {
            code: code.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self
            .params
            .registry
            .set_last_error(&self.account, Some(&error))
            .await
        {
            tracing::warn!(account = %self.account, %err, "error write failed");
        }
    }

    /// Write and broadcast a state transition.
    async fn set_state(&self, state: AccountState) {
        if let Err(err) = self.params.registry.set_state(&self.account, state).await {
            tracing::warn!(account = %self.account, %err, "state write failed");
        }
        self.supervisor
            .change(
                &self.account,
                "state",
                serde_json::json!({"state": state.as_str()}),
            )
            .await;
    }

    /// Enqueue an event envelope into the notification queue.
    async fn emit(&self, kind: EventKind, data: serde_json::Value) {
        let event = Event::new(&self.account, kind, data);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(account = %self.account, %err, "event encode failed");
                return;
            }
        };

        let result = self
            .params
            .notify_queue
            .enqueue(
                payload,
                JobOptions {
                    attempts: NOTIFY_ATTEMPTS,
                    backoff_base: NOTIFY_BACKOFF_BASE,
                    ..Default::default()
                },
            )
            .await;
        match result {
            Ok(_) => self.supervisor.metric("events_emitted", 1).await,
            Err(err) => {
                tracing::error!(account = %self.account, %err, "event enqueue failed");
            }
        }
    }

    /// Append to the per-account log ring when enabled.
    async fn log(&self, message: &str) {
        if !self.logs_enabled {
            return;
        }

        let entry = LogEntry {
            ts: Utc::now().timestamp_millis(),
            level: "info".to_string(),
            message: message.to_string(),
        };
        let Ok(encoded) = rmp_serde::to_vec_named(&entry) else {
            return;
        };
        let cap = self.params.max_log_lines.load(Ordering::Relaxed);
        let key = format!("iah:{}", self.account);
        if let Err(err) = self.params.store.list_push_capped(&key, encoded, cap).await {
            tracing::warn!(account = %self.account, %err, "log ring write failed");
        }
    }
}

/// A per-account log-ring entry.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Unix milliseconds.
    pub ts: i64,

    /// Severity label.
    pub level: String,

    /// Log line.
    pub message: String,
}

/// Failure modes while building a connect spec.
enum SpecError {
    /// Credential-shaped problem; park until the operator acts.
    Auth(String),

    /// Transient problem; release for damped reassignment.
    Transport(String),
}

/// Known OAuth2 provider endpoints.
struct ProviderEndpoints {
    /// IMAP host.
    imap_host: &'static str,

    /// IMAP port.
    imap_port: u16,

    /// SMTP host.
    smtp_host: &'static str,

    /// SMTP port.
    smtp_port: u16,
}

/// Endpoints for a provider id.
fn provider_endpoints(provider: &str) -> Option<ProviderEndpoints> {
    match provider {
        "gmail" => Some(ProviderEndpoints {
            imap_host: "imap.gmail.com",
            imap_port: 993,
            smtp_host: "smtp.gmail.com",
            smtp_port: 587,
        }),
        "outlook" => Some(ProviderEndpoints {
            imap_host: "outlook.office365.com",
            imap_port: 993,
            smtp_host: "smtp.office365.com",
            smtp_port: 587,
        }),
        _ => None,
    }
}

/// Map stored security modes onto the session capability's.
fn map_security(mode: account_registry::SecurityMode) -> Security {
    match mode {
        account_registry::SecurityMode::Tls => Security::Tls,
        account_registry::SecurityMode::StartTls => Security::StartTls,
        account_registry::SecurityMode::Plain => Security::Plain,
    }
}

/// Drain session events until the channel closes or `Closed` arrives.
async fn drain_until_closed(events: &mut mpsc::Receiver<SessionEvent>) {
    let drain = async {
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::Closed { .. }) {
                break;
            }
        }
    };
    // A session that refuses to close must not wedge deletion.
    let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
}

/// Pull the Message-ID header out of raw message bytes.
fn extract_message_id(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("message-id") {
            return Some(value.trim().to_string());
        }
    }
    None
}
