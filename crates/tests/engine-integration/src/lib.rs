//! End-to-end test harness: a full engine over a scripted mail-session
//! connector and a local webhook endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{mpsc, watch};

use account_registry::{
    AccountMeta, Credentials, ImapCredentials, NewAccount, Registry, SecurityMode,
    SmtpCredentials,
};
use imap_client::{
    Attachment, ConnectError, ConnectSpec, Contact, FlagUpdate, MailConnector, MailOps,
    MessageEnvelope, MessageList, MessageText, OpError, OpResult, SessionEvent, SessionHandle,
    SubmitEnvelope, SubmitReceipt,
};
use kv_store::Store;
use secret_store::SecretVault;
use settings_store::{Settings, WebhookSettings};
use supervisor::{Metrics, Supervisor, SupervisorHandle, WorkerContext, WorkerSpec};

/// Short queue lease so crash tests run quickly.
pub const TEST_QUEUE_LEASE: Duration = Duration::from_millis(500);

/// Fast consumer polling for tests.
const TEST_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Fast promoter cadence for tests.
const TEST_PROMOTER_INTERVAL: Duration = Duration::from_millis(20);

/// A standard test account record.
pub fn test_account(id: &str) -> NewAccount {
    NewAccount {
        id: id.to_string(),
        credentials: Credentials::ImapSmtp {
            imap: ImapCredentials {
                host: "imap.example.com".to_string(),
                port: 993,
                security: SecurityMode::Tls,
                user: format!("{id}@example.com"),
                secret: "secret".to_string(),
            },
            smtp: SmtpCredentials {
                host: "smtp.example.com".to_string(),
                port: 465,
                security: SecurityMode::Tls,
                user: format!("{id}@example.com"),
                secret: "secret".to_string(),
            },
        },
        meta: AccountMeta {
            name: id.to_string(),
            email: format!("{id}@example.com"),
            ..Default::default()
        },
    }
}

/// Scripted behavior for one account's sessions.
#[derive(Default)]
struct Behavior {
    /// Connect failures to serve before connects succeed.
    connect_failures: VecDeque<ConnectError>,

    /// Results served to `submit_message` calls; empty means success.
    submit_results: VecDeque<OpResult<SubmitReceipt>>,
}

/// A handle to push events into an account's live mock session.
#[derive(Clone)]
pub struct SessionController {
    /// The live session's event sender.
    events: mpsc::Sender<SessionEvent>,
}

impl SessionController {
    /// Push a session event, as if the server reported a change.
    pub async fn push(&self, event: SessionEvent) {
        self.events
            .send(event)
            .await
            .expect("mock session event channel closed");
    }
}

/// A scripted mail-session connector.
#[derive(Default)]
pub struct MockConnector {
    /// Scripted behaviors per account.
    behaviors: Mutex<HashMap<String, Behavior>>,

    /// Unix-millisecond timestamps of every connect call, per account.
    connects: Mutex<HashMap<String, Vec<i64>>>,

    /// Timestamps of every `submit_message` call.
    submit_calls: Mutex<Vec<i64>>,

    /// Live session controllers, newest last, per account.
    sessions: Mutex<HashMap<String, Vec<SessionController>>>,
}

impl MockConnector {
    /// Empty connector; all connects succeed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the next connect attempts for an account to fail.
    pub fn fail_connects(&self, account: &str, errors: Vec<ConnectError>) {
        let mut behaviors = self.behaviors.lock().unwrap();
        behaviors
            .entry(account.to_string())
            .or_default()
            .connect_failures
            .extend(errors);
    }

    /// Script the next `submit_message` results for an account.
    pub fn script_submits(&self, account: &str, results: Vec<OpResult<SubmitReceipt>>) {
        let mut behaviors = self.behaviors.lock().unwrap();
        behaviors
            .entry(account.to_string())
            .or_default()
            .submit_results
            .extend(results);
    }

    /// Timestamps of every connect call for an account.
    pub fn connect_times(&self, account: &str) -> Vec<i64> {
        self.connects
            .lock()
            .unwrap()
            .get(account)
            .cloned()
            .unwrap_or_default()
    }

    /// Timestamps of every submit call.
    pub fn submit_times(&self) -> Vec<i64> {
        self.submit_calls.lock().unwrap().clone()
    }

    /// The most recent live session controller for an account.
    pub fn session(&self, account: &str) -> Option<SessionController> {
        self.sessions
            .lock()
            .unwrap()
            .get(account)
            .and_then(|list| list.last().cloned())
    }

    /// Wait until an account has a live session.
    pub async fn wait_for_session(&self, account: &str) -> SessionController {
        for _ in 0..200 {
            if let Some(session) = self.session(account) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no session appeared for {account}");
    }
}

impl MailConnector for &'static MockConnector {
    fn connect(&self, spec: ConnectSpec) -> BoxFuture<'_, Result<SessionHandle, ConnectError>> {
        let this: &'static MockConnector = *self;
        Box::pin(async move {
            let account = spec.account.clone();
            this.connects
                .lock()
                .unwrap()
                .entry(account.clone())
                .or_default()
                .push(chrono::Utc::now().timestamp_millis());

            let scripted_failure = {
                let mut behaviors = this.behaviors.lock().unwrap();
                behaviors
                    .entry(account.clone())
                    .or_default()
                    .connect_failures
                    .pop_front()
            };
            if let Some(error) = scripted_failure {
                return Err(error);
            }

            let (event_tx, event_rx) = mpsc::channel(imap_client::EVENT_CHANNEL_CAPACITY);
            let (stop_tx, mut stop_rx) = watch::channel(false);

            // Immediate steady state.
            event_tx
                .send(SessionEvent::SyncCompleted {
                    mailboxes: vec!["INBOX".to_string()],
                })
                .await
                .ok();

            // A requested stop closes the session gracefully.
            let closer_events = event_tx.clone();
            tokio::spawn(async move {
                loop {
                    if stop_rx.changed().await.is_err() {
                        return;
                    }
                    if *stop_rx.borrow() {
                        let _ = closer_events
                            .send(SessionEvent::Closed { error: None })
                            .await;
                        return;
                    }
                }
            });

            this.sessions
                .lock()
                .unwrap()
                .entry(account.clone())
                .or_default()
                .push(SessionController {
                    events: event_tx.clone(),
                });

            Ok(SessionHandle {
                events: event_rx,
                ops: Box::new(MockOps {
                    account,
                    behaviors: this,
                }),
                stop: stop_tx,
            })
        })
    }
}

/// The scripted operation surface.
struct MockOps {
    /// Owning account.
    account: String,

    /// Shared connector for scripted results.
    behaviors: &'static MockConnector,
}

// The connector lives in an Arc for the whole test; hand MockOps a
// plain reference by leaking that Arc clone.
pub fn leak_connector(connector: Arc<MockConnector>) -> &'static MockConnector {
    let leaked: &'static mut Arc<MockConnector> = Box::leak(Box::new(connector));
    &**leaked
}

impl MockOps {
    fn next_submit(&self) -> OpResult<SubmitReceipt> {
        self.behaviors
            .submit_calls
            .lock()
            .unwrap()
            .push(chrono::Utc::now().timestamp_millis());
        let mut behaviors = self.behaviors.behaviors.lock().unwrap();
        behaviors
            .entry(self.account.clone())
            .or_default()
            .submit_results
            .pop_front()
            .unwrap_or_else(|| {
                Ok(SubmitReceipt {
                    response: "250 2.0.0 OK".to_string(),
                    message_id: "<mock@example.com>".to_string(),
                })
            })
    }
}

/// A ready future with a fixed value.
fn ready<T: Send + 'static>(value: OpResult<T>) -> BoxFuture<'static, OpResult<T>> {
    Box::pin(async move { value })
}

impl MailOps for MockOps {
    fn list_messages(
        &mut self,
        _mailbox: &str,
        page: u32,
        _page_size: u32,
    ) -> BoxFuture<'_, OpResult<MessageList>> {
        ready(Ok(MessageList {
            messages: Vec::new(),
            total: 0,
            page,
            pages: 1,
        }))
    }

    fn get_message(
        &mut self,
        _mailbox: &str,
        id: &str,
    ) -> BoxFuture<'_, OpResult<MessageEnvelope>> {
        ready(Ok(MessageEnvelope {
            id: id.to_string(),
            subject: "mock".to_string(),
            ..Default::default()
        }))
    }

    fn get_text(
        &mut self,
        _mailbox: &str,
        _id: &str,
        _max_bytes: usize,
    ) -> BoxFuture<'_, OpResult<MessageText>> {
        ready(Ok(MessageText {
            plain: "mock text".to_string(),
            html: String::new(),
            truncated: false,
        }))
    }

    fn get_raw_message(&mut self, _mailbox: &str, _id: &str) -> BoxFuture<'_, OpResult<Vec<u8>>> {
        ready(Ok(b"Subject: mock\r\n\r\nmock".to_vec()))
    }

    fn get_attachment(
        &mut self,
        _mailbox: &str,
        _id: &str,
        _index: usize,
    ) -> BoxFuture<'_, OpResult<Attachment>> {
        ready(Err(OpError::not_found("no attachments in mock")))
    }

    fn update_message(
        &mut self,
        _mailbox: &str,
        _id: &str,
        _flags: FlagUpdate,
    ) -> BoxFuture<'_, OpResult<()>> {
        ready(Ok(()))
    }

    fn move_message(
        &mut self,
        _mailbox: &str,
        _id: &str,
        _target: &str,
    ) -> BoxFuture<'_, OpResult<()>> {
        ready(Ok(()))
    }

    fn delete_message(&mut self, _mailbox: &str, _id: &str) -> BoxFuture<'_, OpResult<()>> {
        ready(Ok(()))
    }

    fn submit_message(
        &mut self,
        _raw: &[u8],
        _envelope: &SubmitEnvelope,
    ) -> BoxFuture<'_, OpResult<SubmitReceipt>> {
        ready(self.next_submit())
    }

    fn upload_message(
        &mut self,
        _mailbox: &str,
        _raw: &[u8],
        _flags: &[String],
    ) -> BoxFuture<'_, OpResult<String>> {
        ready(Ok("1".to_string()))
    }

    fn create_mailbox(&mut self, _mailbox: &str) -> BoxFuture<'_, OpResult<()>> {
        ready(Ok(()))
    }

    fn delete_mailbox(&mut self, _mailbox: &str) -> BoxFuture<'_, OpResult<()>> {
        ready(Ok(()))
    }

    fn build_contacts(&mut self) -> BoxFuture<'_, OpResult<Vec<Contact>>> {
        ready(Ok(Vec::new()))
    }
}

/// A running engine over the mock connector.
pub struct TestEngine {
    /// Backing store.
    pub store: Store,

    /// Account catalog.
    pub registry: Registry,

    /// Runtime settings.
    pub settings: Settings,

    /// The notification queue.
    pub notify_queue: queue_engine::QueueEngine,

    /// The submission queue.
    pub submit_queue: queue_engine::QueueEngine,

    /// Supervisor handle for RPC and releases.
    pub handle: SupervisorHandle,

    /// The scripted connector.
    pub connector: &'static MockConnector,

    /// Shutdown trigger.
    pub shutdown: watch::Sender<bool>,
}

impl TestEngine {
    /// Start an engine with the given IMAP worker count.
    pub async fn start(imap_workers: usize) -> Self {
        let store = Store::in_memory().await;
        let registry = Registry::new(store.clone(), SecretVault::new(None));
        let settings = Settings::new(store.clone());

        let queue_params = queue_engine::Params {
            lease: TEST_QUEUE_LEASE,
            queue_keep: 100,
        };
        let notify_queue = queue_engine::QueueEngine::new(
            store.clone(),
            queue_engine::QueueName::Notify,
            queue_params.clone(),
        );
        let submit_queue = queue_engine::QueueEngine::new(
            store.clone(),
            queue_engine::QueueName::Submit,
            queue_params,
        );

        let connector = leak_connector(MockConnector::new());

        let imap_params = imap_worker::Params {
            store: store.clone(),
            registry: registry.clone(),
            notify_queue: notify_queue.clone(),
            submit_queue: submit_queue.clone(),
            connector: Arc::new(connector),
            refresher: None,
            max_log_lines: Arc::new(AtomicUsize::new(1_000)),
        };
        let submit_params = submit_worker::Params {
            store: store.clone(),
            submit_queue: submit_queue.clone(),
            notify_queue: notify_queue.clone(),
            poll_interval: TEST_POLL_INTERVAL,
            promoter_interval: TEST_PROMOTER_INTERVAL,
        };
        let notify_params = notify_worker::Params {
            notify_queue: notify_queue.clone(),
            settings: settings.clone(),
            user_agent: "mailsync-tests/0.0".to_string(),
            http: reqwest::Client::new(),
            poll_interval: TEST_POLL_INTERVAL,
            promoter_interval: TEST_PROMOTER_INTERVAL,
        };

        let workers = vec![
            WorkerSpec {
                kind: "imap".to_string(),
                count: imap_workers,
                assignable: true,
                factory: Arc::new(move |ctx: WorkerContext| {
                    let params = imap_params.clone();
                    Box::pin(imap_worker::run(ctx, params))
                }),
            },
            WorkerSpec {
                kind: "submit".to_string(),
                count: 1,
                assignable: false,
                factory: Arc::new(move |ctx: WorkerContext| {
                    let params = submit_params.clone();
                    Box::pin(submit_worker::run(ctx, params))
                }),
            },
            WorkerSpec {
                kind: "notify".to_string(),
                count: 1,
                assignable: false,
                factory: Arc::new(move |ctx: WorkerContext| {
                    let params = notify_params.clone();
                    Box::pin(notify_worker::run(ctx, params))
                }),
            },
        ];

        let metrics = Arc::new(Metrics::new(store.clone(), 1));
        let supervisor = Supervisor::new(supervisor::Params {
            store: store.clone(),
            registry: registry.clone(),
            metrics,
            workers,
            rpc_timeout: Duration::from_secs(5),
        });
        let handle = supervisor.handle();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(supervisor.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            store,
            registry,
            settings,
            notify_queue,
            submit_queue,
            handle,
            connector,
            shutdown: shutdown_tx,
        }
    }

    /// Enable webhooks pointed at a URL, subscribed to everything.
    pub async fn enable_webhooks(&self, url: &str) {
        self.settings
            .set_webhooks(&WebhookSettings {
                enabled: true,
                url: url.to_string(),
                ..Default::default()
            })
            .await
            .expect("webhook settings write");
    }

    /// Wait until an account record reaches the given state.
    pub async fn wait_for_state(&self, account: &str, state: account_registry::AccountState) {
        for _ in 0..400 {
            if let Ok(Some(record)) = self.registry.load(account).await
                && record.state == state
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("{account} never reached {state:?}");
    }
}

/// A recorded webhook delivery.
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    /// Raw body bytes, exactly as signed by the sender.
    pub raw: Vec<u8>,

    /// Decoded JSON body.
    pub body: serde_json::Value,

    /// Request headers as name/value pairs, lowercased names.
    pub headers: Vec<(String, String)>,
}

/// A local webhook endpoint recording deliveries.
pub struct WebhookServer {
    /// URL to configure as the webhook target.
    pub url: String,

    /// Recorded deliveries, oldest first.
    hits: Arc<Mutex<Vec<RecordedDelivery>>>,

    /// Response status served to deliveries.
    status: Arc<AtomicU16>,
}

impl WebhookServer {
    /// Start a server responding with `status` to every delivery.
    pub async fn start(status: u16) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind webhook listener");
        let url = format!("http://{}/hook", listener.local_addr().expect("local addr"));

        let hits: Arc<Mutex<Vec<RecordedDelivery>>> = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(AtomicU16::new(status));

        let accept_hits = hits.clone();
        let accept_status = status.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = accept_hits.clone();
                let status = accept_status.clone();
                tokio::spawn(async move {
                    if let Some(delivery) = read_request(stream, status.load(Ordering::Relaxed)).await
                    {
                        hits.lock().unwrap().push(delivery);
                    }
                });
            }
        });

        Self { url, hits, status }
    }

    /// Change the status served to subsequent deliveries.
    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::Relaxed);
    }

    /// Recorded deliveries so far.
    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.hits.lock().unwrap().clone()
    }

    /// Wait until at least `count` deliveries arrived.
    pub async fn wait_for_deliveries(&self, count: usize) -> Vec<RecordedDelivery> {
        for _ in 0..200 {
            let deliveries = self.deliveries();
            if deliveries.len() >= count {
                return deliveries;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "expected {count} deliveries, got {}",
            self.deliveries().len()
        );
    }
}

/// Read one HTTP request, record it and respond with the given status.
async fn read_request(
    mut stream: tokio::net::TcpStream,
    status: u16,
) -> Option<RecordedDelivery> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let (headers_end, header_text) = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_headers_end(&buf) {
            break (pos, String::from_utf8_lossy(&buf[..pos]).into_owned());
        }
    };

    let headers: Vec<(String, String)> = header_text
        .lines()
        .skip(1)
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_lowercase(), value.trim().to_string()))
        })
        .collect();
    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);

    let mut body = buf[headers_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        410 => "Gone",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let response =
        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await.ok()?;
    let _ = stream.shutdown().await;

    Some(RecordedDelivery {
        body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
        raw: body,
        headers,
    })
}

/// Offset of the `\r\n\r\n` separator.
fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}
