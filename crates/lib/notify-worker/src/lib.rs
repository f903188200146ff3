//! The notification worker: delivers event envelopes to the configured
//! webhook endpoint.
//!
//! Deliveries carry an HMAC-SHA256 signature over the raw body so the
//! receiver can authenticate them. A 404 or 410 response means the
//! endpoint is intentionally gone: webhooks are disabled globally and
//! the job completes. Anything else non-2xx rides the queue's backoff.

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use event_core::{Event, EventKind};
use hmac::Mac as _;
use queue_engine::{Job, JobOutcome, QueueEngine, run_consumer, run_promoter};
use settings_store::{Settings, WebhookSettings};
use supervisor::{AccountRequest, AccountResponse, SupervisorHandle, WorkerContext};

/// Signature header on webhook requests.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// HMAC-SHA256 keyed by the service secret.
type HmacSha256 = hmac::Hmac<sha2::Sha256>;

/// Worker construction params.
#[derive(Clone)]
pub struct Params {
    /// The notification queue this worker consumes.
    pub notify_queue: QueueEngine,

    /// Runtime settings (webhook target, subscriptions, text inclusion).
    pub settings: Settings,

    /// The `User-Agent` header value, `<product>/<version> (+<homepage>)`.
    pub user_agent: String,

    /// HTTP client for deliveries.
    pub http: reqwest::Client,

    /// Idle poll interval between empty reservations.
    pub poll_interval: Duration,

    /// Delayed-to-pending promoter period.
    pub promoter_interval: Duration,
}

/// Run a notification worker until shutdown.
pub async fn run(ctx: WorkerContext, params: Params) {
    ctx.supervisor.ready(&ctx.worker_id).await;
    tracing::info!(worker = %ctx.worker_id, "notification worker ready");

    tokio::spawn(run_promoter(
        params.notify_queue.clone(),
        params.promoter_interval,
        ctx.shutdown.clone(),
    ));

    let supervisor = ctx.supervisor.clone();
    let handler_supervisor = ctx.supervisor.clone();
    let handler_params = params.clone();

    let result = run_consumer(
        params.notify_queue.clone(),
        &ctx.worker_id,
        params.poll_interval,
        ctx.shutdown.clone(),
        move |job| {
            let params = handler_params.clone();
            let supervisor = handler_supervisor.clone();
            async move { deliver(&params, &supervisor, job).await }
        },
        move |job, error| {
            let supervisor = supervisor.clone();
            async move {
                tracing::warn!(job_id = %job.id, %error, "notification dropped after retries");
                supervisor.metric("webhooks_dropped", 1).await;
            }
        },
    )
    .await;

    if let Err(err) = result {
        tracing::error!(worker = %ctx.worker_id, %err, "notification worker store failure");
    }
}

/// Deliver one notification job.
async fn deliver(params: &Params, supervisor: &SupervisorHandle, job: Job) -> JobOutcome {
    let mut event: Event = match job.payload_json() {
        Ok(event) => event,
        Err(err) => return JobOutcome::Discard(format!("undecodable event: {err}")),
    };

    let webhooks = match params.settings.webhooks().await {
        Ok(webhooks) => webhooks,
        Err(err) => return JobOutcome::Retry(format!("settings read: {err}")),
    };

    if !webhooks.enabled || webhooks.url.is_empty() {
        return JobOutcome::Complete(Some("webhooks-disabled".to_string()));
    }
    if !webhooks.subscribes(event.event) {
        return JobOutcome::Complete(Some("not-subscribed".to_string()));
    }

    if webhooks.notify_text && event.event == EventKind::MessageNew {
        attach_text(params, supervisor, &webhooks, &mut event).await;
    }

    let service_secret = match params.settings.service_secret().await {
        Ok(secret) => secret,
        Err(err) => return JobOutcome::Retry(format!("service secret: {err}")),
    };

    let body = match serde_json::to_vec(&event) {
        Ok(body) => body,
        Err(err) => return JobOutcome::Discard(format!("event encode: {err}")),
    };
    let signature = sign(&service_secret, &body);

    let (url, basic_auth) = match split_basic_auth(&webhooks.url) {
        Ok(split) => split,
        Err(err) => return JobOutcome::Retry(format!("invalid webhook URL: {err}")),
    };

    let mut request = params
        .http
        .post(url)
        .header("Content-Type", "application/json")
        .header("User-Agent", &params.user_agent)
        .header(SIGNATURE_HEADER, signature)
        .body(body);
    if let Some(authorization) = basic_auth {
        request = request.header("Authorization", authorization);
    }
    for (name, value) in &webhooks.custom_headers {
        request = request.header(name, value);
    }

    let started = Instant::now();
    let response = request.send().await;
    let elapsed = started.elapsed();
    supervisor.metric("webhook_requests", 1).await;
    supervisor.observe_duration("webhook", elapsed).await;

    match response {
        Ok(response) => {
            let status = response.status();
            supervisor
                .metric(&format!("webhook_status_{}", status.as_u16() / 100), 1)
                .await;
            tracing::debug!(
                event = %event.event,
                account = %event.account,
                status = status.as_u16(),
                elapsed_ms = elapsed.as_millis() as u64,
                "webhook delivered"
            );

            if status.is_success() {
                return JobOutcome::Complete(Some(format!("status-{}", status.as_u16())));
            }

            // The endpoint is intentionally gone; stop bothering it.
            if matches!(status.as_u16(), 404 | 410) {
                tracing::warn!(
                    status = status.as_u16(),
                    "webhook endpoint gone, disabling webhooks"
                );
                if let Err(err) = params.settings.set_webhooks_enabled(false).await {
                    return JobOutcome::Retry(format!("disable write: {err}"));
                }
                supervisor.metric("webhooks_autodisabled", 1).await;
                return JobOutcome::Complete(Some(format!("gone-{}", status.as_u16())));
            }

            JobOutcome::Retry(format!("unexpected status {}", status.as_u16()))
        }
        Err(err) => {
            supervisor.metric("webhook_transport_errors", 1).await;
            JobOutcome::Retry(format!("transport: {err}"))
        }
    }
}

/// Merge message text into a `messageNew` payload via the owning worker.
///
/// Best effort: a failed text fetch never blocks the notification.
async fn attach_text(
    params: &Params,
    supervisor: &SupervisorHandle,
    webhooks: &WebhookSettings,
    event: &mut Event,
) {
    let mailbox = event.data["mailbox"].as_str().unwrap_or_default().to_string();
    let id = event.data["id"].as_str().unwrap_or_default().to_string();
    if mailbox.is_empty() || id.is_empty() {
        return;
    }

    let result = supervisor
        .account_call(
            &event.account,
            AccountRequest::GetText {
                mailbox,
                id,
                max_bytes: webhooks.notify_text_size,
            },
        )
        .await;

    match result {
        Ok(AccountResponse::Text(text)) => {
            event.data["text"] = serde_json::json!({
                "plain": text.plain,
                "html": text.html,
                "truncated": text.truncated,
            });
        }
        Ok(_) => {}
        Err(err) => {
            tracing::debug!(account = %event.account, %err, "text fetch for webhook failed");
        }
    }
}

/// HMAC-SHA256 signature of a body, base64url.
pub fn sign(service_secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(service_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Strip embedded Basic credentials off a URL, returning the bare URL
/// and the `Authorization` header value to use instead.
pub fn split_basic_auth(raw: &str) -> Result<(reqwest::Url, Option<String>), String> {
    let mut url = reqwest::Url::parse(raw).map_err(|err| err.to_string())?;

    let user = url.username().to_string();
    let password = url.password().map(str::to_string);
    if user.is_empty() && password.is_none() {
        return Ok((url, None));
    }

    let credentials = format!("{user}:{}", password.unwrap_or_default());
    let authorization = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    );
    url.set_username("").map_err(|_| "cannot strip username".to_string())?;
    url.set_password(None).map_err(|_| "cannot strip password".to_string())?;

    Ok((url, Some(authorization)))
}
