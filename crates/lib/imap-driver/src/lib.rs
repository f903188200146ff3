//! Production mail-session connector over async-imap.
//!
//! Connect and authentication run inline so the worker sees auth
//! rejections synchronously; the live session then moves into an actor
//! task that owns it exclusively, serving operations over a channel and
//! emitting change events on the session's bounded event stream.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use imap_client::{ConnectError, ConnectSpec, MailConnector, SessionHandle};

mod auth;
mod ops;
mod session;
mod smtp;
mod stream;

/// Default IDLE timeout (and poll interval without IDLE).
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Capacity of a session's operation channel.
const OP_CHANNEL_CAPACITY: usize = 32;

/// The async-imap-backed connector.
#[derive(Debug, Clone)]
pub struct ImapDriver {
    /// IDLE timeout; the session re-issues IDLE (or polls) at this cadence.
    pub idle_timeout: Duration,
}

impl Default for ImapDriver {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

impl MailConnector for ImapDriver {
    fn connect(&self, spec: ConnectSpec) -> BoxFuture<'_, Result<SessionHandle, ConnectError>> {
        Box::pin(async move {
            let client = stream::imap_connect(&spec.imap.host, spec.imap.port, spec.imap.security)
                .await
                .map_err(|err| ConnectError::Transport(err.to_string()))?;

            let session = auth::authenticate(client, &spec.imap.auth)
                .await
                .map_err(classify_auth_error)?;

            tracing::info!(
                account = %spec.account,
                imap_host = %spec.imap.host,
                imap_port = spec.imap.port,
                "IMAP session established"
            );

            let (event_tx, event_rx) = mpsc::channel(imap_client::EVENT_CHANNEL_CAPACITY);
            let (op_tx, op_rx) = mpsc::channel(OP_CHANNEL_CAPACITY);
            let (stop_tx, stop_rx) = watch::channel(false);

            let actor = session::SessionActor::new(
                spec.account.clone(),
                event_tx,
                spec.smtp.clone(),
                spec.copy_on_send,
                self.idle_timeout,
            );
            tokio::spawn(actor.run(session, op_rx, stop_rx));

            Ok(SessionHandle {
                events: event_rx,
                ops: Box::new(ops::OpsClient { tx: op_tx }),
                stop: stop_tx,
            })
        })
    }
}

/// Map an authentication failure onto the connect error taxonomy.
///
/// `NO`/`BAD` responses mean the server rejected the credentials; anything
/// else is transport trouble.
fn classify_auth_error(err: async_imap::error::Error) -> ConnectError {
    match &err {
        async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_) => {
            ConnectError::Auth(err.to_string())
        }
        _ => ConnectError::Transport(err.to_string()),
    }
}
