//! The session actor: owns the IMAP session, serves operations and turns
//! mailbox changes into tagged events.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt as _;
use mail_parser::MimeHeaders as _;
use tokio::sync::{mpsc, watch};

use imap_client::{
    Attachment, Contact, FlagUpdate, MessageEnvelope, MessageList, MessageText, OpError, OpResult,
    ServerSpec, SessionEvent, SubmitEnvelope, SubmitReceipt,
};

use crate::auth::Session;
use crate::ops::OpRequest;
use crate::smtp;

/// Mailbox kept selected in steady state.
const PRIMARY_MAILBOX: &str = "INBOX";

/// Mailbox names probed for the sent-mail copy.
const SENT_MAILBOXES: &[&str] = &["Sent", "Sent Messages", "[Gmail]/Sent Mail", "INBOX.Sent"];

/// How many recent messages feed the contact builder.
const CONTACT_SCAN_DEPTH: u32 = 200;

/// Runs one account session until it is stopped or the transport fails.
pub(crate) struct SessionActor {
    /// The account id, for logging.
    account: String,

    /// Outbound event channel.
    events: mpsc::Sender<SessionEvent>,

    /// SMTP submission endpoint.
    smtp: Option<ServerSpec>,

    /// Whether submissions are copied to the sent mailbox.
    copy_on_send: bool,

    /// IDLE timeout, also the poll interval without IDLE.
    idle_timeout: Duration,

    /// Known mailbox names.
    mailboxes: BTreeSet<String>,

    /// UIDVALIDITY of the primary mailbox.
    uid_validity: u32,

    /// Known messages of the primary mailbox: uid to flags.
    known: BTreeMap<u32, Vec<String>>,
}

impl SessionActor {
    /// Build an actor.
    pub(crate) fn new(
        account: String,
        events: mpsc::Sender<SessionEvent>,
        smtp: Option<ServerSpec>,
        copy_on_send: bool,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            account,
            events,
            smtp,
            copy_on_send,
            idle_timeout,
            mailboxes: BTreeSet::new(),
            uid_validity: 0,
            known: BTreeMap::new(),
        }
    }

    /// Drive the session to completion.
    ///
    /// Always ends by emitting [`SessionEvent::Closed`] and dropping the
    /// event channel.
    pub(crate) async fn run(
        mut self,
        session: Session,
        mut op_rx: mpsc::Receiver<OpRequest>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let error = match self.run_inner(session, &mut op_rx, &mut stop_rx).await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(account = %self.account, %err, "session ended with error");
                Some(err.to_string())
            }
        };

        op_rx.close();
        let _ = self.events.send(SessionEvent::Closed { error }).await;
    }

    /// The main loop: discover, then alternate waiting and scanning.
    async fn run_inner(
        &mut self,
        mut session: Session,
        op_rx: &mut mpsc::Receiver<OpRequest>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), async_imap::error::Error> {
        self.discover(&mut session).await?;

        let idle_supported = {
            let capabilities = session.capabilities().await?;
            capabilities.has_str("IDLE")
        };
        if !idle_supported {
            tracing::info!(account = %self.account, "server lacks IDLE, falling back to polling");
        }

        loop {
            if *stop_rx.borrow() {
                let _ = session.logout().await;
                return Ok(());
            }

            let op = if idle_supported {
                let (restored, op) =
                    idle_wait(session, self.idle_timeout, op_rx, stop_rx).await?;
                session = restored;
                op
            } else {
                poll_wait(&mut session, self.idle_timeout, op_rx, stop_rx).await?
            };

            if let Some(op) = op {
                self.handle_op(&mut session, op).await?;
                continue;
            }
            if *stop_rx.borrow() {
                let _ = session.logout().await;
                return Ok(());
            }

            self.scan_changes(&mut session).await?;
        }
    }

    /// Initial mailbox discovery and primary-mailbox snapshot.
    async fn discover(&mut self, session: &mut Session) -> Result<(), async_imap::error::Error> {
        self.mailboxes = list_mailbox_names(session).await?;

        let mailbox = session.select(PRIMARY_MAILBOX).await?;
        self.uid_validity = mailbox.uid_validity.unwrap_or(0);
        self.known = fetch_flags(session).await?;

        tracing::info!(
            account = %self.account,
            mailboxes = self.mailboxes.len(),
            messages = self.known.len(),
            "initial sync completed"
        );
        let _ = self
            .events
            .send(SessionEvent::SyncCompleted {
                mailboxes: self.mailboxes.iter().cloned().collect(),
            })
            .await;
        Ok(())
    }

    /// Diff the server against the local snapshot and emit change events.
    async fn scan_changes(
        &mut self,
        session: &mut Session,
    ) -> Result<(), async_imap::error::Error> {
        let names = list_mailbox_names(session).await?;
        for name in names.difference(&self.mailboxes) {
            let _ = self
                .events
                .send(SessionEvent::MailboxNew {
                    mailbox: name.clone(),
                })
                .await;
        }
        for name in self.mailboxes.difference(&names) {
            let _ = self
                .events
                .send(SessionEvent::MailboxDeleted {
                    mailbox: name.clone(),
                })
                .await;
        }
        self.mailboxes = names;

        let mailbox = session.select(PRIMARY_MAILBOX).await?;
        let uid_validity = mailbox.uid_validity.unwrap_or(0);
        if uid_validity != self.uid_validity {
            tracing::warn!(
                account = %self.account,
                old = self.uid_validity,
                new = uid_validity,
                "UIDVALIDITY changed, resetting mailbox snapshot"
            );
            self.uid_validity = uid_validity;
            self.known = fetch_flags(session).await?;
            let _ = self
                .events
                .send(SessionEvent::MailboxReset {
                    mailbox: PRIMARY_MAILBOX.to_string(),
                })
                .await;
            return Ok(());
        }

        let current = fetch_flags(session).await?;

        let deleted: Vec<u32> = self
            .known
            .keys()
            .filter(|uid| !current.contains_key(uid))
            .copied()
            .collect();
        for uid in deleted {
            let _ = self
                .events
                .send(SessionEvent::MessageDeleted {
                    mailbox: PRIMARY_MAILBOX.to_string(),
                    id: uid.to_string(),
                })
                .await;
        }

        let new_uids: Vec<u32> = current
            .keys()
            .filter(|uid| !self.known.contains_key(uid))
            .copied()
            .collect();
        if !new_uids.is_empty() {
            let fetches: Vec<async_imap::types::Fetch> = session
                .uid_fetch(
                    &uid_set(&new_uids),
                    "(UID FLAGS ENVELOPE INTERNALDATE RFC822.SIZE)",
                )
                .await?
                .try_collect()
                .await?;
            for fetch in fetches {
                let Some(uid) = fetch.uid else { continue };
                let envelope = envelope_from_fetch(&fetch);
                let _ = self
                    .events
                    .send(SessionEvent::MessageNew {
                        mailbox: PRIMARY_MAILBOX.to_string(),
                        id: uid.to_string(),
                        internal_date: fetch
                            .internal_date()
                            .map(|date| date.with_timezone(&Utc))
                            .unwrap_or_else(Utc::now),
                        envelope,
                    })
                    .await;
            }
        }

        for (uid, flags) in &current {
            if let Some(previous) = self.known.get(uid)
                && previous != flags
            {
                let _ = self
                    .events
                    .send(SessionEvent::MessageUpdated {
                        mailbox: PRIMARY_MAILBOX.to_string(),
                        id: uid.to_string(),
                        flags: flags.clone(),
                    })
                    .await;
            }
        }

        self.known = current;
        Ok(())
    }

    /// Serve one operation, replying on its channel.
    ///
    /// Operation failures are returned to the caller; only failures on
    /// the steady-state path tear the session down.
    async fn handle_op(
        &mut self,
        session: &mut Session,
        op: OpRequest,
    ) -> Result<(), async_imap::error::Error> {
        match op {
            OpRequest::List {
                mailbox,
                page,
                page_size,
                reply,
            } => {
                let result = self.op_list(session, &mailbox, page, page_size).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::Get { mailbox, id, reply } => {
                let result = op_get(session, &mailbox, &id).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::Text {
                mailbox,
                id,
                max_bytes,
                reply,
            } => {
                let result = op_text(session, &mailbox, &id, max_bytes).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::Raw { mailbox, id, reply } => {
                let result = op_raw(session, &mailbox, &id).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::Attachment {
                mailbox,
                id,
                index,
                reply,
            } => {
                let result = op_attachment(session, &mailbox, &id, index).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::Update {
                mailbox,
                id,
                flags,
                reply,
            } => {
                let result = op_update(session, &mailbox, &id, flags).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::Move {
                mailbox,
                id,
                target,
                reply,
            } => {
                let result = op_move(session, &mailbox, &id, &target).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::DeleteMessage { mailbox, id, reply } => {
                let result = op_delete_message(session, &mailbox, &id).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::Submit {
                raw,
                envelope,
                reply,
            } => {
                let result = self.op_submit(session, &raw, &envelope).await;
                let _ = reply.send(result);
            }
            OpRequest::Upload {
                mailbox,
                raw,
                flags,
                reply,
            } => {
                let result = op_upload(session, &mailbox, &raw, &flags).await;
                reselect_primary(session, &mailbox).await?;
                let _ = reply.send(result);
            }
            OpRequest::CreateMailbox { mailbox, reply } => {
                let result = session
                    .create(&mailbox)
                    .await
                    .map_err(|err| OpError::transport(err.to_string()));
                let _ = reply.send(result);
            }
            OpRequest::DeleteMailbox { mailbox, reply } => {
                let result = session
                    .delete(&mailbox)
                    .await
                    .map_err(|err| OpError::transport(err.to_string()));
                let _ = reply.send(result);
            }
            OpRequest::Contacts { reply } => {
                let result = self.op_contacts(session).await;
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    /// List envelopes in a mailbox, newest first.
    async fn op_list(
        &mut self,
        session: &mut Session,
        mailbox: &str,
        page: u32,
        page_size: u32,
    ) -> OpResult<MessageList> {
        let page_size = page_size.clamp(1, 250);
        session
            .select(mailbox)
            .await
            .map_err(|err| OpError::not_found(err.to_string()))?;

        let uids = session
            .uid_search("ALL")
            .await
            .map_err(|err| OpError::transport(err.to_string()))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));

        let total = uids.len() as u32;
        let pages = total.div_ceil(page_size).max(1);
        let page = page.min(pages - 1);
        let slice: Vec<u32> = uids
            .into_iter()
            .skip((page * page_size) as usize)
            .take(page_size as usize)
            .collect();

        let mut messages = Vec::with_capacity(slice.len());
        if !slice.is_empty() {
            let fetches: Vec<async_imap::types::Fetch> = session
                .uid_fetch(
                    &uid_set(&slice),
                    "(UID FLAGS ENVELOPE INTERNALDATE RFC822.SIZE)",
                )
                .await
                .map_err(|err| OpError::transport(err.to_string()))?
                .try_collect()
                .await
                .map_err(|err| OpError::transport(err.to_string()))?;
            let mut by_uid: BTreeMap<u32, MessageEnvelope> = fetches
                .iter()
                .filter_map(|fetch| fetch.uid.map(|uid| (uid, envelope_from_fetch(fetch))))
                .collect();
            for uid in slice {
                if let Some(envelope) = by_uid.remove(&uid) {
                    messages.push(envelope);
                }
            }
        }

        Ok(MessageList {
            messages,
            total,
            page,
            pages,
        })
    }

    /// Submit over SMTP, optionally copying to the sent mailbox.
    async fn op_submit(
        &mut self,
        session: &mut Session,
        raw: &[u8],
        envelope: &SubmitEnvelope,
    ) -> OpResult<SubmitReceipt> {
        let Some(server) = self.smtp.clone() else {
            return Err(OpError::permanent("account has no submission endpoint"));
        };
        let receipt = smtp::submit(&server, raw, envelope).await?;

        if self.copy_on_send {
            let sent = SENT_MAILBOXES
                .iter()
                .find(|name| self.mailboxes.contains(**name))
                .copied()
                .unwrap_or(SENT_MAILBOXES[0]);
            if let Err(err) = session.append(sent, Some("(\\Seen)"), None, raw).await {
                tracing::warn!(account = %self.account, %err, "sent-mailbox copy failed");
            }
        }

        Ok(receipt)
    }

    /// Build a contact list from recent primary-mailbox traffic.
    async fn op_contacts(&mut self, session: &mut Session) -> OpResult<Vec<Contact>> {
        let list = self
            .op_list(session, PRIMARY_MAILBOX, 0, CONTACT_SCAN_DEPTH)
            .await?;

        let mut seen = BTreeSet::new();
        let mut contacts = Vec::new();
        for message in list.messages {
            for entry in std::iter::once(message.from.clone()).chain(message.to.iter().cloned()) {
                let (name, address) = split_address(&entry);
                if address.is_empty() || !seen.insert(address.clone()) {
                    continue;
                }
                contacts.push(Contact { name, address });
            }
        }
        Ok(contacts)
    }
}

/// Wait inside IDLE until new data, an operation, a stop or the timeout.
///
/// Returns the restored session and the operation that interrupted the
/// wait, if any.
async fn idle_wait(
    session: Session,
    idle_timeout: Duration,
    op_rx: &mut mpsc::Receiver<OpRequest>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(Session, Option<OpRequest>), async_imap::error::Error> {
    let mut handle = session.idle();
    handle.init().await?;
    let (idle_wait, interrupt) = handle.wait_with_timeout(idle_timeout);
    tokio::pin!(idle_wait);

    let mut pending_op = None;
    tokio::select! {
        result = &mut idle_wait => {
            result?;
        }
        op = op_rx.recv() => {
            pending_op = op;
            drop(interrupt);
            idle_wait.await?;
        }
        _ = stop_rx.changed() => {
            drop(interrupt);
            idle_wait.await?;
        }
    }

    drop(idle_wait);
    let session = handle.done().await?;
    Ok((session, pending_op))
}

/// Wait without IDLE: sleep until the poll interval, an operation or a
/// stop, then issue a NOOP so the next scan sees fresh state.
async fn poll_wait(
    session: &mut Session,
    poll_interval: Duration,
    op_rx: &mut mpsc::Receiver<OpRequest>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<Option<OpRequest>, async_imap::error::Error> {
    let mut pending_op = None;
    tokio::select! {
        _ = tokio::time::sleep(poll_interval) => {
            session.noop().await?;
        }
        op = op_rx.recv() => {
            pending_op = op;
        }
        _ = stop_rx.changed() => {}
    }
    Ok(pending_op)
}

/// List mailbox names on the server.
async fn list_mailbox_names(
    session: &mut Session,
) -> Result<BTreeSet<String>, async_imap::error::Error> {
    let names: Vec<async_imap::types::Name> = session
        .list(Some(""), Some("*"))
        .await?
        .try_collect()
        .await?;
    Ok(names.iter().map(|name| name.name().to_string()).collect())
}

/// Fetch the flags of every message in the selected mailbox.
async fn fetch_flags(
    session: &mut Session,
) -> Result<BTreeMap<u32, Vec<String>>, async_imap::error::Error> {
    let fetches: Vec<async_imap::types::Fetch> = session
        .uid_fetch("1:*", "(UID FLAGS)")
        .await?
        .try_collect()
        .await?;
    Ok(fetches
        .iter()
        .filter_map(|fetch| fetch.uid.map(|uid| (uid, flag_names(fetch))))
        .collect())
}

/// Re-select the primary mailbox after an op touched another one.
async fn reselect_primary(
    session: &mut Session,
    touched: &str,
) -> Result<(), async_imap::error::Error> {
    if touched != PRIMARY_MAILBOX {
        session.select(PRIMARY_MAILBOX).await?;
    }
    Ok(())
}

/// Load one envelope.
async fn op_get(session: &mut Session, mailbox: &str, id: &str) -> OpResult<MessageEnvelope> {
    select_for_op(session, mailbox).await?;
    let uid = parse_uid(id)?;
    let fetches: Vec<async_imap::types::Fetch> = session
        .uid_fetch(
            &uid.to_string(),
            "(UID FLAGS ENVELOPE INTERNALDATE RFC822.SIZE)",
        )
        .await
        .map_err(|err| OpError::transport(err.to_string()))?
        .try_collect()
        .await
        .map_err(|err| OpError::transport(err.to_string()))?;
    fetches
        .iter()
        .find(|fetch| fetch.uid == Some(uid))
        .map(envelope_from_fetch)
        .ok_or_else(|| OpError::not_found(format!("message {id} not found in {mailbox}")))
}

/// Load raw message bytes.
async fn op_raw(session: &mut Session, mailbox: &str, id: &str) -> OpResult<Vec<u8>> {
    select_for_op(session, mailbox).await?;
    let uid = parse_uid(id)?;
    let fetches: Vec<async_imap::types::Fetch> = session
        .uid_fetch(&uid.to_string(), "(UID BODY.PEEK[])")
        .await
        .map_err(|err| OpError::transport(err.to_string()))?
        .try_collect()
        .await
        .map_err(|err| OpError::transport(err.to_string()))?;
    fetches
        .iter()
        .find(|fetch| fetch.uid == Some(uid))
        .and_then(|fetch| fetch.body().map(<[u8]>::to_vec))
        .ok_or_else(|| OpError::not_found(format!("message {id} not found in {mailbox}")))
}

/// Load text content, capped per part.
async fn op_text(
    session: &mut Session,
    mailbox: &str,
    id: &str,
    max_bytes: usize,
) -> OpResult<MessageText> {
    let raw = op_raw(session, mailbox, id).await?;
    let message = mail_parser::MessageParser::default()
        .parse(&raw)
        .ok_or_else(|| OpError::permanent("unparseable message"))?;

    let mut truncated = false;
    let mut cap = |text: String| {
        if text.len() > max_bytes {
            truncated = true;
            let mut end = max_bytes;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].to_string()
        } else {
            text
        }
    };

    let plain = cap(message
        .body_text(0)
        .map(|body| body.into_owned())
        .unwrap_or_default());
    let html = cap(message
        .body_html(0)
        .map(|body| body.into_owned())
        .unwrap_or_default());

    Ok(MessageText {
        plain,
        html,
        truncated,
    })
}

/// Load one attachment by index.
async fn op_attachment(
    session: &mut Session,
    mailbox: &str,
    id: &str,
    index: usize,
) -> OpResult<Attachment> {
    let raw = op_raw(session, mailbox, id).await?;
    let message = mail_parser::MessageParser::default()
        .parse(&raw)
        .ok_or_else(|| OpError::permanent("unparseable message"))?;
    let attachment = message
        .attachments()
        .nth(index)
        .ok_or_else(|| OpError::not_found(format!("no attachment {index}")))?;

    Ok(Attachment {
        filename: attachment
            .attachment_name()
            .unwrap_or("attachment")
            .to_string(),
        content_type: attachment
            .content_type()
            .map(|ctype| match ctype.subtype() {
                Some(subtype) => format!("{}/{subtype}", ctype.ctype()),
                None => ctype.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        data: attachment.contents().to_vec(),
    })
}

/// Apply flag changes.
async fn op_update(
    session: &mut Session,
    mailbox: &str,
    id: &str,
    flags: FlagUpdate,
) -> OpResult<()> {
    select_for_op(session, mailbox).await?;
    let uid = parse_uid(id)?;

    if !flags.add.is_empty() {
        let command = format!("+FLAGS ({})", flags.add.join(" "));
        uid_store(session, uid, &command).await?;
    }
    if !flags.remove.is_empty() {
        let command = format!("-FLAGS ({})", flags.remove.join(" "));
        uid_store(session, uid, &command).await?;
    }
    Ok(())
}

/// Move a message to another mailbox, falling back to copy+expunge when
/// the server lacks MOVE.
async fn op_move(session: &mut Session, mailbox: &str, id: &str, target: &str) -> OpResult<()> {
    select_for_op(session, mailbox).await?;
    let uid = parse_uid(id)?;

    if session.uid_mv(uid.to_string(), target).await.is_ok() {
        return Ok(());
    }

    session
        .uid_copy(uid.to_string(), target)
        .await
        .map_err(|err| OpError::transport(err.to_string()))?;
    uid_store(session, uid, "+FLAGS (\\Deleted)").await?;
    expunge(session).await
}

/// Flag a message deleted and expunge.
async fn op_delete_message(session: &mut Session, mailbox: &str, id: &str) -> OpResult<()> {
    select_for_op(session, mailbox).await?;
    let uid = parse_uid(id)?;
    uid_store(session, uid, "+FLAGS (\\Deleted)").await?;
    expunge(session).await
}

/// Append a message; returns the allocated uid.
async fn op_upload(
    session: &mut Session,
    mailbox: &str,
    raw: &[u8],
    flags: &[String],
) -> OpResult<String> {
    let selected = session
        .select(mailbox)
        .await
        .map_err(|err| OpError::not_found(err.to_string()))?;
    let uid_next = selected.uid_next.unwrap_or(0);

    let flag_list = (!flags.is_empty()).then(|| format!("({})", flags.join(" ")));
    session
        .append(mailbox, flag_list.as_deref(), None, raw)
        .await
        .map_err(|err| OpError::transport(err.to_string()))?;

    Ok(uid_next.to_string())
}

/// Select a mailbox for an operation, mapping failure to not-found.
async fn select_for_op(session: &mut Session, mailbox: &str) -> OpResult<()> {
    session
        .select(mailbox)
        .await
        .map(|_| ())
        .map_err(|err| OpError::not_found(err.to_string()))
}

/// Issue a UID STORE, draining the response stream.
async fn uid_store(session: &mut Session, uid: u32, command: &str) -> OpResult<()> {
    let _: Vec<async_imap::types::Fetch> = session
        .uid_store(uid.to_string(), command)
        .await
        .map_err(|err| OpError::transport(err.to_string()))?
        .try_collect()
        .await
        .map_err(|err| OpError::transport(err.to_string()))?;
    Ok(())
}

/// Expunge the selected mailbox, draining the response stream.
async fn expunge(session: &mut Session) -> OpResult<()> {
    let _: Vec<u32> = session
        .expunge()
        .await
        .map_err(|err| OpError::transport(err.to_string()))?
        .try_collect()
        .await
        .map_err(|err| OpError::transport(err.to_string()))?;
    Ok(())
}

/// Parse a message id into a uid.
fn parse_uid(id: &str) -> OpResult<u32> {
    id.parse()
        .map_err(|_| OpError::not_found(format!("invalid message id {id}")))
}

/// Render a uid list as an IMAP sequence set.
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<String>>()
        .join(",")
}

/// Flag names of a fetch response.
fn flag_names(fetch: &async_imap::types::Fetch) -> Vec<String> {
    let mut flags: Vec<String> = fetch.flags().map(|flag| flag_name(&flag)).collect();
    flags.sort();
    flags
}

/// Canonical name of a flag.
fn flag_name(flag: &async_imap::types::Flag<'_>) -> String {
    use async_imap::types::Flag;
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
        _ => String::new(),
    }
}

/// Decode an address list into display strings.
fn address_strings(addresses: &[async_imap::imap_proto::types::Address<'_>]) -> Vec<String> {
    addresses
        .iter()
        .map(|address| {
            let mailbox = address
                .mailbox
                .as_deref()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .unwrap_or_default();
            let host = address
                .host
                .as_deref()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .unwrap_or_default();
            let bare = format!("{mailbox}@{host}");
            match address
                .name
                .as_deref()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
            {
                Some(name) if !name.is_empty() => format!("{name} <{bare}>"),
                _ => bare,
            }
        })
        .collect()
}

/// Build an envelope from a fetch response.
fn envelope_from_fetch(fetch: &async_imap::types::Fetch) -> MessageEnvelope {
    let envelope = fetch.envelope();

    let subject = envelope
        .and_then(|env| env.subject.as_deref())
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();
    let from = envelope
        .and_then(|env| env.from.as_deref())
        .map(address_strings)
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or_default();
    let to = envelope
        .and_then(|env| env.to.as_deref())
        .map(address_strings)
        .unwrap_or_default();
    let date: Option<DateTime<Utc>> = envelope
        .and_then(|env| env.date.as_deref())
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .and_then(|raw| chrono::DateTime::parse_from_rfc2822(raw.trim()).ok())
        .map(|parsed| parsed.with_timezone(&Utc));

    MessageEnvelope {
        id: fetch.uid.map(|uid| uid.to_string()).unwrap_or_default(),
        subject,
        from,
        to,
        date,
        flags: flag_names(fetch),
        size: fetch.size.unwrap_or(0),
    }
}

/// Split a display string back into name and address parts.
fn split_address(entry: &str) -> (String, String) {
    match entry.rsplit_once('<') {
        Some((name, rest)) => (
            name.trim().to_string(),
            rest.trim_end_matches('>').trim().to_string(),
        ),
        None => (String::new(), entry.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_sets_render_as_sequence_lists() {
        assert_eq!(uid_set(&[3, 1, 7]), "3,1,7");
        assert_eq!(uid_set(&[42]), "42");
    }

    #[test]
    fn addresses_split_back_into_parts() {
        assert_eq!(
            split_address("Jo Doe <jo@example.com>"),
            ("Jo Doe".to_string(), "jo@example.com".to_string())
        );
        assert_eq!(
            split_address("jo@example.com"),
            (String::new(), "jo@example.com".to_string())
        );
    }

    #[test]
    fn invalid_uids_map_to_not_found() {
        assert!(parse_uid("17").is_ok());
        let err = parse_uid("seventeen").unwrap_err();
        assert_eq!(err.status_code, 404);
    }
}
