//! Channel-backed operation surface.
//!
//! The session actor owns the IMAP session exclusively; operations are
//! sent to it as requests with reply channels.

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use imap_client::{
    Attachment, Contact, FlagUpdate, MailOps, MessageEnvelope, MessageList, MessageText, OpError,
    OpResult, SubmitEnvelope, SubmitReceipt,
};

/// A request served by the session actor.
#[derive(Debug)]
pub(crate) enum OpRequest {
    /// List message envelopes.
    List {
        /// Mailbox name.
        mailbox: String,

        /// Zero-based page.
        page: u32,

        /// Page size.
        page_size: u32,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<MessageList>>,
    },

    /// Load one envelope.
    Get {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<MessageEnvelope>>,
    },

    /// Load text content.
    Text {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Per-part size cap.
        max_bytes: usize,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<MessageText>>,
    },

    /// Load raw message bytes.
    Raw {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<Vec<u8>>>,
    },

    /// Load one attachment.
    Attachment {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Attachment index.
        index: usize,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<Attachment>>,
    },

    /// Apply flag changes.
    Update {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Flag changes.
        flags: FlagUpdate,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<()>>,
    },

    /// Move a message.
    Move {
        /// Source mailbox.
        mailbox: String,

        /// Message id.
        id: String,

        /// Target mailbox.
        target: String,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<()>>,
    },

    /// Delete a message.
    DeleteMessage {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<()>>,
    },

    /// Submit over SMTP.
    Submit {
        /// Raw RFC 5322 message.
        raw: Vec<u8>,

        /// SMTP envelope.
        envelope: SubmitEnvelope,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<SubmitReceipt>>,
    },

    /// Append a message to a mailbox.
    Upload {
        /// Mailbox name.
        mailbox: String,

        /// Raw RFC 5322 message.
        raw: Vec<u8>,

        /// Initial flags.
        flags: Vec<String>,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<String>>,
    },

    /// Create a mailbox.
    CreateMailbox {
        /// Mailbox name.
        mailbox: String,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<()>>,
    },

    /// Delete a mailbox.
    DeleteMailbox {
        /// Mailbox name.
        mailbox: String,

        /// Reply channel.
        reply: oneshot::Sender<OpResult<()>>,
    },

    /// Build a contact list.
    Contacts {
        /// Reply channel.
        reply: oneshot::Sender<OpResult<Vec<Contact>>>,
    },
}

/// Client half of the operation channel.
pub(crate) struct OpsClient {
    /// Requests to the session actor.
    pub(crate) tx: mpsc::Sender<OpRequest>,
}

impl OpsClient {
    /// Send a request and await its reply.
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<OpResult<T>>) -> OpRequest,
    ) -> OpResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| OpError::transport("session closed"))?;
        rx.await
            .unwrap_or_else(|_| Err(OpError::transport("session closed")))
    }
}

impl MailOps for OpsClient {
    fn list_messages(
        &mut self,
        mailbox: &str,
        page: u32,
        page_size: u32,
    ) -> BoxFuture<'_, OpResult<MessageList>> {
        let mailbox = mailbox.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::List {
                mailbox,
                page,
                page_size,
                reply,
            })
            .await
        })
    }

    fn get_message(&mut self, mailbox: &str, id: &str) -> BoxFuture<'_, OpResult<MessageEnvelope>> {
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        Box::pin(async move { self.call(|reply| OpRequest::Get { mailbox, id, reply }).await })
    }

    fn get_text(
        &mut self,
        mailbox: &str,
        id: &str,
        max_bytes: usize,
    ) -> BoxFuture<'_, OpResult<MessageText>> {
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::Text {
                mailbox,
                id,
                max_bytes,
                reply,
            })
            .await
        })
    }

    fn get_raw_message(&mut self, mailbox: &str, id: &str) -> BoxFuture<'_, OpResult<Vec<u8>>> {
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        Box::pin(async move { self.call(|reply| OpRequest::Raw { mailbox, id, reply }).await })
    }

    fn get_attachment(
        &mut self,
        mailbox: &str,
        id: &str,
        index: usize,
    ) -> BoxFuture<'_, OpResult<Attachment>> {
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::Attachment {
                mailbox,
                id,
                index,
                reply,
            })
            .await
        })
    }

    fn update_message(
        &mut self,
        mailbox: &str,
        id: &str,
        flags: FlagUpdate,
    ) -> BoxFuture<'_, OpResult<()>> {
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::Update {
                mailbox,
                id,
                flags,
                reply,
            })
            .await
        })
    }

    fn move_message(
        &mut self,
        mailbox: &str,
        id: &str,
        target: &str,
    ) -> BoxFuture<'_, OpResult<()>> {
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        let target = target.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::Move {
                mailbox,
                id,
                target,
                reply,
            })
            .await
        })
    }

    fn delete_message(&mut self, mailbox: &str, id: &str) -> BoxFuture<'_, OpResult<()>> {
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::DeleteMessage { mailbox, id, reply })
                .await
        })
    }

    fn submit_message(
        &mut self,
        raw: &[u8],
        envelope: &SubmitEnvelope,
    ) -> BoxFuture<'_, OpResult<SubmitReceipt>> {
        let raw = raw.to_vec();
        let envelope = envelope.clone();
        Box::pin(async move {
            self.call(|reply| OpRequest::Submit {
                raw,
                envelope,
                reply,
            })
            .await
        })
    }

    fn upload_message(
        &mut self,
        mailbox: &str,
        raw: &[u8],
        flags: &[String],
    ) -> BoxFuture<'_, OpResult<String>> {
        let mailbox = mailbox.to_string();
        let raw = raw.to_vec();
        let flags = flags.to_vec();
        Box::pin(async move {
            self.call(|reply| OpRequest::Upload {
                mailbox,
                raw,
                flags,
                reply,
            })
            .await
        })
    }

    fn create_mailbox(&mut self, mailbox: &str) -> BoxFuture<'_, OpResult<()>> {
        let mailbox = mailbox.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::CreateMailbox { mailbox, reply })
                .await
        })
    }

    fn delete_mailbox(&mut self, mailbox: &str) -> BoxFuture<'_, OpResult<()>> {
        let mailbox = mailbox.to_string();
        Box::pin(async move {
            self.call(|reply| OpRequest::DeleteMailbox { mailbox, reply })
                .await
        })
    }

    fn build_contacts(&mut self) -> BoxFuture<'_, OpResult<Vec<Contact>>> {
        Box::pin(async move { self.call(|reply| OpRequest::Contacts { reply }).await })
    }
}
