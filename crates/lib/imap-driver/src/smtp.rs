//! SMTP submission through lettre.

use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport as _, Tokio1Executor};

use imap_client::{Auth, OpError, Security, ServerSpec, SubmitEnvelope, SubmitReceipt};

/// Build a transport for the given submission endpoint.
fn transport(
    server: &ServerSpec,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, OpError> {
    let mut builder = match server.security {
        Security::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&server.host)
            .map_err(|err| OpError::transport(err.to_string()))?,
        Security::StartTls => {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&server.host)
                .map_err(|err| OpError::transport(err.to_string()))?
        }
        Security::Plain => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&server.host),
    };
    builder = builder.port(server.port);

    builder = match &server.auth {
        Auth::Login { user, password } => {
            builder.credentials(Credentials::new(user.clone(), password.clone()))
        }
        Auth::OAuth2 { user, access_token } => builder
            .authentication(vec![lettre::transport::smtp::authentication::Mechanism::Xoauth2])
            .credentials(Credentials::new(user.clone(), access_token.clone())),
    };

    Ok(builder.build())
}

/// Submit a raw message over the account's SMTP endpoint.
///
/// Permanent SMTP rejections map to a permanent error so the submission
/// queue discards instead of retrying.
pub(crate) async fn submit(
    server: &ServerSpec,
    raw: &[u8],
    envelope: &SubmitEnvelope,
) -> Result<SubmitReceipt, OpError> {
    let from = envelope
        .mail_from
        .parse()
        .map_err(|_| OpError::permanent(format!("invalid sender: {}", envelope.mail_from)))?;
    let to = envelope
        .rcpt_to
        .iter()
        .map(|rcpt| rcpt.parse())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| OpError::permanent("invalid recipient"))?;
    let smtp_envelope = lettre::address::Envelope::new(Some(from), to)
        .map_err(|err| OpError::permanent(err.to_string()))?;

    let transport = transport(server)?;
    let response = transport
        .send_raw(&smtp_envelope, raw)
        .await
        .map_err(|err| {
            if err.is_permanent() {
                OpError::permanent(err.to_string())
            } else {
                OpError::transport(err.to_string())
            }
        })?;

    Ok(SubmitReceipt {
        response: response
            .message()
            .collect::<Vec<&str>>()
            .join(" "),
        message_id: extract_message_id(raw).unwrap_or_default(),
    })
}

/// Pull the Message-ID header out of raw message bytes.
fn extract_message_id(raw: &[u8]) -> Option<String> {
    let message = mail_parser::MessageParser::default().parse(raw)?;
    message.message_id().map(|id| format!("<{id}>"))
}
