//! Connection stream plumbing: TCP, TLS modes and the unified stream type.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use imap_client::Security;

/// TLS-secured stream type.
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Errors preparing or establishing a connection stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Failed to load system root certificates.
    #[error("failed to load system root certificates: {0}")]
    RootCerts(#[from] rustls_native_certs::Error),

    /// Invalid DNS name for TLS verification.
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),

    /// Network I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// IMAP protocol error during STARTTLS.
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    /// The server did not send the expected greeting.
    #[error("IMAP server sent no greeting")]
    MissingGreeting,
}

/// A mail server stream, secured or plaintext.
#[derive(Debug)]
pub enum MailStream {
    /// TLS-secured stream.
    Tls(TlsStream),

    /// Plaintext stream.
    Plain(TcpStream),
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl futures_util::AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut read_buf = ReadBuf::new(buf);
        match AsyncRead::poll_read(self, cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl futures_util::AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(self, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(self, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(self, cx)
    }
}

/// Build a rustls connector configured with system root certificates.
pub fn tls_connector() -> Result<tokio_rustls::TlsConnector, StreamError> {
    let mut root_store = rustls::RootCertStore::empty();
    let rustls_native_certs::CertificateResult { certs, errors, .. } =
        rustls_native_certs::load_native_certs();
    if let Some(err) = errors.into_iter().next() {
        return Err(StreamError::RootCerts(err));
    }
    let _ = root_store.add_parsable_certificates(certs);
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(std::sync::Arc::new(
        config,
    )))
}

/// Establish a TLS session over an existing TCP stream.
async fn tls_connect(
    connector: &tokio_rustls::TlsConnector,
    server_name: &str,
    stream: TcpStream,
) -> Result<TlsStream, StreamError> {
    let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|_| StreamError::InvalidDnsName(server_name.to_string()))?;
    Ok(connector.connect(server_name, stream).await?)
}

/// Connect to an IMAP server and read the greeting, upgrading to TLS per
/// the security mode.
pub async fn imap_connect(
    host: &str,
    port: u16,
    security: Security,
) -> Result<async_imap::Client<MailStream>, StreamError> {
    tracing::debug!(imap_host = %host, imap_port = port, ?security, "connecting to IMAP server");

    let tcp_stream = TcpStream::connect((host, port)).await?;

    let client = match security {
        Security::Tls => {
            let connector = tls_connector()?;
            let stream = tls_connect(&connector, host, tcp_stream).await?;
            let mut client = async_imap::Client::new(MailStream::Tls(stream));
            client
                .read_response()
                .await
                .ok_or(StreamError::MissingGreeting)??;
            client
        }
        Security::StartTls => {
            let mut client = async_imap::Client::new(MailStream::Plain(tcp_stream));
            client
                .read_response()
                .await
                .ok_or(StreamError::MissingGreeting)??;
            async_imap::Client::run_command_and_check_ok(&mut client, "STARTTLS").await?;
            let tcp_stream = match client.into_inner() {
                MailStream::Plain(stream) => stream,
                MailStream::Tls(_) => unreachable!("STARTTLS upgrade starts from a plain stream"),
            };
            let connector = tls_connector()?;
            let stream = tls_connect(&connector, host, tcp_stream).await?;
            async_imap::Client::new(MailStream::Tls(stream))
        }
        Security::Plain => {
            let mut client = async_imap::Client::new(MailStream::Plain(tcp_stream));
            client
                .read_response()
                .await
                .ok_or(StreamError::MissingGreeting)??;
            client
        }
    };

    Ok(client)
}

#[allow(dead_code)]
async fn _assert_method(client: &mut async_imap::Client<MailStream>) {
    let _ = client.capabilities().await;
}
