//! IMAP authentication.

use imap_client::Auth;

use crate::stream::MailStream;

/// The authenticated session type.
pub type Session = async_imap::Session<MailStream>;

/// Authenticate a connected client to obtain a session.
pub async fn authenticate(
    client: async_imap::Client<MailStream>,
    auth: &Auth,
) -> Result<Session, async_imap::error::Error> {
    match auth {
        Auth::Login { user, password } => client
            .login(user, password)
            .await
            .map_err(|(err, _client)| err),
        Auth::OAuth2 { user, access_token } => client
            .authenticate(
                "XOAUTH2",
                OAuth2Authenticator {
                    user,
                    access_token,
                },
            )
            .await
            .map_err(|(err, _client)| err),
    }
}

/// SASL XOAUTH2 initial-response builder.
struct OAuth2Authenticator<'a> {
    /// User, typically an email address.
    user: &'a str,

    /// Access token.
    access_token: &'a str,
}

impl async_imap::Authenticator for OAuth2Authenticator<'_> {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}
