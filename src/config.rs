use std::time::Duration;

use bon::Builder;
/// Secret string type that redacts its value in debug output.
pub use secrecy::{ExposeSecret, SecretString};
/// URL type used for the token endpoint and stream endpoint.
pub use url::Url;

use crate::Result;
use crate::error::Error;

/// Refresh this long before the token actually expires.
const DEFAULT_REFRESH_SAFETY_MARGIN: Duration = Duration::from_secs(300);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Fixed delay between reconnect attempts. Deliberately not exponential.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// OAuth2 grant used to obtain the bearer token.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GrantType {
    /// Resource-owner password grant. Requires `username` and `password`.
    Password,
    /// Client-credentials grant, authenticated with `client_id`/`client_secret`.
    #[default]
    ClientCredentials,
    /// Refresh-token grant seeded from [`Config::refresh_token`].
    RefreshToken,
}

impl GrantType {
    #[must_use]
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// Client configuration.
///
/// Built with the generated builder; only the endpoints and client
/// credentials are required:
///
/// ```
/// use tokensock::Config;
/// use url::Url;
///
/// # fn main() -> anyhow::Result<()> {
/// let config = Config::builder()
///     .token_endpoint(Url::parse("https://auth.example.com/oauth2/token")?)
///     .client_id("my-client")
///     .client_secret("my-secret")
///     .stream_url(Url::parse("wss://stream.example.com/prod")?)
///     .build();
/// # Ok(())
/// # }
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Token service endpoint, e.g. `https://auth.example.com/oauth2/token`
    pub token_endpoint: Url,
    #[builder(into)]
    pub client_id: String,
    #[builder(into)]
    pub client_secret: SecretString,
    #[builder(default)]
    pub grant_type: GrantType,
    /// Required for [`GrantType::Password`]
    #[builder(into)]
    pub username: Option<String>,
    /// Required for [`GrantType::Password`]
    #[builder(into)]
    pub password: Option<SecretString>,
    /// OAuth2 scope sent with the password grant, e.g. `openid`
    #[builder(into)]
    pub scope: Option<String>,
    /// Seed token for [`GrantType::RefreshToken`]
    #[builder(into)]
    pub refresh_token: Option<SecretString>,
    /// Stream endpoint, e.g. `wss://stream.example.com/prod`
    pub stream_url: Url,
    #[builder(default = DEFAULT_REFRESH_SAFETY_MARGIN)]
    pub refresh_safety_margin: Duration,
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub max_reconnect_attempts: u32,
    /// Fixed wait between reconnect attempts
    #[builder(default = DEFAULT_RECONNECT_DELAY)]
    pub reconnect_delay: Duration,
    /// Bound on both token requests and the WebSocket handshake
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
}

impl Config {
    /// Check grant-specific required fields and endpoint schemes.
    pub(crate) fn validate(&self) -> Result<()> {
        match self.token_endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::validation(format!(
                    "token_endpoint must be http(s), got `{other}`"
                )));
            }
        }

        match self.stream_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::validation(format!(
                    "stream_url must be ws(s), got `{other}`"
                )));
            }
        }

        match self.grant_type {
            GrantType::Password => {
                if self.username.is_none() || self.password.is_none() {
                    return Err(Error::validation(
                        "password grant requires both username and password",
                    ));
                }
            }
            GrantType::RefreshToken => {
                if self.refresh_token.is_none() {
                    return Err(Error::validation(
                        "refresh_token grant requires a seed refresh_token",
                    ));
                }
            }
            GrantType::ClientCredentials => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(grant_type: GrantType) -> Config {
        Config::builder()
            .token_endpoint(Url::parse("https://auth.example.com/oauth2/token").expect("valid url"))
            .client_id("client")
            .client_secret("secret")
            .grant_type(grant_type)
            .stream_url(Url::parse("wss://stream.example.com/prod").expect("valid url"))
            .build()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = base(GrantType::default());

        assert_eq!(config.grant_type, GrantType::ClientCredentials);
        assert_eq!(config.refresh_safety_margin, Duration::from_secs(300));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(config.validate().is_ok(), "default config should validate");
    }

    #[test]
    fn password_grant_requires_username_and_password() {
        let config = base(GrantType::Password);

        assert!(config.validate().is_err(), "missing username/password");

        let config = Config::builder()
            .token_endpoint(Url::parse("https://auth.example.com/oauth2/token").expect("valid url"))
            .client_id("client")
            .client_secret("secret")
            .grant_type(GrantType::Password)
            .username("user@example.com")
            .password("hunter2")
            .stream_url(Url::parse("wss://stream.example.com/prod").expect("valid url"))
            .build();

        assert!(config.validate().is_ok(), "complete password grant");
    }

    #[test]
    fn refresh_grant_requires_seed_token() {
        let config = base(GrantType::RefreshToken);

        assert!(config.validate().is_err(), "missing seed refresh token");
    }

    #[test]
    fn rejects_non_websocket_stream_url() {
        let config = Config::builder()
            .token_endpoint(Url::parse("https://auth.example.com/oauth2/token").expect("valid url"))
            .client_id("client")
            .client_secret("secret")
            .stream_url(Url::parse("https://stream.example.com/prod").expect("valid url"))
            .build();

        assert!(config.validate().is_err(), "https is not a stream scheme");
    }

    #[test]
    fn grant_type_wire_names() {
        assert_eq!(GrantType::Password.as_str(), "password");
        assert_eq!(GrantType::ClientCredentials.as_str(), "client_credentials");
        assert_eq!(GrantType::RefreshToken.as_str(), "refresh_token");
    }
}
