//! Bearer-credential acquisition and proactive refresh.
//!
//! The [`TokenManager`] owns the credential exclusively: a credential is
//! immutable once issued and replaced wholesale on every refresh. After each
//! successful grant exchange a one-shot timer is armed to refresh the token
//! ahead of its real expiry; when that timer-driven refresh succeeds the
//! supervisor is told to cycle the connection so the new token is presented
//! at handshake time (the stream endpoint has no in-band re-auth).

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::client::Event;
use crate::config::{Config, GrantType};
use crate::connection::Command;
use crate::error::Error;

/// An issued bearer credential. Immutable; replaced wholesale on refresh.
#[derive(Clone, Debug)]
pub struct Credential {
    access_token: SecretString,
    refresh_token: Option<SecretString>,
    issued_at: Instant,
    expires_at: Instant,
    /// When the proactive refresh should fire; the safety margin ahead of
    /// `expires_at`, floored at half the token lifetime.
    refresh_at: Instant,
}

impl Credential {
    fn from_response(
        response: TokenResponse,
        safety_margin: Duration,
        previous_refresh_token: Option<SecretString>,
    ) -> Self {
        let issued_at = Instant::now();
        let lifetime = Duration::from_secs(response.expires_in);
        let expires_at = issued_at + lifetime;
        // Never schedule earlier than half the lifetime: the token service
        // controls `expires_in`, and a margin at or above it would otherwise
        // fire the refresh immediately, hammering the service in a loop.
        let refresh_at = issued_at + lifetime.saturating_sub(safety_margin).max(lifetime / 2);

        Self {
            access_token: SecretString::from(response.access_token),
            // A refresh response may omit the refresh token; keep the old one.
            refresh_token: response
                .refresh_token
                .map(SecretString::from)
                .or(previous_refresh_token),
            issued_at,
            expires_at,
            refresh_at,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&SecretString> {
        self.refresh_token.as_ref()
    }

    #[must_use]
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    #[must_use]
    pub fn refresh_at(&self) -> Instant {
        self.refresh_at
    }

    /// Whether the credential is still usable without a refresh.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

/// Wire shape of a successful token-service response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

/// Owns credential acquisition, proactive refresh scheduling, and reactive
/// re-authentication against the configured token service.
pub struct TokenManager {
    http: reqwest::Client,
    config: Config,
    current: RwLock<Option<Credential>>,
    /// Cancels the armed refresh timer, if any
    refresh_timer: Mutex<Option<CancellationToken>>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
}

impl TokenManager {
    pub(crate) fn new(
        config: Config,
        http: reqwest::Client,
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            http,
            config,
            current: RwLock::new(None),
            refresh_timer: Mutex::new(None),
            commands,
            events,
        }
    }

    /// The currently held credential, if one has been issued.
    #[must_use]
    pub fn current(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reuse the held credential when it is still fresh, otherwise acquire.
    ///
    /// Reuse re-arms the refresh timer, which a disconnect cancels.
    pub(crate) async fn current_or_acquire(self: &Arc<Self>) -> Result<Credential> {
        if let Some(credential) = self.current()
            && credential.is_fresh()
        {
            self.schedule_refresh(&credential);
            return Ok(credential);
        }
        self.acquire().await
    }

    /// Perform a full grant exchange with the configured parameters.
    ///
    /// On success the credential is stored and the proactive refresh timer is
    /// rescheduled.
    pub async fn acquire(self: &Arc<Self>) -> Result<Credential> {
        let response = self.grant_exchange().await?;
        Ok(self.install(response, None))
    }

    /// Exchange the held refresh token for a new credential, falling back to
    /// one full grant exchange if the refresh is rejected. An exchange
    /// failure propagates to the caller; there is no internal retry loop.
    pub async fn refresh(self: &Arc<Self>) -> Result<Credential> {
        let (response, previous) = self.refresh_exchange().await?;
        Ok(self.install(response, previous))
    }

    async fn grant_exchange(&self) -> Result<TokenResponse> {
        match self.config.grant_type {
            GrantType::ClientCredentials => self.client_credentials_grant().await,
            GrantType::Password => self.password_grant().await,
            GrantType::RefreshToken => {
                let seed = self.config.refresh_token.clone().ok_or_else(|| {
                    Error::validation("refresh_token grant requires a seed refresh_token")
                })?;
                self.refresh_grant(&seed).await
            }
        }
    }

    /// Refresh-grant exchange with full-grant fallback, without installing
    /// the result. Returns the refresh token the response should inherit.
    async fn refresh_exchange(&self) -> Result<(TokenResponse, Option<SecretString>)> {
        let refresh_token = self.current().and_then(|c| c.refresh_token);

        if let Some(token) = refresh_token {
            match self.refresh_grant(&token).await {
                Ok(response) => return Ok((response, Some(token))),
                Err(e) => {
                    tracing::warn!(error = %e, "token refresh failed, falling back to full grant");
                }
            }
        }

        Ok((self.grant_exchange().await?, None))
    }

    /// Cancel the armed proactive refresh timer.
    pub(crate) fn cancel_refresh(&self) {
        if let Some(timer) = self
            .refresh_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.cancel();
        }
    }

    /// Store the freshly issued credential and re-arm the refresh timer.
    fn install(self: &Arc<Self>, response: TokenResponse, previous: Option<SecretString>) -> Credential {
        let credential =
            Credential::from_response(response, self.config.refresh_safety_margin, previous);

        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());

        self.schedule_refresh(&credential);
        credential
    }

    /// Arm a one-shot timer that refreshes the credential just ahead of its
    /// expiry and then asks the supervisor to cycle the connection. Any
    /// previously armed timer is cancelled first.
    fn schedule_refresh(self: &Arc<Self>, credential: &Credential) {
        let timer = CancellationToken::new();
        if let Some(previous) = self
            .refresh_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer.clone())
        {
            previous.cancel();
        }

        let this = Arc::clone(self);
        let deadline = tokio::time::Instant::from_std(credential.refresh_at);

        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => match this.refresh_exchange().await {
                    // A disconnect may land while the exchange is in flight;
                    // installing would re-arm the timer it just cancelled, so
                    // the stale result is discarded instead.
                    Ok(_) if timer.is_cancelled() => {
                        tracing::debug!("refresh timer cancelled mid-exchange, discarding result");
                    }
                    Ok((response, previous)) => {
                        this.install(response, previous);
                        tracing::debug!("credential rotated ahead of expiry");
                        let _ = this.commands.send(Command::Rotate);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "proactive token refresh failed");
                        let _ = this.events.send(Event::Error {
                            message: e.to_string(),
                        });
                    }
                },
            }
        });
    }

    async fn client_credentials_grant(&self) -> Result<TokenResponse> {
        let form = [
            ("grant_type", GrantType::ClientCredentials.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
        ];

        self.request_token(&form, false).await
    }

    async fn password_grant(&self) -> Result<TokenResponse> {
        let username = self.config.username.as_deref().unwrap_or_default();
        let password = self
            .config
            .password
            .as_ref()
            .map(|p| p.expose_secret())
            .unwrap_or_default();

        let mut form = vec![
            ("grant_type", GrantType::Password.as_str()),
            ("username", username),
            ("password", password),
        ];
        if let Some(scope) = self.config.scope.as_deref() {
            form.push(("scope", scope));
        }

        self.request_token(&form, true).await
    }

    async fn refresh_grant(&self, refresh_token: &SecretString) -> Result<TokenResponse> {
        let form = [
            ("grant_type", GrantType::RefreshToken.as_str()),
            ("refresh_token", refresh_token.expose_secret()),
        ];

        self.request_token(&form, true).await
    }

    /// POST the grant form to the token endpoint.
    ///
    /// Non-2xx responses and bodies missing `access_token` surface as auth
    /// errors; network failures and timeouts surface as transport errors.
    async fn request_token(
        &self,
        form: &[(&str, &str)],
        basic_auth: bool,
    ) -> Result<TokenResponse> {
        let mut request = self
            .http
            .post(self.config.token_endpoint.clone())
            .timeout(self.config.connect_timeout)
            .form(form);

        if basic_auth {
            request = request.basic_auth(
                &self.config.client_id,
                Some(self.config.client_secret.expose_secret()),
            );
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "token service rejected grant request");
            return Err(Error::auth(Some(status), message));
        }

        let response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::auth(None, format!("malformed token response: {e}")))?;

        if response.access_token.is_empty() {
            return Err(Error::auth(None, "token response missing access_token"));
        }

        Ok(response)
    }
}
