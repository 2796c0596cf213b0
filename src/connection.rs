//! Connection supervision.
//!
//! A single spawned task owns the physical connection lifecycle: it
//! authenticates, opens the WebSocket with the bearer credential, watches for
//! close/error events, and decides between re-authentication, a fixed-delay
//! retry, and giving up. All state transitions funnel through this one task,
//! so no two transitions can race; callers, the proactive-refresh timer, and
//! connection events all reach it through the same command channel.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use backoff::backoff::{Backoff as _, Constant};
use futures::{SinkExt as _, StreamExt as _};
use secrecy::ExposeSecret as _;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;
use crate::client::Event;
use crate::config::Config;
use crate::error::Error;
use crate::router::MessageRouter;
use crate::token::{Credential, TokenManager};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Terminal disconnect reason reported when the retry budget runs out.
pub const REASON_RETRIES_EXHAUSTED: &str = "retries exhausted";

/// Close code endpoints reserve for credential rejection.
const CLOSE_CODE_CREDENTIAL_EXPIRED: u16 = 4001;

/// Connection state tracking. Exactly one instance per client.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Idle,
    /// Obtaining a credential from the token service
    Authenticating,
    /// WebSocket handshake in progress
    Connecting,
    /// Connection established and usable
    Open,
    /// Tearing down after an explicit disconnect
    Closing,
    /// Retry budget exhausted or authentication failed; waits for `connect()`
    Failed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Requests handled by the supervisor task.
pub(crate) enum Command {
    /// Open a connection; `ack` resolves on first `Open` or rejects on
    /// unrecoverable failure
    Connect {
        ack: oneshot::Sender<Result<()>>,
    },
    /// The credential was rotated; cycle the connection so the new token is
    /// presented at handshake time
    Rotate,
    /// Tear everything down and return to `Idle`
    Disconnect,
}

/// Why an open connection stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseCause {
    /// The endpoint rejected the presented credential; triggers a full
    /// re-authentication instead of a plain retry
    CredentialExpired { reason: String },
    /// Anything else; retried within the attempt budget
    Transport { reason: String },
}

/// Map a close frame onto the retry-vs-reauthenticate decision.
///
/// The policy lives in one place so it can be tested in isolation: the
/// reserved close code and a reason matching the expiry pattern both count as
/// credential rejection.
pub(crate) fn classify_close(frame: Option<&CloseFrame>) -> CloseCause {
    let Some(frame) = frame else {
        return CloseCause::Transport {
            reason: "connection closed without a close frame".to_owned(),
        };
    };

    let code = u16::from(frame.code);
    let reason = frame.reason.to_string();
    let lowered = reason.to_lowercase();

    if code == CLOSE_CODE_CREDENTIAL_EXPIRED
        || lowered.contains("token expired")
        || lowered.contains("unauthorized")
    {
        CloseCause::CredentialExpired { reason }
    } else {
        CloseCause::Transport {
            reason: format!("connection closed ({code}): {reason}"),
        }
    }
}

/// How an open session ended.
enum SessionExit {
    /// Close/error event, classified
    Closed(CloseCause),
    /// Credential rotated while open; reconnect with the new token
    Rotate,
    /// Explicit disconnect
    Disconnect,
    /// Command channel closed; the client was dropped
    Shutdown,
}

/// The connection supervisor. Runs as a single task spawned at client
/// construction; see the module docs for the transition rules.
pub(crate) struct Supervisor {
    config: Config,
    tokens: Arc<TokenManager>,
    router: Arc<MessageRouter>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<Event>,
}

impl Supervisor {
    pub(crate) fn new(
        config: Config,
        tokens: Arc<TokenManager>,
        router: Arc<MessageRouter>,
        state_tx: watch::Sender<ConnectionState>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            tokens,
            router,
            state_tx,
            events,
        }
    }

    pub(crate) fn spawn(
        self,
        commands: mpsc::UnboundedReceiver<Command>,
        outbound: mpsc::UnboundedReceiver<String>,
    ) {
        tokio::spawn(self.run(commands, outbound));
    }

    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect { ack } => self.session(&mut commands, &mut outbound, ack).await,
                // Nothing to tear down or cycle while idle
                Command::Disconnect => self.enter_idle(false),
                Command::Rotate => {}
            }
        }
    }

    /// One full connection session: authenticate, then connect/reconnect
    /// until an explicit disconnect or the retry budget runs out.
    async fn session(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        ack: oneshot::Sender<Result<()>>,
    ) {
        let mut rotate_pending = false;

        self.set_state(ConnectionState::Authenticating);
        let mut credential =
            match supervised(commands, &mut rotate_pending, self.tokens.current_or_acquire()).await
            {
                Some(Ok(credential)) => credential,
                Some(Err(e)) => {
                    // Auth failure at connect time is not transient; no retry.
                    self.set_state(ConnectionState::Failed);
                    let _ = ack.send(Err(e));
                    return;
                }
                None => {
                    self.abort_session(Some(ack));
                    return;
                }
            };

        let mut ack = Some(ack);
        let mut attempts = 0_u32;
        let mut backoff = Constant::new(self.config.reconnect_delay);

        loop {
            self.set_state(ConnectionState::Connecting);

            let attempt = timeout(
                self.config.connect_timeout,
                open_stream(&self.config, &credential),
            );
            let Some(outcome) = supervised(commands, &mut rotate_pending, attempt).await else {
                self.abort_session(ack.take());
                return;
            };

            let cause = match outcome {
                Ok(Ok(stream)) => {
                    attempts = 0;
                    backoff.reset();
                    self.set_state(ConnectionState::Open);
                    if let Some(ack) = ack.take() {
                        let _ = ack.send(Ok(()));
                    }
                    let _ = self.events.send(Event::Connected);
                    tracing::debug!("stream connection open");

                    if rotate_pending {
                        // A rotation arrived while we were getting here; honor
                        // the single pending cycle now.
                        rotate_pending = false;
                        credential = self.tokens.current().unwrap_or(credential);
                        tracing::debug!("cycling connection with rotated credential");
                        continue;
                    }

                    match self.drive(stream, commands, outbound).await {
                        SessionExit::Disconnect => {
                            self.enter_idle(true);
                            return;
                        }
                        SessionExit::Shutdown => {
                            self.enter_idle(false);
                            return;
                        }
                        SessionExit::Rotate => {
                            credential = self.tokens.current().unwrap_or(credential);
                            tracing::debug!("credential rotated, cycling connection");
                            continue;
                        }
                        SessionExit::Closed(cause) => cause,
                    }
                }
                Ok(Err(e)) => CloseCause::Transport {
                    reason: e.to_string(),
                },
                Err(_elapsed) => CloseCause::Transport {
                    reason: format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    ),
                },
            };

            match cause {
                CloseCause::CredentialExpired { reason } => {
                    // Full re-authentication, never a refresh, and no retry
                    // slot consumed.
                    tracing::info!(%reason, "credential rejected by stream endpoint, re-authenticating");
                    self.set_state(ConnectionState::Authenticating);

                    match supervised(commands, &mut rotate_pending, self.tokens.acquire()).await {
                        Some(Ok(new_credential)) => credential = new_credential,
                        Some(Err(e)) => {
                            self.set_state(ConnectionState::Failed);
                            match ack.take() {
                                Some(ack) => {
                                    let _ = ack.send(Err(e));
                                }
                                None => {
                                    let _ = self.events.send(Event::Error {
                                        message: e.to_string(),
                                    });
                                    let _ = self.events.send(Event::Disconnected {
                                        reason: "authentication failed".to_owned(),
                                    });
                                }
                            }
                            return;
                        }
                        None => {
                            self.abort_session(ack.take());
                            return;
                        }
                    }
                    // The reconnect below presents the newest credential, so
                    // any rotation noted meanwhile is already satisfied.
                    rotate_pending = false;
                }
                CloseCause::Transport { reason } => {
                    attempts = attempts.saturating_add(1);
                    if ack.is_none() {
                        let _ = self.events.send(Event::Error {
                            message: reason.clone(),
                        });
                    }

                    if attempts > self.config.max_reconnect_attempts {
                        self.set_state(ConnectionState::Failed);
                        match ack.take() {
                            Some(ack) => {
                                let _ = ack.send(Err(Error::transport(reason)));
                            }
                            None => {
                                let _ = self.events.send(Event::Disconnected {
                                    reason: REASON_RETRIES_EXHAUSTED.to_owned(),
                                });
                            }
                        }
                        return;
                    }

                    tracing::warn!(
                        %reason,
                        attempt = attempts,
                        max = self.config.max_reconnect_attempts,
                        "stream connection lost, retrying after fixed delay"
                    );

                    if let Some(delay) = backoff.next_backoff()
                        && supervised(commands, &mut rotate_pending, tokio::time::sleep(delay))
                            .await
                            .is_none()
                    {
                        self.abort_session(ack.take());
                        return;
                    }
                }
            }
        }
    }

    /// Pump an open connection: inbound frames to the router, queued payloads
    /// to the socket, and commands as they arrive.
    async fn drive(
        &self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> SessionExit {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.router.dispatch(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        return SessionExit::Closed(classify_close(frame.as_ref()));
                    }
                    Some(Ok(_)) => {
                        // Binary and control frames are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        return SessionExit::Closed(CloseCause::Transport {
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        return SessionExit::Closed(CloseCause::Transport {
                            reason: "connection closed without a close frame".to_owned(),
                        });
                    }
                },

                Some(text) = outbound.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return SessionExit::Closed(CloseCause::Transport {
                            reason: e.to_string(),
                        });
                    }
                }

                command = commands.recv() => match command {
                    Some(Command::Disconnect) => {
                        let _ = write.close().await;
                        return SessionExit::Disconnect;
                    }
                    Some(Command::Rotate) => {
                        let _ = write.close().await;
                        return SessionExit::Rotate;
                    }
                    Some(Command::Connect { ack }) => {
                        // Already open; resolve immediately.
                        let _ = ack.send(Ok(()));
                    }
                    None => return SessionExit::Shutdown,
                }
            }
        }
    }

    /// Disconnect arrived before a usable connection existed.
    fn abort_session(&self, ack: Option<oneshot::Sender<Result<()>>>) {
        match ack {
            Some(ack) => {
                let _ = ack.send(Err(Error::validation(
                    "disconnected before the connection opened",
                )));
                self.enter_idle(false);
            }
            None => self.enter_idle(true),
        }
    }

    fn enter_idle(&self, emit_disconnected: bool) {
        self.set_state(ConnectionState::Closing);
        self.tokens.cancel_refresh();
        self.set_state(ConnectionState::Idle);
        if emit_disconnected {
            let _ = self.events.send(Event::Disconnected {
                reason: "disconnect requested".to_owned(),
            });
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

/// Open the WebSocket handshake, presenting the bearer credential in the
/// `Authorization` header.
async fn open_stream(config: &Config, credential: &Credential) -> Result<WsStream> {
    let mut request = config.stream_url.as_str().into_client_request()?;
    let bearer = format!("Bearer {}", credential.access_token().expose_secret());
    let value = bearer
        .parse()
        .map_err(|_| Error::validation("bearer token is not a valid header value"))?;
    request.headers_mut().insert(AUTHORIZATION, value);

    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

/// Await `future` while continuing to service supervisor commands.
///
/// Returns `None` when a disconnect arrives (or the command channel closes),
/// dropping `future` mid-flight. Rotation requests are coalesced into the
/// single pending flag; overlapping connect calls are rejected.
async fn supervised<T>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    rotate_pending: &mut bool,
    future: impl Future<Output = T>,
) -> Option<T> {
    let mut future = pin!(future);
    loop {
        tokio::select! {
            output = &mut future => return Some(output),
            command = commands.recv() => match command {
                Some(Command::Disconnect) | None => return None,
                Some(Command::Rotate) => *rotate_pending = true,
                Some(Command::Connect { ack }) => {
                    let _ = ack.send(Err(Error::validation(
                        "connection attempt already in progress",
                    )));
                }
            }
        }
    }
}
