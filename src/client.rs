use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::Result;
use crate::config::Config;
use crate::connection::{Command, ConnectionState, Supervisor};
use crate::error::Error;
use crate::router::MessageRouter;
use crate::token::TokenManager;

/// Broadcast channel capacity for observability events.
const EVENT_CAPACITY: usize = 64;

/// Observability events emitted by the client.
///
/// Reconnects after the first successful `connect()` are invisible to callers
/// except through these.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection reached the open state (fires on every reconnect too)
    Connected,
    /// The client stopped trying: explicit disconnect, retry budget
    /// exhausted, or re-authentication failure
    Disconnected { reason: String },
    /// A failure during autonomous operation; the client is still retrying
    Error { message: String },
}

/// Authenticated, auto-reconnecting streaming client.
///
/// Owns one logical connection: a bearer token is acquired from the token
/// service, presented on the WebSocket handshake, refreshed ahead of expiry,
/// and the connection is cycled or retried as needed. Cheap to clone; all
/// clones drive the same connection.
///
/// # Example
///
/// ```no_run
/// use tokensock::{Client, Config};
/// use url::Url;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::builder()
///         .token_endpoint(Url::parse("https://auth.example.com/oauth2/token")?)
///         .client_id("my-client")
///         .client_secret("my-secret")
///         .stream_url(Url::parse("wss://stream.example.com/prod")?)
///         .build();
///
///     let client = Client::new(config)?;
///     client.on("notification", |message| {
///         println!("notification: {message}");
///     });
///
///     client.connect().await?;
///     client.send(&serde_json::json!({"type": "message", "content": "hello"}))?;
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    tokens: Arc<TokenManager>,
    router: Arc<MessageRouter>,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<Event>,
}

impl Client {
    /// Build a client and spawn its supervisor task.
    ///
    /// Must be called from within a Tokio runtime. No connection is opened
    /// until [`connect`](Self::connect).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.connect_timeout)
            .build()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let tokens = Arc::new(TokenManager::new(
            config.clone(),
            http,
            commands_tx.clone(),
            events_tx.clone(),
        ));
        let router = Arc::new(MessageRouter::new(state_rx.clone(), outbound_tx));

        Supervisor::new(
            config,
            Arc::clone(&tokens),
            Arc::clone(&router),
            state_tx,
            events_tx.clone(),
        )
        .spawn(commands_rx, outbound_rx);

        Ok(Self {
            inner: Arc::new(ClientInner {
                tokens,
                router,
                commands: commands_tx,
                state_rx,
                events_tx,
            }),
        })
    }

    /// Open the connection.
    ///
    /// Resolves once the connection first reaches `Open`; fails on an
    /// unrecoverable authentication or connection failure. Reconnection after
    /// a later drop happens autonomously and surfaces only through
    /// [`events`](Self::events). Always accepted again after the client
    /// entered `Failed`.
    pub async fn connect(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Connect { ack: ack_tx })
            .map_err(|_| Error::transport("supervisor task terminated"))?;

        ack_rx
            .await
            .map_err(|_| Error::transport("supervisor dropped the connect request"))?
    }

    /// Serialize and send a payload over the open connection.
    ///
    /// Fails with a not-connected error before the first open and after a
    /// disconnect; data is never silently dropped.
    pub fn send<T: Serialize>(&self, payload: &T) -> Result<()> {
        self.inner.router.send(payload)
    }

    /// Register a handler for inbound messages with the given type tag.
    ///
    /// Registration is idempotent: the last handler for a type wins.
    pub fn on<F>(&self, msg_type: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.router.on(msg_type, handler);
    }

    /// Tear down the connection and return to `Idle`.
    ///
    /// Safe to call from any state; cancels the refresh timer, any in-flight
    /// connect attempt, and any pending retry delay.
    pub fn disconnect(&self) {
        self.inner.tokens.cancel_refresh();
        let _ = self.inner.commands.send(Command::Disconnect);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to observability events.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    /// Access the token manager, e.g. to inspect the held credential.
    #[must_use]
    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }
}
