// Reconnecting push channel to the backend's per-user WebSocket endpoint.
//
// One `ConnectionManager` exists per session. It owns at most one background
// link task, which connects, forwards parsed push envelopes in arrival order,
// and reconnects with exponential backoff for as long as the session keeps
// it open.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::protocol::{parse_push, PushEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Delay before the first reconnect, and after any successful open.
pub const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay. Retries continue at this rate forever.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Growth factor applied after every reconnect attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            floor: DEFAULT_BACKOFF_FLOOR,
            ceiling: DEFAULT_BACKOFF_CEILING,
            factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Reconnect delay tracker.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Backoff {
            policy,
            current: policy.floor.min(policy.ceiling),
        }
    }

    /// The delay the next reconnect would wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.policy.floor.min(self.policy.ceiling);
    }

    /// Return the delay to wait now, then grow it for the attempt after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .mul_f64(self.policy.factor)
            .min(self.policy.ceiling);
        delay
    }
}

// ---------------------------------------------------------------------------
// Identity and endpoint
// ---------------------------------------------------------------------------

/// The credential a push channel is opened for.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub token: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Build the per-user push endpoint from the HTTP base URL. The WebSocket
/// scheme follows the transport security of the base URL.
pub fn ws_url(base_url: &str, token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/ws/user/?token={token}")
}

// ---------------------------------------------------------------------------
// Socket seam
// ---------------------------------------------------------------------------

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Both halves of an established WebSocket.
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens sockets. Production code uses [`TungsteniteConnector`]; tests
/// substitute in-memory sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Socket, tungstenite::Error>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Socket, tungstenite::Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (sink, stream) = ws.split();
        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Observable state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    /// Closed, reconnecting after `retry_in`.
    Waiting { retry_in: Duration },
}

/// Events delivered to the session, in socket order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Push(PushEvent),
    /// The socket closed or could not be opened; a reconnect is scheduled.
    Closed { retry_in: Duration },
}

/// Identifies one link task. A manager numbers its links from 1 in the order
/// they are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// A connection event tagged with the link that produced it. Events may sit
/// in the channel after their link was closed or replaced; pass them through
/// [`ConnectionManager::accept`] before acting on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub link: LinkId,
    pub event: ConnectionEvent,
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

struct ActiveLink {
    id: LinkId,
    identity: Identity,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<LinkState>,
    handle: JoinHandle<()>,
}

/// Owns the session's push channel.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    base_url: String,
    policy: BackoffPolicy,
    events: mpsc::Sender<LinkEvent>,
    active: Option<ActiveLink>,
    opened: u64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        base_url: impl Into<String>,
        policy: BackoffPolicy,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        ConnectionManager {
            connector,
            base_url: base_url.into(),
            policy,
            events,
            active: None,
            opened: 0,
        }
    }

    /// Ensure a channel is open for `identity`.
    ///
    /// A no-op when a channel for the same identity is already open or
    /// connecting. `None` tears down any existing channel. A different
    /// identity replaces the current channel.
    pub fn open(&mut self, identity: Option<&Identity>) {
        let Some(identity) = identity else {
            self.close();
            return;
        };

        if let Some(active) = &self.active {
            if active.identity == *identity && !active.handle.is_finished() {
                debug!(user = %identity.user_id, "push channel already open or connecting");
                return;
            }
            self.close();
        }

        self.opened += 1;
        let id = LinkId(self.opened);
        info!(user = %identity.user_id, link = id.0, "opening push channel");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let link = Link {
            id,
            connector: Arc::clone(&self.connector),
            url: ws_url(&self.base_url, &identity.token),
            user_id: identity.user_id.clone(),
            backoff: Backoff::new(self.policy),
            events: self.events.clone(),
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(link.run());

        self.active = Some(ActiveLink {
            id,
            identity: identity.clone(),
            shutdown: shutdown_tx,
            state: state_rx,
            handle,
        });
    }

    /// Tear down the channel: cancel a pending reconnect, close the socket,
    /// and stop forwarding events. Safe to call when nothing is open.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            info!(user = %active.identity.user_id, "closing push channel");
            // The link task observes the flag at its next suspension point and
            // exits. Anything it already queued is rejected by `accept`.
            let _ = active.shutdown.send(true);
        }
    }

    /// Unwrap `event` if it came from the current link. Events from a closed
    /// or replaced link are dropped.
    pub fn accept(&self, event: LinkEvent) -> Option<ConnectionEvent> {
        match &self.active {
            Some(active) if active.id == event.link => Some(event.event),
            _ => {
                debug!(link = event.link.0, "dropping event from a retired push channel");
                None
            }
        }
    }

    /// The link currently owned by this manager.
    pub fn current_link(&self) -> Option<LinkId> {
        self.active.as_ref().map(|active| active.id)
    }

    pub fn state(&self) -> LinkState {
        match &self.active {
            Some(active) => *active.state.borrow(),
            None => LinkState::Idle,
        }
    }

    /// Whether a link task is running (open, connecting, or waiting).
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.active.as_ref().map(|active| &active.identity)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

enum PumpEnd {
    /// Socket closed or failed; reconnect.
    Closed,
    /// Shutdown requested or nobody is listening; exit.
    Stop,
}

struct Link {
    id: LinkId,
    connector: Arc<dyn Connector>,
    url: String,
    user_id: String,
    backoff: Backoff,
    events: mpsc::Sender<LinkEvent>,
    state: watch::Sender<LinkState>,
    shutdown: watch::Receiver<bool>,
}

impl Link {
    async fn run(mut self) {
        loop {
            if self.is_shut_down() {
                break;
            }

            self.state.send_replace(LinkState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                result = self.connector.connect(&self.url) => result,
            };

            match connected {
                Ok(socket) => {
                    self.backoff.reset();
                    info!(user = %self.user_id, "push channel open");
                    self.state.send_replace(LinkState::Open);
                    if !self.emit(ConnectionEvent::Opened).await {
                        break;
                    }
                    if let PumpEnd::Stop = self.pump(socket).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(user = %self.user_id, error = %e, "push channel connect failed");
                }
            }

            let retry_in = self.backoff.next_delay();
            self.state.send_replace(LinkState::Waiting { retry_in });
            if !self.emit(ConnectionEvent::Closed { retry_in }).await {
                break;
            }
            info!(user = %self.user_id, ?retry_in, "push channel closed, reconnecting");

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(retry_in) => {}
            }
        }

        self.state.send_replace(LinkState::Idle);
        debug!(user = %self.user_id, "push channel task exiting");
    }

    /// Forward frames until the socket closes or shutdown is requested.
    async fn pump(&mut self, socket: Socket) -> PumpEnd {
        let Socket {
            mut sink,
            mut stream,
        } = socket;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    return PumpEnd::Stop;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_push(text.as_str()) {
                        Ok(Some(event)) => {
                            if !self.emit(ConnectionEvent::Push(event)).await {
                                return PumpEnd::Stop;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(user = %self.user_id, error = %e, "dropping malformed push frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(user = %self.user_id, ?frame, "server closed push channel");
                        return PumpEnd::Closed;
                    }
                    Some(Ok(_)) => {
                        // Binary, ping, pong and raw frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        warn!(user = %self.user_id, error = %e, "push channel error");
                        return PumpEnd::Closed;
                    }
                    None => {
                        info!(user = %self.user_id, "push channel stream ended");
                        return PumpEnd::Closed;
                    }
                }
            }
        }
    }

    /// Forward an event unless the session has let go of this link. A send
    /// blocked on a full channel is abandoned as soon as shutdown is
    /// requested. Returns `false` when the task should stop.
    async fn emit(&mut self, event: ConnectionEvent) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let event = LinkEvent {
            link: self.id,
            event,
        };
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
