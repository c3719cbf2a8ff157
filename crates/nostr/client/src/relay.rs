//! Single relay connection management
//!
//! Each [`RelayConnection`] runs one driver task that exclusively owns the
//! transport sink. Callers hand frames to the driver over a command channel;
//! the driver transmits them, queues them while a connection is being
//! (re)established, and reconnects with exponential backoff after failures.
//! Everything the relay says, and every lifecycle change, is reported through
//! the [`NotificationHandler`] registered at construction.

use crate::backoff::Backoff;
use crate::config::RelayConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::relay_url::RelayUrl;
use crate::transport::{Transport, TransportConnection, TransportEvent, TransportSink};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, `connect` not called yet
    Idle,
    /// Connection attempt in flight
    Connecting,
    /// Connected and ready
    Open,
    /// Last attempt or session failed
    Error,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting,
    /// `close` requested
    Closing,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Frames handed over in this state are queued for the next session.
    pub fn accepts_queued_frames(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Error | ConnectionState::Reconnecting
        )
    }
}

/// What a connection reports upward.
#[derive(Debug, Clone)]
pub enum RelayNotification {
    /// A session is established and queued frames were flushed
    Opened,
    /// An established session ended
    Disconnected { reason: String },
    /// A connection attempt failed
    ConnectFailed {
        error: ClientError,
        retry_in: Option<Duration>,
    },
    /// A decoded inbound frame
    Message(RelayMessage),
    /// An inbound frame that could not be decoded; the session continues
    DecodeError { raw: String, error: ClientError },
    /// The connection reached its terminal state
    Closed,
}

/// Callback receiving every notification of a connection, on its driver task.
pub type NotificationHandler = Arc<dyn Fn(&RelayUrl, RelayNotification) + Send + Sync>;

enum Command {
    Send(String),
    Close,
}

#[derive(Debug, Default)]
struct Diagnostics {
    last_error: Option<String>,
    reconnect_attempts: u32,
    dropped_frames: u64,
}

struct ConnectionInner {
    url: RelayUrl,
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    handler: NotificationHandler,
    state: watch::Sender<ConnectionState>,
    diagnostics: Mutex<Diagnostics>,
    last_activity: Mutex<Instant>,
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Relay {} state {:?} -> {:?}", self.url, previous, state);
        }
    }

    fn notify(&self, notification: RelayNotification) {
        (self.handler)(&self.url, notification);
    }

    fn record_error(&self, error: impl Into<String>) {
        self.diagnostics.lock().last_error = Some(error.into());
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Relay connection
pub struct RelayConnection {
    inner: Arc<ConnectionInner>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(
        url: RelayUrl,
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        handler: NotificationHandler,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(ConnectionInner {
                url,
                config,
                transport,
                handler,
                state,
                diagnostics: Mutex::new(Diagnostics::default()),
                last_activity: Mutex::new(Instant::now()),
            }),
            commands: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.inner.url
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Check if connected
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Most recent connect or session error.
    pub fn last_error(&self) -> Option<String> {
        self.inner.diagnostics.lock().last_error.clone()
    }

    /// Delays taken since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.diagnostics.lock().reconnect_attempts
    }

    /// Queued frames discarded because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.diagnostics.lock().dropped_frames
    }

    /// Time since a frame was last handed to or received from this relay.
    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    /// Start connecting in the background.
    ///
    /// Idempotent: does nothing while a driver is already running or after
    /// the connection was closed. Must be called within a Tokio runtime.
    pub fn connect(&self) {
        let mut commands = self.commands.lock();
        if commands.is_some() {
            return;
        }
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                debug!("Ignoring connect on closed relay {}", self.inner.url);
                return;
            }
            _ => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *commands = Some(tx);
        self.inner.set_state(ConnectionState::Connecting);

        let driver = Driver {
            inner: Arc::clone(&self.inner),
            commands: rx,
            queue: VecDeque::new(),
            backoff: Backoff::new(
                self.inner.config.reconnect_delay,
                self.inner.config.max_reconnect_delay,
            ),
            pending_failure: None,
        };
        tokio::spawn(driver.run());
    }

    /// Encode and send a frame.
    ///
    /// Transmitted immediately when open, queued while connecting or backing
    /// off, rejected with `NotConnected` when idle, closing or closed.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.send_text(message.to_json()?)
    }

    /// Send a pre-encoded frame (see [`send`](Self::send)).
    pub fn send_text(&self, text: String) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Open && !state.accepts_queued_frames() {
            return Err(ClientError::NotConnected);
        }
        let commands = self.commands.lock();
        let tx = commands.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Command::Send(text))
            .map_err(|_| ClientError::NotConnected)?;
        self.inner.touch();
        Ok(())
    }

    /// Close the connection. Terminal and idempotent; queued frames are dropped.
    pub fn close(&self) {
        let tx = self.commands.lock().take();
        match tx {
            Some(tx) => {
                if self.state() != ConnectionState::Closed {
                    self.inner.set_state(ConnectionState::Closing);
                }
                // A finished driver already reported Closed.
                let _ = tx.send(Command::Close);
            }
            None => {
                if self.state() != ConnectionState::Closed {
                    self.inner.set_state(ConnectionState::Closed);
                    self.inner.notify(RelayNotification::Closed);
                }
            }
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(tx) = self.commands.get_mut().take() {
            let _ = tx.send(Command::Close);
        }
    }
}

enum Phase {
    Reconnect,
    Shutdown,
}

struct Driver {
    inner: Arc<ConnectionInner>,
    commands: mpsc::UnboundedReceiver<Command>,
    queue: VecDeque<String>,
    backoff: Backoff,
    pending_failure: Option<ClientError>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let phase = match self.attempt().await {
                Some(Ok(connection)) => self.session(connection).await,
                Some(Err(error)) => self.connect_failed(error),
                None => Phase::Shutdown,
            };
            if let Phase::Shutdown = phase {
                break;
            }
            if !self.wait_backoff().await {
                break;
            }
        }
        self.queue.clear();
        self.inner.set_state(ConnectionState::Closed);
        info!("Relay {} closed", self.inner.url);
        self.inner.notify(RelayNotification::Closed);
    }

    fn enqueue(&mut self, text: String) {
        if self.queue.len() >= self.inner.config.max_queued_frames.max(1) {
            self.queue.pop_front();
            self.inner.diagnostics.lock().dropped_frames += 1;
            warn!("Send queue for {} full, dropping oldest frame", self.inner.url);
        }
        self.queue.push_back(text);
    }

    /// One connection attempt. `None` when a close was requested meanwhile.
    async fn attempt(&mut self) -> Option<Result<TransportConnection>> {
        self.inner.set_state(ConnectionState::Connecting);
        info!("Connecting to relay: {}", self.inner.url);

        let connect_timeout = self.inner.config.connect_timeout;
        let transport = Arc::clone(&self.inner.transport);
        let url = self.inner.url.clone();
        let open = timeout(connect_timeout, async move { transport.open(&url).await });
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => {
                    return Some(match result {
                        Ok(result) => result,
                        Err(_) => Err(ClientError::ConnectTimeout(connect_timeout)),
                    });
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => self.enqueue(text),
                    Some(Command::Close) | None => return None,
                },
            }
        }
    }

    fn connect_failed(&mut self, error: ClientError) -> Phase {
        warn!("Failed to connect to {}: {}", self.inner.url, error);
        self.inner.set_state(ConnectionState::Error);
        self.inner.record_error(error.to_string());
        if !self.inner.config.auto_reconnect {
            self.inner.notify(RelayNotification::ConnectFailed {
                error,
                retry_in: None,
            });
            return Phase::Shutdown;
        }
        // The retry delay is reported from wait_backoff.
        self.pending_failure = Some(error);
        Phase::Reconnect
    }

    async fn session(&mut self, connection: TransportConnection) -> Phase {
        let TransportConnection { mut sink, mut inbound } = connection;

        self.backoff.reset();
        {
            let mut diagnostics = self.inner.diagnostics.lock();
            diagnostics.reconnect_attempts = 0;
            diagnostics.last_error = None;
        }

        let reason = match self.flush(sink.as_mut()).await {
            Err(error) => error.to_string(),
            Ok(()) => {
                self.inner.set_state(ConnectionState::Open);
                info!("Connected to relay: {}", self.inner.url);
                self.inner.notify(RelayNotification::Opened);

                loop {
                    tokio::select! {
                        event = inbound.recv() => match event {
                            Some(TransportEvent::Text(text)) => self.on_message(text),
                            Some(TransportEvent::Closed(reason)) => {
                                break reason.unwrap_or_else(|| "closed by relay".to_string());
                            }
                            Some(TransportEvent::Error(error)) => break error,
                            None => break "transport ended".to_string(),
                        },
                        command = self.commands.recv() => match command {
                            Some(Command::Send(text)) => {
                                debug!("Sending to {}: {}", self.inner.url, text);
                                if let Err(error) = sink.send(text).await {
                                    break error.to_string();
                                }
                            }
                            Some(Command::Close) | None => {
                                self.inner.set_state(ConnectionState::Closing);
                                sink.close().await;
                                return Phase::Shutdown;
                            }
                        },
                    }
                }
            }
        };

        warn!("Relay {} disconnected: {}", self.inner.url, reason);
        self.inner.set_state(ConnectionState::Error);
        self.inner.record_error(reason.clone());
        self.inner
            .notify(RelayNotification::Disconnected { reason });
        sink.close().await;

        if self.inner.config.auto_reconnect {
            Phase::Reconnect
        } else {
            Phase::Shutdown
        }
    }

    async fn flush(&mut self, sink: &mut dyn TransportSink) -> Result<()> {
        while let Some(text) = self.queue.pop_front() {
            if let Err(error) = sink.send(text.clone()).await {
                self.queue.push_front(text);
                return Err(error);
            }
        }
        Ok(())
    }

    fn on_message(&self, text: String) {
        self.inner.touch();
        match RelayMessage::from_json(&text) {
            Ok(message) => self.inner.notify(RelayNotification::Message(message)),
            Err(error) => {
                warn!("Dropping malformed frame from {}: {}", self.inner.url, error);
                self.inner.notify(RelayNotification::DecodeError {
                    raw: text,
                    error: error.into(),
                });
            }
        }
    }

    /// Sleep out the next backoff delay. False when a close was requested.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        self.inner.diagnostics.lock().reconnect_attempts = self.backoff.attempt();
        self.inner.set_state(ConnectionState::Reconnecting);
        debug!("Reconnecting to {} in {:?}", self.inner.url, delay);
        if let Some(error) = self.pending_failure.take() {
            self.inner.notify(RelayNotification::ConnectFailed {
                error,
                retry_in: Some(delay),
            });
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => self.enqueue(text),
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }
}
