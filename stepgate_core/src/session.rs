//! Reconnecting websocket session to the actuator service.
//!
//! [`ConnectionSession`] is a cheap cloneable handle; the socket lives in a
//! single actor task that walks an explicit
//! `Disconnected -> Connecting -> Connected -> Disconnected` state machine.
//! Sends never wait on that task: when the phase is not `Connected` they
//! report "not accepted" immediately.

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::dispatch::{check_channel, TriggerCommand, TriggerDispatch};
use crate::error::{ActuatorError, InvalidIndexError, TriggerError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stepgate_protocol::{decode, encode, ActuatorMessage, ClientMessage, Inbound, MessageKind};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Writer = SplitSink<Socket, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionPhase {
    pub fn can_advance_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Disconnected, Connecting) | (Connecting, Connected) | (Connected, Disconnected)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Whether the actuator reports real hardware behind it.
    pub actuator_available: bool,
    pub last_error: Option<String>,
    /// Delay before the next connection attempt, while one is pending.
    pub retry_in: Option<Duration>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            actuator_available: false,
            last_error: None,
            retry_in: None,
        }
    }
}

type StatusCallback = Arc<dyn Fn(&ConnectionState) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ActuatorError) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    status: Vec<StatusCallback>,
    error: Vec<ErrorCallback>,
}

enum Control {
    Shutdown,
}

#[derive(Clone)]
pub struct ConnectionSession {
    out_tx: mpsc::Sender<ClientMessage>,
    control_tx: mpsc::UnboundedSender<Control>,
    state_rx: watch::Receiver<ConnectionState>,
    subscribers: Arc<Mutex<Subscribers>>,
}

/// Collects callbacks before the session actor starts, so they observe every
/// transition from the first `Connecting` on.
pub struct SessionBuilder {
    config: SessionConfig,
    subscribers: Subscribers,
}

impl SessionBuilder {
    pub fn on_status(mut self, callback: impl Fn(&ConnectionState) + Send + Sync + 'static) -> Self {
        self.subscribers.status.push(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&ActuatorError) + Send + Sync + 'static) -> Self {
        self.subscribers.error.push(Arc::new(callback));
        self
    }

    /// Starts the session actor on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// When called outside a tokio runtime, like `tokio::spawn`.
    pub fn spawn(self) -> ConnectionSession {
        let SessionBuilder {
            config,
            subscribers,
        } = self;
        let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let subscribers = Arc::new(Mutex::new(subscribers));

        let actor = SessionActor {
            backoff: Backoff::new(config.reconnect_base, config.reconnect_max),
            config,
            out_rx,
            control_rx,
            state_tx,
            subscribers: Arc::clone(&subscribers),
        };
        tokio::spawn(actor.run());

        ConnectionSession {
            out_tx,
            control_tx,
            state_rx,
            subscribers,
        }
    }
}

impl ConnectionSession {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            subscribers: Subscribers::default(),
        }
    }

    /// Starts a session with no callbacks registered yet.
    ///
    /// # Panics
    ///
    /// When called outside a tokio runtime, like `tokio::spawn`.
    pub fn spawn(config: SessionConfig) -> Self {
        Self::builder(config).spawn()
    }

    pub fn send_batch_trigger(&self, channels: &[usize], duration_ms: u32) -> Result<bool, TriggerError> {
        let cmd = TriggerCommand::batch(channels, duration_ms)?;
        Ok(self.dispatch(cmd))
    }

    pub fn send_immediate_trigger(&self, channel: usize, duration_ms: u32) -> Result<bool, TriggerError> {
        let cmd = TriggerCommand::immediate(channel, duration_ms)?;
        Ok(self.dispatch(cmd))
    }

    /// Releases the given channels; an empty slice releases all of them.
    pub fn send_stop_channels(&self, channels: &[usize]) -> Result<bool, InvalidIndexError> {
        let mut checked = channels
            .iter()
            .map(|&c| check_channel(c))
            .collect::<Result<Vec<u8>, _>>()?;
        checked.sort_unstable();
        checked.dedup();
        Ok(self.send(ClientMessage::StopChannels { channels: checked }))
    }

    /// Called on every later state change, from the session task.
    ///
    /// The actor is already running, so on a multi-thread runtime transitions
    /// made before this call are not replayed. Register through
    /// [`ConnectionSession::builder`] to see them all.
    pub fn on_status(&self, callback: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.subscribers().status.push(Arc::new(callback));
    }

    /// Called for every later `error` message the actuator sends.
    pub fn on_error(&self, callback: impl Fn(&ActuatorError) + Send + Sync + 'static) {
        self.subscribers().error.push(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().phase == ConnectionPhase::Connected
    }

    /// Closes the socket and stops reconnecting. The phase ends at
    /// `Disconnected`.
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }

    fn send(&self, msg: ClientMessage) -> bool {
        if !self.is_connected() {
            debug!(kind = msg.kind(), "not connected, message not accepted");
            return false;
        }
        match self.out_tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!(kind = msg.kind(), "outbound queue full, message not accepted");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TriggerDispatch for ConnectionSession {
    fn dispatch(&self, command: TriggerCommand) -> bool {
        self.send(command.into_message())
    }
}

enum Exit {
    Shutdown,
    Dropped(String),
}

struct SessionActor {
    config: SessionConfig,
    out_rx: mpsc::Receiver<ClientMessage>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    state_tx: watch::Sender<ConnectionState>,
    subscribers: Arc<Mutex<Subscribers>>,
    backoff: Backoff,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            self.transition(ConnectionPhase::Connecting, |s| s.retry_in = None);

            let socket = loop {
                let attempt = tokio::select! {
                    attempt = tokio::time::timeout(
                        self.config.connect_timeout,
                        tokio_tungstenite::connect_async(self.config.url.as_str()),
                    ) => attempt,
                    _ = self.control_rx.recv() => return self.finish(),
                };
                let error = match attempt {
                    Ok(Ok((socket, _))) => break socket,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "connect timed out".to_string(),
                };

                let retry = self.backoff.next_delay();
                warn!(%error, retry_in_ms = retry.as_millis() as u64, "actuator connection failed");
                self.update(|s| {
                    s.last_error = Some(error);
                    s.retry_in = Some(retry);
                });
                if !self.wait(retry).await {
                    return self.finish();
                }
                self.update(|s| s.retry_in = None);
            };

            self.backoff.reset();
            self.transition(ConnectionPhase::Connected, |s| {
                s.last_error = None;
                s.retry_in = None;
            });
            info!(url = %self.config.url, "connected to actuator");

            match self.serve(socket).await {
                Exit::Shutdown => return self.finish(),
                Exit::Dropped(reason) => {
                    let retry = self.backoff.next_delay();
                    warn!(%reason, retry_in_ms = retry.as_millis() as u64, "actuator connection lost");
                    self.transition(ConnectionPhase::Disconnected, |s| {
                        s.actuator_available = false;
                        s.last_error = Some(reason);
                        s.retry_in = Some(retry);
                    });
                    self.discard_queued();
                    if !self.wait(retry).await {
                        return self.finish();
                    }
                }
            }
        }
    }

    async fn serve(&mut self, socket: Socket) -> Exit {
        let (mut write, mut read) = socket.split();
        let mut ping = self.config.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                outgoing = self.out_rx.recv() => {
                    let Some(msg) = outgoing else {
                        let _ = write.close().await;
                        return Exit::Shutdown;
                    };
                    if let Err(e) = send_json(&mut write, &msg).await {
                        return Exit::Dropped(e);
                    }
                    debug!(kind = msg.kind(), "sent to actuator");
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_text(text.as_str()) {
                                pong_deadline = None;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Exit::Dropped("actuator closed the connection".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Exit::Dropped(e.to_string()),
                    }
                }
                _ = next_tick(&mut ping) => {
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.ping_timeout);
                    }
                    if let Err(e) = send_json(&mut write, &ClientMessage::Ping {}).await {
                        return Exit::Dropped(e);
                    }
                }
                _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    return Exit::Dropped("liveness probe timed out".to_string());
                }
                _ = self.control_rx.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                }
            }
        }
    }

    /// Returns true when the message was a pong.
    fn handle_text(&mut self, text: &str) -> bool {
        match decode::<ActuatorMessage>(text) {
            Ok(Inbound::Known(msg)) => self.handle_message(msg),
            Ok(Inbound::Unknown { kind }) => {
                warn!(%kind, "ignoring unknown actuator message");
                false
            }
            Err(e) => {
                warn!(error = %e, "ignoring malformed actuator message");
                false
            }
        }
    }

    fn handle_message(&mut self, msg: ActuatorMessage) -> bool {
        match msg {
            ActuatorMessage::ConnectionStatus {
                connected,
                gpio_available,
                channel_mapping,
            } => {
                info!(connected, gpio_available, channels = channel_mapping.len(), "actuator status");
                self.update(|s| s.actuator_available = gpio_available);
            }
            ActuatorMessage::Error { error, channel } => {
                let error = ActuatorError {
                    message: error,
                    channel,
                };
                warn!(%error, "actuator reported an error");
                let callbacks = lock(&self.subscribers).error.clone();
                for callback in callbacks {
                    callback(&error);
                }
            }
            ActuatorMessage::GpioTriggerResponse {
                channels, success, ..
            } => debug!(?channels, success, "batch trigger acknowledged"),
            ActuatorMessage::ImmediateTriggerResponse {
                channel, success, ..
            } => debug!(channel, success, "immediate trigger acknowledged"),
            ActuatorMessage::StopChannelsResponse { channels, success } => {
                debug!(?channels, success, "release acknowledged")
            }
            ActuatorMessage::Pong { .. } => return true,
        }
        false
    }

    /// Sleeps for `delay`; false when asked to shut down meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.control_rx.recv() => false,
        }
    }

    fn transition(&mut self, next: ConnectionPhase, edit: impl FnOnce(&mut ConnectionState)) {
        let current = self.state_tx.borrow().phase;
        debug_assert!(
            current.can_advance_to(next),
            "illegal phase change {current:?} -> {next:?}"
        );
        info!(from = ?current, to = ?next, "connection phase");
        self.update(|s| {
            s.phase = next;
            edit(s);
        });
    }

    fn update(&mut self, edit: impl FnOnce(&mut ConnectionState)) {
        let changed = self.state_tx.send_if_modified(|state| {
            let before = state.clone();
            edit(state);
            *state != before
        });
        if !changed {
            return;
        }
        let state = self.state_tx.borrow().clone();
        let callbacks = lock(&self.subscribers).status.clone();
        for callback in callbacks {
            callback(&state);
        }
    }

    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.out_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded commands queued for a dead connection");
        }
    }

    /// Teardown; may leave any phase.
    fn finish(&mut self) {
        self.discard_queued();
        self.update(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.actuator_available = false;
            s.retry_in = None;
        });
        info!("actuator session shut down");
    }
}

fn lock(subscribers: &Mutex<Subscribers>) -> std::sync::MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_json(write: &mut Writer, msg: &ClientMessage) -> Result<(), String> {
    let payload = encode(msg).map_err(|e| e.to_string())?;
    write
        .send(Message::Text(payload.into()))
        .await
        .map_err(|e| e.to_string())
}
