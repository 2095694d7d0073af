use crate::outputs::{default_mapping, OutputBank};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use stepgate_protocol::{
    decode, encode, ActuatorMessage, ClientMessage, Inbound, ProtocolError, ReleasedChannels,
};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message;

pub const EVENT_CAP: usize = 1024;

#[derive(Debug, Clone)]
pub struct ActuatorOptions {
    pub mapping: BTreeMap<u8, u8>,
    /// Reported as `gpio_available`; the simulation never drives real pins.
    pub gpio_available: bool,
    /// When false, pings go unanswered (lets clients exercise their
    /// liveness timeout).
    pub answer_pings: bool,
}

impl Default for ActuatorOptions {
    fn default() -> Self {
        Self {
            mapping: default_mapping(),
            gpio_available: false,
            answer_pings: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorEvent {
    ClientConnected {
        addr: SocketAddr,
        connection_id: String,
    },
    ClientDisconnected {
        connection_id: String,
    },
    /// A well-formed command, after it was applied.
    Received(ClientMessage),
    Released {
        channel: u8,
    },
}

enum Control {
    DropClient,
    SendRaw(String),
}

struct ActiveClient {
    ws: tungstenite::WebSocket<TcpStream>,
    connection_id: String,
}

pub struct ActuatorThread {
    listen_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    control_tx: Sender<Control>,
    events_rx: Receiver<ActuatorEvent>,
    outputs: Arc<Mutex<OutputBank>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ActuatorThread {
    pub fn spawn_with_addr(addr: &str, options: ActuatorOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listen_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = bounded(64);
        let (events_tx, events_rx) = bounded(EVENT_CAP);
        let outputs = Arc::new(Mutex::new(OutputBank::new(options.mapping)));

        let server = Server {
            listener,
            gpio_available: options.gpio_available,
            answer_pings: options.answer_pings,
            outputs: Arc::clone(&outputs),
            events: events_tx,
            control: control_rx,
            shutdown: Arc::clone(&shutdown),
            started: Instant::now(),
            active: None,
        };
        let join_handle = thread::Builder::new()
            .name("actuator-ws".to_string())
            .spawn(move || server.run())?;

        info!(%listen_addr, "simulated actuator listening");
        Ok(Self {
            listen_addr,
            shutdown,
            control_tx,
            events_rx,
            outputs,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.listen_addr)
    }

    /// Event stream. Clones share one queue; each event is seen once.
    pub fn events(&self) -> Receiver<ActuatorEvent> {
        self.events_rx.clone()
    }

    pub fn active_channels(&self) -> Vec<u8> {
        lock(&self.outputs).active_channels()
    }

    /// Closes the current client's connection without stopping the server.
    pub fn drop_client(&self) {
        let _ = self.control_tx.try_send(Control::DropClient);
    }

    /// Sends arbitrary text to the current client, if any.
    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.control_tx.try_send(Control::SendRaw(text.into()));
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl Drop for ActuatorThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Server {
    listener: TcpListener,
    gpio_available: bool,
    answer_pings: bool,
    outputs: Arc<Mutex<OutputBank>>,
    events: Sender<ActuatorEvent>,
    control: Receiver<Control>,
    shutdown: Arc<AtomicBool>,
    started: Instant,
    active: Option<ActiveClient>,
}

impl Server {
    fn run(mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.accept_pending();
            self.apply_controls();

            let released = lock(&self.outputs).expire(Instant::now());
            for channel in released {
                self.emit(ActuatorEvent::Released { channel });
            }

            if self.active.is_some() {
                self.read_one();
            } else {
                thread::sleep(Duration::from_millis(10));
            }
        }

        if let Some(mut client) = self.active.take() {
            let _ = client.ws.close(None);
        }
    }

    /// Single-client policy: a new connection replaces the previous one.
    fn accept_pending(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            let _ = stream.set_nonblocking(false);
            let _ = stream.set_nodelay(true);
            let _ = stream.set_read_timeout(Some(Duration::from_millis(20)));
            let _ = stream.set_write_timeout(Some(Duration::from_millis(200)));

            let ws = match tungstenite::accept(stream) {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(error = %e, "ws handshake failed");
                    continue;
                }
            };

            if self.active.is_some() {
                self.disconnect("replaced by a new client");
            }

            let connection_id: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            info!(%addr, %connection_id, "client connected");
            self.active = Some(ActiveClient {
                ws,
                connection_id: connection_id.clone(),
            });
            self.emit(ActuatorEvent::ClientConnected {
                addr,
                connection_id,
            });

            let status = ActuatorMessage::ConnectionStatus {
                connected: true,
                gpio_available: self.gpio_available,
                channel_mapping: lock(&self.outputs).mapping().clone(),
            };
            self.reply(&status);
        }
    }

    fn apply_controls(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(Control::DropClient) => {
                    if self.active.is_some() {
                        self.disconnect("dropped on request");
                    }
                }
                Ok(Control::SendRaw(text)) => self.send_text(text),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    fn read_one(&mut self) {
        let Some(client) = self.active.as_mut() else {
            return;
        };
        match client.ws.read() {
            Ok(Message::Text(text)) => {
                let replies = self.handle_text(text.as_str());
                for reply in &replies {
                    self.reply(reply);
                }
            }
            Ok(Message::Close(_)) => self.disconnect("client closed"),
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                debug!(error = %e, "read failed");
                self.disconnect("connection lost");
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Vec<ActuatorMessage> {
        let msg = match decode::<ClientMessage>(text) {
            Ok(Inbound::Known(msg)) => msg,
            Ok(Inbound::Unknown { kind }) => {
                warn!(%kind, "unknown message type");
                return vec![error_message(format!("Unknown message type: {kind}"), None)];
            }
            Err(ProtocolError::Malformed { kind, source }) => {
                warn!(%kind, error = %source, "malformed message");
                return vec![error_message(format!("invalid {kind} message: {source}"), None)];
            }
            Err(e) => {
                warn!(error = %e, "invalid json");
                return vec![error_message("invalid json".to_string(), None)];
            }
        };

        if matches!(msg, ClientMessage::Ping {}) && !self.answer_pings {
            debug!("ping left unanswered");
            return Vec::new();
        }

        let uptime = self.started.elapsed().as_secs_f64();
        let replies = respond(&mut lock(&self.outputs), &msg, Instant::now(), uptime);
        self.emit(ActuatorEvent::Received(msg));
        replies
    }

    fn reply(&mut self, msg: &ActuatorMessage) {
        match encode(msg) {
            Ok(text) => self.send_text(text),
            Err(e) => warn!(error = %e, "failed to encode reply"),
        }
    }

    fn send_text(&mut self, text: String) {
        let Some(client) = self.active.as_mut() else {
            return;
        };
        if let Err(e) = client.ws.send(Message::Text(text.into())) {
            debug!(error = %e, "send failed");
            self.disconnect("send failed");
        }
    }

    fn disconnect(&mut self, reason: &str) {
        let Some(mut client) = self.active.take() else {
            return;
        };
        let _ = client.ws.close(None);
        let _ = client.ws.flush();
        info!(connection_id = %client.connection_id, reason, "client disconnected");
        self.emit(ActuatorEvent::ClientDisconnected {
            connection_id: client.connection_id,
        });
    }

    fn emit(&self, event: ActuatorEvent) {
        let _ = self.events.try_send(event);
    }
}

/// Applies one command to the output bank and builds the replies.
fn respond(
    bank: &mut OutputBank,
    msg: &ClientMessage,
    now: Instant,
    uptime_secs: f64,
) -> Vec<ActuatorMessage> {
    match msg {
        ClientMessage::GpioTrigger { channels, duration } => {
            if channels.is_empty() {
                return Vec::new();
            }
            let hold = Duration::from_millis(u64::from(*duration));
            let mut results = BTreeMap::new();
            let mut errors = Vec::new();
            for &channel in channels {
                let ok = bank.trigger(channel, hold, now);
                if !ok {
                    errors.push(unmapped(channel));
                }
                results.insert(channel, ok);
            }
            let mut replies = vec![ActuatorMessage::GpioTriggerResponse {
                channels: channels.clone(),
                duration: *duration,
                success: results.values().all(|&ok| ok),
                results,
            }];
            replies.extend(errors);
            replies
        }
        ClientMessage::ImmediateTrigger { channel, duration } => {
            let ok = bank.trigger(*channel, Duration::from_millis(u64::from(*duration)), now);
            let mut replies = vec![ActuatorMessage::ImmediateTriggerResponse {
                channel: *channel,
                duration: *duration,
                success: ok,
            }];
            if !ok {
                replies.push(unmapped(*channel));
            }
            replies
        }
        ClientMessage::StopChannels { channels } => {
            let released = if channels.is_empty() {
                bank.release_all();
                ReleasedChannels::all()
            } else {
                for &channel in channels {
                    bank.release(channel);
                }
                ReleasedChannels::Listed(channels.clone())
            };
            vec![ActuatorMessage::StopChannelsResponse {
                channels: released,
                success: true,
            }]
        }
        ClientMessage::Ping {} => vec![ActuatorMessage::Pong {
            timestamp: uptime_secs,
        }],
    }
}

fn unmapped(channel: u8) -> ActuatorMessage {
    error_message(
        format!("Channel {channel} not mapped to an output"),
        Some(i64::from(channel)),
    )
}

fn error_message(error: String, channel: Option<i64>) -> ActuatorMessage {
    ActuatorMessage::Error { error, channel }
}

fn lock(outputs: &Mutex<OutputBank>) -> std::sync::MutexGuard<'_, OutputBank> {
    outputs.lock().unwrap_or_else(PoisonError::into_inner)
}
