//! WebSocket client for the relay server.
//!
//! The socket lives on a background thread; `pump()` drains its events on the
//! owning thread and dispatches them to subscription callbacks.

use super::{ChangeCallback, ChangeSet, DocWrite, DocumentStore, ErrorCallback, SubscriptionId};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerMessage};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tungstenite::{Message, connect};
use url::Url;

/// Minimum time between reconnect attempts made by `pump()`.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Commands sent to the WebSocket thread.
enum WsCommand {
    Send(String),
    Close,
}

/// Events from the WebSocket thread.
#[derive(Debug)]
enum RelayEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
    Error(String),
}

struct RelaySubscription {
    prefix: String,
    on_change: ChangeCallback,
    on_error: ErrorCallback,
}

struct Connection {
    cmd_tx: Sender<WsCommand>,
    event_rx: Receiver<RelayEvent>,
    _thread: JoinHandle<()>,
}

#[derive(Default)]
struct RelayState {
    connection: Option<Connection>,
    connected: bool,
    last_attempt: Option<Instant>,
    subscriptions: BTreeMap<u64, RelaySubscription>,
    next_sub_id: u64,
}

/// `DocumentStore` backed by a relay server.
pub struct RelayDocumentStore {
    url: String,
    state: RefCell<RelayState>,
}

impl RelayDocumentStore {
    /// Validate `url` and start connecting in the background.
    pub fn connect(url: &str) -> SyncResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| SyncError::Network(format!("Invalid URL: {}", e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(SyncError::Network(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed.scheme()
            )));
        }
        let store = Self {
            url: url.to_string(),
            state: RefCell::new(RelayState::default()),
        };
        store.start();
        Ok(store)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the socket. Subscriptions are kept and re-sent on reconnect.
    pub fn disconnect(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(connection) = state.connection.take() {
            let _ = connection.cmd_tx.send(WsCommand::Close);
        }
        state.connected = false;
    }

    fn start(&self) {
        let mut state = self.state.borrow_mut();
        state.last_attempt = Some(Instant::now());
        state.connection = Some(spawn_socket(self.url.clone()));
    }

    fn send(&self, msg: &ClientMessage) -> SyncResult<()> {
        let text = serde_json::to_string(msg)?;
        let state = self.state.borrow();
        match &state.connection {
            Some(connection) if state.connected => connection
                .cmd_tx
                .send(WsCommand::Send(text))
                .map_err(|e| SyncError::Network(format!("Send failed: {}", e))),
            _ => Err(SyncError::Network("Not connected".to_string())),
        }
    }

    fn drain_events(&self) -> Vec<RelayEvent> {
        let mut state = self.state.borrow_mut();
        let mut events = Vec::new();
        let mut closed = false;
        if let Some(connection) = &state.connection {
            loop {
                match connection.event_rx.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            state.connection = None;
            state.connected = false;
        }
        events
    }

    /// Re-send every subscription on a fresh connection.
    fn resubscribe_all(&self) {
        let messages: Vec<ClientMessage> = self
            .state
            .borrow()
            .subscriptions
            .iter()
            .map(|(sub_id, sub)| ClientMessage::Subscribe {
                sub_id: *sub_id,
                prefix: sub.prefix.clone(),
            })
            .collect();
        for msg in messages {
            if let Err(e) = self.send(&msg) {
                log::warn!("Failed to resubscribe: {}", e);
            }
        }
    }

    fn notify_error(&self, error: SyncError) {
        for sub in self.state.borrow_mut().subscriptions.values_mut() {
            (sub.on_error)(error.clone());
        }
    }

    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Snapshot { sub_id, changes } => {
                let mut state = self.state.borrow_mut();
                if let Some(sub) = state.subscriptions.get_mut(&sub_id) {
                    let set = ChangeSet {
                        initial: true,
                        prefix: sub.prefix.clone(),
                        changes,
                    };
                    (sub.on_change)(set);
                }
            }
            msg @ ServerMessage::Change { .. } => {
                let Some(change) = msg.into_change() else {
                    return;
                };
                let mut state = self.state.borrow_mut();
                for sub in state.subscriptions.values_mut() {
                    if change.path.starts_with(&sub.prefix) {
                        (sub.on_change)(ChangeSet {
                            initial: false,
                            prefix: sub.prefix.clone(),
                            changes: vec![change.clone()],
                        });
                    }
                }
            }
            ServerMessage::Ack { op_id, duplicate } => {
                if duplicate {
                    log::debug!("Relay ignored duplicate write {:?}", op_id);
                }
            }
            ServerMessage::Error { message } => {
                log::warn!("Relay error: {}", message);
            }
        }
    }
}

impl DocumentStore for RelayDocumentStore {
    fn subscribe(
        &self,
        prefix: &str,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> SyncResult<SubscriptionId> {
        let sub_id = {
            let mut state = self.state.borrow_mut();
            state.next_sub_id += 1;
            let sub_id = state.next_sub_id;
            state.subscriptions.insert(
                sub_id,
                RelaySubscription {
                    prefix: prefix.to_string(),
                    on_change,
                    on_error,
                },
            );
            sub_id
        };
        // Not connected yet: the subscription goes out with `Connected`.
        if self.is_connected() {
            self.send(&ClientMessage::Subscribe {
                sub_id,
                prefix: prefix.to_string(),
            })?;
        }
        Ok(SubscriptionId(sub_id))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self.state.borrow_mut().subscriptions.remove(&id.0).is_some();
        if removed && self.is_connected() {
            let _ = self.send(&ClientMessage::Unsubscribe { sub_id: id.0 });
        }
    }

    fn write(&self, write: DocWrite) -> SyncResult<()> {
        self.send(&ClientMessage::from(write))
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn pump(&self) {
        let reconnect_due = {
            let state = self.state.borrow();
            state.connection.is_none()
                && state
                    .last_attempt
                    .is_none_or(|at| at.elapsed() >= RECONNECT_INTERVAL)
        };
        if reconnect_due {
            log::info!("Reconnecting to relay {}", self.url);
            self.start();
        }

        for event in self.drain_events() {
            match event {
                RelayEvent::Connected => {
                    self.state.borrow_mut().connected = true;
                    self.resubscribe_all();
                }
                RelayEvent::Disconnected => {
                    self.state.borrow_mut().connected = false;
                    self.notify_error(SyncError::Network("connection closed".to_string()));
                }
                RelayEvent::Error(message) => {
                    self.state.borrow_mut().connected = false;
                    self.notify_error(SyncError::Network(message));
                }
                RelayEvent::Message(msg) => self.dispatch(msg),
            }
        }
    }
}

impl Drop for RelayDocumentStore {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_socket(url: String) -> Connection {
    let (cmd_tx, cmd_rx) = channel::<WsCommand>();
    let (event_tx, event_rx) = channel::<RelayEvent>();

    let handle = thread::spawn(move || {
        log::info!("WebSocket thread: connecting to {}", url);

        let (mut socket, response) = match connect(&url) {
            Ok(ok) => ok,
            Err(e) => {
                log::error!("WebSocket connection failed: {}", e);
                let _ = event_tx.send(RelayEvent::Error(format!("Connection failed: {}", e)));
                return;
            }
        };
        log::info!("WebSocket connected, status: {}", response.status());
        let _ = event_tx.send(RelayEvent::Connected);

        // Short read timeout so the loop can interleave sends.
        if let tungstenite::stream::MaybeTlsStream::Plain(tcp) = socket.get_mut() {
            let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }

        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(msg)) => {
                    log::debug!("WebSocket sending: {}", preview(&msg));
                    if let Err(e) = socket.send(Message::Text(msg)) {
                        log::error!("WebSocket send error: {}", e);
                        break;
                    }
                }
                Ok(WsCommand::Close) => {
                    log::info!("WebSocket close requested");
                    let _ = socket.close(None);
                    break;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match socket.read() {
                Ok(Message::Text(txt)) => match serde_json::from_str::<ServerMessage>(&txt) {
                    Ok(msg) => {
                        let _ = event_tx.send(RelayEvent::Message(msg));
                    }
                    Err(_) => log::warn!("Failed to parse server message: {}", txt),
                },
                Ok(Message::Ping(data)) => {
                    let _ = socket.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    log::info!("WebSocket received close frame");
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::error!("WebSocket read error: {}", e);
                    break;
                }
            }
        }

        log::info!("WebSocket thread exiting");
        let _ = event_tx.send(RelayEvent::Disconnected);
    });

    Connection {
        cmd_tx,
        event_rx,
        _thread: handle,
    }
}

/// First 100 characters of an outgoing frame, for logging.
fn preview(msg: &str) -> &str {
    match msg.char_indices().nth(100) {
        Some((end, _)) => &msg[..end],
        None => msg,
    }
}
