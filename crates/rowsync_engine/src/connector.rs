//! Remote connector: the message-framed protocol peer.
//!
//! The raw socket is abstracted behind [`Socket`]/[`SocketFactory`], so
//! the connector itself is a deterministic state machine over frames. It
//! is driven by [`RemoteConnector::tick`], which polls the socket, runs
//! the keepalive, and fires due reconnects; results surface through a
//! drained [`ConnectorEvent`] queue.

use crate::config::EngineConfig;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use rowsync_protocol::{
    wire, Changes, CloudData, GetChanges, Login, Message, ObjectKey, Register, Timestamp, Upload,
};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const KEY_DEVICE_ID: &str = "deviceId";
const KEY_SIGN_KEY: &str = "signKey";
const KEY_CRYPT_KEY: &str = "cryptKey";

/// A connected message-framed socket.
///
/// Implementations carry whole frames (`u32 length | body`); `poll` is
/// non-blocking and returns `Ok(None)` when nothing is available.
pub trait Socket {
    /// Sends one frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), String>;

    /// Receives the next frame, if one arrived.
    fn poll(&mut self) -> Result<Option<Vec<u8>>, String>;

    /// Closes the connection.
    fn close(&mut self);

    /// True while the connection is usable.
    fn is_open(&self) -> bool;
}

/// Opens sockets; one call per connection attempt.
pub trait SocketFactory {
    /// The socket type produced.
    type Sock: Socket;

    /// Connects to `url` with the access key as subprotocol and the given
    /// headers.
    fn connect(
        &mut self,
        url: &str,
        access_key: &str,
        headers: &[(String, String)],
    ) -> Result<Self::Sock, String>;
}

/// Persisted connector settings (device id, key material).
///
/// Credential storage proper (keystores) stays with the embedder; this is
/// the watcher-side contract only.
pub trait SettingsStore {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<String>;
    /// Writes a value.
    fn set(&mut self, key: &str, value: &str);
    /// Deletes a value.
    fn remove(&mut self, key: &str);
}

/// In-memory settings, the default for tests and throwaway devices.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: HashMap<String, String>,
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), value.to_owned());
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}

/// Connection-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// No socket, no reconnect scheduled.
    Disconnected,
    /// Waiting for the next connection attempt.
    Reconnecting,
    /// Socket open, waiting for the server challenge.
    Connected,
    /// Registration sent, waiting for the account reply.
    Registering,
    /// Login sent, waiting for the welcome.
    LoggingIn,
    /// Logged in with outstanding requests.
    Active,
    /// Logged in and quiet.
    Idle,
}

/// Notifications surfaced to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// One pull batch arrived.
    DownloadedData {
        /// Table the records belong to.
        table: String,
        /// The batch, ascending by `modified`.
        records: Vec<CloudData>,
    },
    /// The change stream for a table is exhausted.
    SyncDone {
        /// The drained table.
        table: String,
    },
    /// The server acknowledged one upload.
    UploadedData {
        /// Acknowledged key.
        key: ObjectKey,
        /// Timestamp the server stored.
        modified: Timestamp,
    },
    /// Live-push: a table changed remotely.
    RemoteChanged {
        /// The changed table.
        table: String,
    },
    /// The device completed registration or login.
    LoggedIn {
        /// This device's id.
        device_id: Uuid,
    },
    /// A socket-level failure; a reconnect has been scheduled.
    NetworkError {
        /// Description of the failure.
        message: String,
    },
    /// The connection closed in an orderly way; no reconnect is
    /// scheduled.
    Disconnected,
}

/// The websocket protocol peer.
pub struct RemoteConnector<F: SocketFactory> {
    factory: F,
    config: EngineConfig,
    settings: Box<dyn SettingsStore>,
    socket: Option<F::Sock>,
    state: ConnectorState,
    device_id: Option<Uuid>,
    sign_key: Option<Vec<u8>>,
    pending_register: Option<(Vec<u8>, Vec<u8>)>,
    id_token: Option<String>,
    pending_get: Option<String>,
    upload_fifo: VecDeque<(ObjectKey, Timestamp)>,
    events: VecDeque<ConnectorEvent>,
    reconnect_attempt: u32,
    next_reconnect_at: Option<Instant>,
    last_activity: Instant,
    missed_pings: u32,
}

impl<F: SocketFactory> RemoteConnector<F> {
    /// Creates a connector; no connection is attempted until
    /// [`Self::reconnect`].
    pub fn new(factory: F, config: EngineConfig, settings: Box<dyn SettingsStore>) -> Self {
        Self {
            factory,
            config,
            settings,
            socket: None,
            state: ConnectorState::Disconnected,
            device_id: None,
            sign_key: None,
            pending_register: None,
            id_token: None,
            pending_get: None,
            upload_fifo: VecDeque::new(),
            events: VecDeque::new(),
            reconnect_attempt: 0,
            next_reconnect_at: None,
            last_activity: Instant::now(),
            missed_pings: 0,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// The device id, once registered.
    pub fn device_id(&self) -> Option<Uuid> {
        self.device_id
    }

    /// True once logged in and able to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectorState::Active | ConnectorState::Idle)
    }

    /// Number of uploads awaiting acknowledgement.
    pub fn pending_uploads(&self) -> usize {
        self.upload_fifo.len()
    }

    /// Drains one queued event.
    pub fn take_event(&mut self) -> Option<ConnectorEvent> {
        self.events.pop_front()
    }

    /// Sets the bearer credentials used on the next connection.
    pub fn set_credentials(&mut self, id_token: impl Into<String>) {
        self.id_token = Some(id_token.into());
    }

    /// Opens (or re-opens) the connection.
    ///
    /// An existing socket is closed first; persisted identity (device id
    /// and signing key) is loaded before connecting.
    pub fn reconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.state = ConnectorState::Reconnecting;
        self.pending_get = None;
        self.upload_fifo.clear();
        self.missed_pings = 0;

        self.device_id = self
            .settings
            .get(KEY_DEVICE_ID)
            .and_then(|v| Uuid::parse_str(&v).ok());
        self.sign_key = self.settings.get(KEY_SIGN_KEY).and_then(|v| hex_decode(&v));

        let mut headers = self.config.headers.clone();
        if let Some(token) = &self.id_token {
            headers.push(("Authorization".to_owned(), format!("Bearer {token}")));
        }

        match self
            .factory
            .connect(&self.config.remote_url, &self.config.access_key, &headers)
        {
            Ok(socket) => {
                debug!(url = %self.config.remote_url, "connected to remote");
                self.socket = Some(socket);
                self.state = ConnectorState::Connected;
                self.next_reconnect_at = None;
                self.last_activity = Instant::now();
            }
            Err(message) => self.on_socket_error(message, Instant::now()),
        }
    }

    /// Closes the connection without scheduling a reconnect.
    pub fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
            self.events.push_back(ConnectorEvent::Disconnected);
        }
        self.state = ConnectorState::Disconnected;
        self.next_reconnect_at = None;
        self.pending_get = None;
        self.upload_fifo.clear();
    }

    /// Requests all records of `table` changed after `since`.
    ///
    /// Only one `get_changes` may be outstanding per connector; the engine
    /// serializes tables through the dirty set.
    pub fn get_changes(&mut self, table: &str, since: &Timestamp) {
        if !self.is_ready() {
            warn!(table, "get_changes while not logged in");
            return;
        }
        if self.pending_get.is_some() {
            warn!(table, "get_changes while another request is outstanding");
            return;
        }
        self.pending_get = Some(table.to_owned());
        self.state = ConnectorState::Active;
        self.send_message(&Message::GetChanges(GetChanges {
            table: table.to_owned(),
            since: *since,
        }));
    }

    /// Uploads one record; the acknowledgement arrives as
    /// [`ConnectorEvent::UploadedData`].
    pub fn upload_change(&mut self, record: CloudData) {
        if !self.is_ready() {
            warn!(key = %record.key, "upload while not logged in");
            return;
        }
        self.upload_fifo
            .push_back((record.key.clone(), record.modified));
        self.state = ConnectorState::Active;
        self.send_message(&Message::Upload(Upload { record }));
    }

    /// Drives timers and the socket: fires due reconnects, polls frames,
    /// and runs the keepalive.
    pub fn tick(&mut self, now: Instant) {
        if self.socket.is_none() {
            if let Some(at) = self.next_reconnect_at {
                if now >= at {
                    self.reconnect();
                }
            }
            return;
        }

        loop {
            let polled = self.socket.as_mut().expect("checked above").poll();
            match polled {
                Ok(Some(frame)) => self.on_frame(&frame, now),
                Ok(None) => break,
                Err(message) => {
                    self.on_socket_error(message, now);
                    return;
                }
            }
            if self.socket.is_none() {
                return;
            }
        }

        if (self.pending_get.is_some() || !self.upload_fifo.is_empty())
            && now.duration_since(self.last_activity) >= self.config.request_timeout
        {
            self.on_socket_error("request timed out".to_owned(), now);
            return;
        }

        if now.duration_since(self.last_activity) >= self.config.keepalive_timeout {
            if self.missed_pings >= 2 {
                warn!("keepalive timed out, reconnecting");
                self.on_socket_error("keepalive timeout".to_owned(), now);
            } else {
                self.send_frame(&wire::frame(&wire::ping_body()));
                self.missed_pings += 1;
                self.last_activity = now;
            }
        }
    }

    fn on_frame(&mut self, frame: &[u8], now: Instant) {
        self.last_activity = now;
        self.missed_pings = 0;

        let body = match wire::deframe(frame) {
            Ok(Some((body, _))) => body,
            Ok(None) => {
                warn!("truncated frame received");
                return;
            }
            Err(error) => {
                warn!(%error, "malformed frame received");
                return;
            }
        };

        if wire::is_ping(body) {
            self.send_frame(&wire::frame(&wire::ping_body()));
            return;
        }

        let message = match Message::decode(body) {
            Ok(message) => message,
            Err(error) => {
                // Protocol errors log and carry on; they never disconnect.
                warn!(%error, "undecodable message received");
                return;
            }
        };

        match message {
            Message::Identify(identify) => self.on_identify(&identify.nonce),
            Message::Account(account) => self.on_account(account.device_id),
            Message::Welcome(_) => self.on_welcome(),
            Message::Changes(changes) => self.on_changes(changes),
            Message::ChangesDone(done) => self.on_changes_done(done.table),
            Message::UploadAck(ack) => self.on_upload_ack(ack.key, ack.modified),
            Message::Changed(changed) => {
                self.events
                    .push_back(ConnectorEvent::RemoteChanged { table: changed.table });
            }
            other => warn!(message = other.type_name(), "unexpected message direction"),
        }
    }

    fn on_identify(&mut self, nonce: &[u8; 32]) {
        if self.state != ConnectorState::Connected {
            warn!(state = ?self.state, "unexpected Identify");
            return;
        }
        let identity = self.device_id.zip(self.sign_key.clone());
        if let Some((device_id, sign_key)) = identity {
            let message = Message::Login(Login {
                device_id: device_id.into_bytes(),
                name: self.config.device_name.clone(),
                nonce_sig: sign(&sign_key, nonce),
            });
            self.send_message(&message);
            debug!(%device_id, "sent login");
            self.state = ConnectorState::LoggingIn;
        } else {
            let mut sign_key = vec![0u8; 32];
            let mut crypt_key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut sign_key);
            rand::thread_rng().fill_bytes(&mut crypt_key);

            let mut proof_input = nonce.to_vec();
            proof_input.extend_from_slice(&sign_key);
            proof_input.extend_from_slice(&crypt_key);
            let proof = sign(&sign_key, &proof_input);

            let message = Message::Register(Register {
                name: self.config.device_name.clone(),
                nonce: *nonce,
                sign_key: sign_key.clone(),
                crypt_key: crypt_key.clone(),
                proof,
            });
            self.send_message(&message);
            debug!("sent registration for new device");
            self.pending_register = Some((sign_key, crypt_key));
            self.state = ConnectorState::Registering;
        }
    }

    fn on_account(&mut self, device_id: [u8; 16]) {
        if self.state != ConnectorState::Registering {
            warn!(state = ?self.state, "unexpected Account");
            return;
        }
        let device_id = Uuid::from_bytes(device_id);
        self.settings.set(KEY_DEVICE_ID, &device_id.to_string());
        if let Some((sign_key, crypt_key)) = self.pending_register.take() {
            self.settings.set(KEY_SIGN_KEY, &hex_encode(&sign_key));
            self.settings.set(KEY_CRYPT_KEY, &hex_encode(&crypt_key));
            self.sign_key = Some(sign_key);
        }
        self.device_id = Some(device_id);
        self.state = ConnectorState::Idle;
        self.reconnect_attempt = 0;
        debug!(%device_id, "device registered");
        self.events.push_back(ConnectorEvent::LoggedIn { device_id });
    }

    fn on_welcome(&mut self) {
        if self.state != ConnectorState::LoggingIn {
            warn!(state = ?self.state, "unexpected Welcome");
            return;
        }
        self.state = ConnectorState::Idle;
        self.reconnect_attempt = 0;
        let device_id = self.device_id.expect("login requires a device id");
        debug!(%device_id, "login accepted");
        self.events.push_back(ConnectorEvent::LoggedIn { device_id });
    }

    fn on_changes(&mut self, changes: Changes) {
        if !self.is_ready() {
            warn!(table = changes.table.as_str(), "unexpected Changes");
            return;
        }
        self.events.push_back(ConnectorEvent::DownloadedData {
            table: changes.table,
            records: changes.records,
        });
    }

    fn on_changes_done(&mut self, table: String) {
        if self.pending_get.as_deref() != Some(table.as_str()) {
            warn!(table = table.as_str(), "ChangesDone for unrequested table");
        }
        self.pending_get = None;
        self.settle_state();
        self.events.push_back(ConnectorEvent::SyncDone { table });
    }

    fn on_upload_ack(&mut self, key: ObjectKey, modified: Timestamp) {
        let position = self.upload_fifo.iter().position(|(k, _)| *k == key);
        match position {
            Some(index) => {
                self.upload_fifo.remove(index);
                self.settle_state();
                self.events
                    .push_back(ConnectorEvent::UploadedData { key, modified });
            }
            None => debug!(%key, "duplicate upload ack dropped"),
        }
    }

    fn settle_state(&mut self) {
        if self.is_ready() && self.pending_get.is_none() && self.upload_fifo.is_empty() {
            self.state = ConnectorState::Idle;
        }
    }

    fn send_message(&mut self, message: &Message) {
        self.send_frame(&wire::frame(&message.encode()));
    }

    fn send_frame(&mut self, frame: &[u8]) {
        let result = match self.socket.as_mut() {
            Some(socket) => socket.send(frame),
            None => Err("not connected".to_owned()),
        };
        if let Err(message) = result {
            self.on_socket_error(message, Instant::now());
        }
    }

    fn on_socket_error(&mut self, message: String, now: Instant) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.pending_get = None;
        self.upload_fifo.clear();

        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let delay = self.config.backoff.delay_for_attempt(self.reconnect_attempt);
        self.next_reconnect_at = Some(now + delay);
        self.state = ConnectorState::Reconnecting;
        warn!(%message, retry_in = ?delay, "socket error, reconnect scheduled");
        self.events.push_back(ConnectorEvent::NetworkError { message });
    }
}

fn sign(key: &[u8], input: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::new(), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockWire {
    to_client: VecDeque<Vec<u8>>,
    from_client: Vec<Vec<u8>>,
    open: bool,
    fail_next_send: Option<String>,
    refuse_next_connect: Option<String>,
    connect_count: u32,
}

/// Test-side handle to the scripted peer of a [`MockSocket`].
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    wire: Arc<Mutex<MockWire>>,
}

impl MockServer {
    /// Creates a fresh server script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for delivery to the client.
    pub fn push_message(&self, message: &Message) {
        self.wire
            .lock()
            .to_client
            .push_back(wire::frame(&message.encode()));
    }

    /// Queues a raw frame for delivery to the client.
    pub fn push_frame(&self, frame: Vec<u8>) {
        self.wire.lock().to_client.push_back(frame);
    }

    /// Drains everything the client sent, split into decoded messages and
    /// the number of keepalive pings.
    pub fn take_sent(&self) -> (Vec<Message>, usize) {
        let frames = std::mem::take(&mut self.wire.lock().from_client);
        let mut messages = Vec::new();
        let mut pings = 0;
        for frame in frames {
            if let Ok(Some((body, _))) = wire::deframe(&frame) {
                if wire::is_ping(body) {
                    pings += 1;
                } else if let Ok(message) = Message::decode(body) {
                    messages.push(message);
                }
            }
        }
        (messages, pings)
    }

    /// Severs the connection; the client's next poll fails.
    pub fn drop_connection(&self) {
        self.wire.lock().open = false;
    }

    /// Makes the next connection attempt fail.
    pub fn refuse_next_connect(&self, message: impl Into<String>) {
        self.wire.lock().refuse_next_connect = Some(message.into());
    }

    /// Makes the next send fail.
    pub fn fail_next_send(&self, message: impl Into<String>) {
        self.wire.lock().fail_next_send = Some(message.into());
    }

    /// Number of completed connection attempts.
    pub fn connect_count(&self) -> u32 {
        self.wire.lock().connect_count
    }
}

/// A socket joined to a [`MockServer`] script.
#[derive(Debug)]
pub struct MockSocket {
    wire: Arc<Mutex<MockWire>>,
}

impl Socket for MockSocket {
    fn send(&mut self, frame: &[u8]) -> Result<(), String> {
        let mut wire = self.wire.lock();
        if let Some(message) = wire.fail_next_send.take() {
            wire.open = false;
            return Err(message);
        }
        if !wire.open {
            return Err("connection closed".to_owned());
        }
        wire.from_client.push(frame.to_vec());
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>, String> {
        let mut wire = self.wire.lock();
        if !wire.open {
            return Err("connection reset".to_owned());
        }
        Ok(wire.to_client.pop_front())
    }

    fn close(&mut self) {
        self.wire.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.wire.lock().open
    }
}

/// Factory producing sockets joined to one [`MockServer`].
#[derive(Debug)]
pub struct MockSocketFactory {
    server: MockServer,
}

impl MockSocketFactory {
    /// Creates a factory for the given server script.
    pub fn new(server: MockServer) -> Self {
        Self { server }
    }
}

impl SocketFactory for MockSocketFactory {
    type Sock = MockSocket;

    fn connect(
        &mut self,
        _url: &str,
        _access_key: &str,
        _headers: &[(String, String)],
    ) -> Result<MockSocket, String> {
        let mut wire = self.server.wire.lock();
        if let Some(message) = wire.refuse_next_connect.take() {
            return Err(message);
        }
        wire.open = true;
        wire.connect_count += 1;
        wire.to_client.clear();
        Ok(MockSocket {
            wire: Arc::clone(&self.server.wire),
        })
    }
}
