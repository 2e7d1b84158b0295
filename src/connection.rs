//! Connection Layer (§4.4).
//!
//! A bidirectional encrypted message pipe with an in-band ephemeral
//! Diffie-Hellman handshake, ping/pong liveness, and a three-state
//! lifecycle. Grounded on `config::ConnState` (already a tagged enum
//! with `Display`) generalized into a true state machine with
//! `on_enter`/`on_leave`/`on_state_change` listener lists, on
//! `webrtc_peer.rs`'s `on_peer_connection_state_change` callback
//! wiring for the "callbacks fire after commit" discipline, and on
//! `relay.rs`'s length-prefixed TCP read/write loop for the transport
//! plugin.
//!
//! The four standard plugins (Transport, Promise, Encryption,
//! Ping/Pong) all implement `ConnectionPlugin` and run through the
//! same `transform_incoming`/`transform_outgoing` pipeline. A plugin
//! that needs to act on its own — write a frame without waiting to be
//! asked, reply to a ping, tear the connection down on a missed
//! heartbeat — does so through an `InjectionHandle`, a weak reference
//! to the owning `Connection` captured when the plugin is constructed.

use crate::error::{CoreError, CoreResult};
use crate::identity::{derive_session_key, symmetric_decrypt, symmetric_encrypt, CompleteKeys};
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tracing::{error, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Message(Vec<u8>),
    Opened,
    Closed { reason: String, origin: CloseOrigin },
    Close { reason: String, terminate: bool },
}

/// One stage of the plugin pipeline. Incoming frames run the chain in
/// registration order; outgoing frames run it in reverse. Returning
/// `None` consumes the event. `on_close` lets a plugin holding
/// background tasks (the transport's reader/writer loops) tear them
/// down the moment the connection closes, rather than waiting for a
/// socket error.
pub trait ConnectionPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn transform_incoming(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        Some(event)
    }
    fn transform_outgoing(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        Some(event)
    }
    fn on_close(&self) {}
}

type Listener = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// State machine + plugin pipeline for one connection. Socket I/O,
/// liveness, encryption, and promise-style waiting are all plugins;
/// `Connection` itself only owns state and the pipeline.
pub struct Connection {
    state: RwLock<ConnectionState>,
    plugins: RwLock<Vec<Arc<dyn ConnectionPlugin>>>,
    listeners: RwLock<Vec<Listener>>,
    opened: Notify,
}

impl Connection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ConnectionState::Connecting),
            plugins: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            opened: Notify::new(),
        })
    }

    /// Register a plugin. Order matters: incoming events visit
    /// plugins in registration order (transport first, closest to the
    /// wire; promise last, closest to the application); outgoing
    /// events visit them in reverse.
    pub async fn register_plugin(conn: &Arc<Connection>, plugin: Arc<dyn ConnectionPlugin>) {
        conn.plugins.write().await.push(plugin);
    }

    pub async fn on_state_change(&self, listener: Listener) {
        self.listeners.write().await.push(listener);
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn transition(&self, next: ConnectionState) {
        let prev = {
            let mut state = self.state.write().await;
            let prev = *state;
            *state = next;
            prev
        };
        if prev == next {
            return;
        }
        if next == ConnectionState::Open {
            self.opened.notify_waiters();
        }
        if next == ConnectionState::Closed {
            for plugin in self.plugins.read().await.iter() {
                plugin.on_close();
            }
        }
        // A listener panic must not corrupt producer state: catch it,
        // log it, and keep dispatching to the rest.
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(prev, next)));
            if let Err(_) = result {
                error!("connection state listener panicked, continuing");
            }
        }
    }

    pub async fn mark_open(&self) {
        self.transition(ConnectionState::Open).await;
    }

    pub async fn wait_for_open(&self, timeout_dur: Duration) -> CoreResult<()> {
        if self.state().await == ConnectionState::Closed {
            return Err(CoreError::ConnectionClosed);
        }
        if self.state().await == ConnectionState::Open {
            return Ok(());
        }
        match timeout(timeout_dur, self.opened.notified()).await {
            Ok(_) => {
                if self.state().await == ConnectionState::Closed {
                    Err(CoreError::ConnectionClosed)
                } else {
                    Ok(())
                }
            }
            Err(_) => Err(CoreError::Timeout("wait_for_open".into())),
        }
    }

    /// Graceful close: runs the outgoing pipeline over a `Close`
    /// event so plugins (e.g. the transport) can flush/acknowledge.
    pub async fn close(&self, reason: String) {
        self.run_outgoing(ConnectionEvent::Close { reason: reason.clone(), terminate: false }).await;
        self.transition(ConnectionState::Closed).await;
    }

    /// Drop immediately, skipping any graceful-close plugin handling.
    pub async fn terminate(&self, reason: String) {
        self.transition(ConnectionState::Closed).await;
        warn!("connection terminated: {reason}");
    }

    async fn run_outgoing(&self, event: ConnectionEvent) {
        let plugins = self.plugins.read().await;
        let mut current = Some(event);
        for plugin in plugins.iter().rev() {
            if let Some(e) = current {
                current = plugin.transform_outgoing(e);
            } else {
                break;
            }
        }
    }

    pub async fn send_message(&self, bytes: Vec<u8>) {
        self.run_outgoing(ConnectionEvent::Message(bytes)).await;
    }

    /// Feed one raw inbound frame through the plugin pipeline in
    /// registration order. The transport plugin's reader loop is the
    /// intended (and in practice only) caller; whatever survives the
    /// whole pipeline is the promise plugin's job to collect.
    pub async fn dispatch_incoming(&self, bytes: Vec<u8>) {
        let plugins = self.plugins.read().await;
        let mut current = Some(ConnectionEvent::Message(bytes));
        for plugin in plugins.iter() {
            if let Some(e) = current {
                current = plugin.transform_incoming(e);
            } else {
                break;
            }
        }
    }
}

/// A handle to a `Connection`, captured by a plugin at attachment
/// time (construction), that lets it inject events outside the normal
/// transform flow: send a frame through the full outgoing pipeline,
/// feed a raw inbound frame through the full incoming pipeline, query
/// connection state, or terminate the connection. Holds only a `Weak`
/// reference so a plugin never keeps a closed connection alive.
#[derive(Clone)]
pub struct InjectionHandle {
    conn: Weak<Connection>,
}

impl InjectionHandle {
    pub fn new(conn: &Arc<Connection>) -> Self {
        Self { conn: Arc::downgrade(conn) }
    }

    pub async fn send(&self, bytes: Vec<u8>) {
        if let Some(conn) = self.conn.upgrade() {
            conn.send_message(bytes).await;
        }
    }

    pub async fn feed_incoming(&self, bytes: Vec<u8>) {
        if let Some(conn) = self.conn.upgrade() {
            conn.dispatch_incoming(bytes).await;
        }
    }

    pub async fn terminate(&self, reason: String) {
        if let Some(conn) = self.conn.upgrade() {
            conn.terminate(reason).await;
        }
    }

    pub async fn state(&self) -> Option<ConnectionState> {
        match self.conn.upgrade() {
            Some(conn) => Some(conn.state().await),
            None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire messages for the handshake (§6)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum HandshakeMessage {
    #[serde(rename = "communication_request")]
    CommunicationRequest { source_public_key: String, target_public_key: String },
    #[serde(rename = "communication_ready")]
    CommunicationReady,
    #[serde(rename = "communication_key_exchange")]
    KeyExchange { wrapped_ephemeral_public: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum LivenessMessage {
    #[serde(rename = "comm_ping")]
    Ping,
    #[serde(rename = "comm_pong")]
    Pong,
}

/// Derive the ephemeral shared key for one side of the handshake
/// described in §4.4 steps 3-6: generate an ephemeral keypair, encrypt
/// it under the long-term static shared key, and — once the
/// counterpart's encrypted ephemeral public key arrives — derive the
/// final forward-secret session key. Returns `None` (never reaching
/// `open`) if decryption fails, which is exactly the MITM-resistance
/// property: only the holder of the target's long-term private key
/// can decrypt step 4.
pub struct HandshakeInitiator {
    ephemeral_secret: EphemeralSecret,
    ephemeral_public: X25519PublicKey,
}

impl HandshakeInitiator {
    pub fn new() -> Self {
        let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
        Self { ephemeral_secret, ephemeral_public }
    }

    /// Encrypt our ephemeral public key under the long-term static
    /// shared key so only the legitimate counterpart can read it.
    pub fn wrap_ephemeral_public(&self, static_shared: &[u8; 32]) -> CoreResult<Vec<u8>> {
        symmetric_encrypt(static_shared, self.ephemeral_public.as_bytes())
    }

    /// Decrypt the counterpart's wrapped ephemeral public key and
    /// derive the final session key. Fails (and the connection must
    /// never reach `open`) if decryption fails.
    pub fn finish(self, static_shared: &[u8; 32], wrapped_remote_ephemeral: &[u8]) -> CoreResult<[u8; 32]> {
        let remote_bytes = symmetric_decrypt(static_shared, wrapped_remote_ephemeral)?;
        let arr: [u8; 32] = remote_bytes
            .try_into()
            .map_err(|_| CoreError::Invalid("ephemeral public key must be 32 bytes".into()))?;
        let remote_public = X25519PublicKey::from(arr);
        let shared = self.ephemeral_secret.diffie_hellman(&remote_public);
        Ok(*shared.as_bytes())
    }
}

impl Default for HandshakeInitiator {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the long-term static shared key used only to wrap the
/// ephemeral exchange (never used to encrypt application traffic).
pub fn static_shared_key(remote_encrypt_public_hex: &str, local_encrypt_secret: &StaticSecret) -> CoreResult<[u8; 32]> {
    derive_session_key(remote_encrypt_public_hex, local_encrypt_secret)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Drive the §4.4 handshake end-to-end over an already-constructed
/// `Connection`: exchange `communication_request`/`communication_ready`,
/// exchange ephemeral public keys wrapped under the long-term static
/// shared key, install the resulting session key into `encryption`,
/// and only then move the connection to `Open`. Returns an error
/// (connection left exactly as it was, never opened) if either side
/// fails to decrypt the other's wrapped ephemeral key — the
/// MITM-resistance property promised by `HandshakeInitiator::finish`.
pub async fn perform_handshake(
    conn: &Arc<Connection>,
    promise: &PromisePlugin,
    encryption: &EncryptionPlugin,
    local_keys: &CompleteKeys,
    remote_encrypt_public_hex: &str,
    role: HandshakeRole,
    timeout_dur: Duration,
) -> CoreResult<()> {
    match role {
        HandshakeRole::Initiator => {
            let request = HandshakeMessage::CommunicationRequest {
                source_public_key: hex::encode(local_keys.encrypt_public.as_bytes()),
                target_public_key: remote_encrypt_public_hex.to_string(),
            };
            let bytes = serde_json::to_vec(&request).map_err(|e| CoreError::Invalid(e.to_string()))?;
            conn.send_message(bytes).await;
            let _ready: HandshakeMessage =
                promise.wait_for_json_message_with_command("communication_ready", timeout_dur).await?;
        }
        HandshakeRole::Responder => {
            let request: HandshakeMessage =
                promise.wait_for_json_message_with_command("communication_request", timeout_dur).await?;
            let HandshakeMessage::CommunicationRequest { target_public_key, .. } = request else {
                return Err(CoreError::Protocol {
                    expected: "communication_request".into(),
                    got: "a different handshake message".into(),
                });
            };
            let our_pub = hex::encode(local_keys.encrypt_public.as_bytes());
            if target_public_key != our_pub {
                return Err(CoreError::Invalid("communication_request targeted a different key".into()));
            }
            let bytes = serde_json::to_vec(&HandshakeMessage::CommunicationReady)
                .map_err(|e| CoreError::Invalid(e.to_string()))?;
            conn.send_message(bytes).await;
        }
    }

    let static_shared = static_shared_key(remote_encrypt_public_hex, &local_keys.encrypt_secret)?;
    let initiator = HandshakeInitiator::new();
    let wrapped = initiator.wrap_ephemeral_public(&static_shared)?;
    let key_exchange = HandshakeMessage::KeyExchange {
        wrapped_ephemeral_public: general_purpose::STANDARD_NO_PAD.encode(wrapped),
    };
    let bytes = serde_json::to_vec(&key_exchange).map_err(|e| CoreError::Invalid(e.to_string()))?;
    conn.send_message(bytes).await;

    let remote: HandshakeMessage =
        promise.wait_for_json_message_with_command("communication_key_exchange", timeout_dur).await?;
    let HandshakeMessage::KeyExchange { wrapped_ephemeral_public } = remote else {
        return Err(CoreError::Protocol {
            expected: "communication_key_exchange".into(),
            got: "a different handshake message".into(),
        });
    };
    let wrapped_remote = general_purpose::STANDARD_NO_PAD
        .decode(&wrapped_ephemeral_public)
        .map_err(|e| CoreError::Invalid(e.to_string()))?;

    let session_key = initiator.finish(&static_shared, &wrapped_remote)?;
    encryption.install_session_key(session_key).await;
    conn.mark_open().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Standard plugins
// ---------------------------------------------------------------------------

/// Symmetrically encrypts/decrypts every payload once the handshake
/// has installed a session key, with a monotonic per-connection nonce
/// folded into the AEAD nonce via `symmetric_encrypt`'s fresh-nonce
/// contract (each call already mints its own nonce).
pub struct EncryptionPlugin {
    session_key: RwLock<Option<[u8; 32]>>,
}

impl EncryptionPlugin {
    pub fn new() -> Self {
        Self { session_key: RwLock::new(None) }
    }

    pub async fn install_session_key(&self, key: [u8; 32]) {
        *self.session_key.write().await = Some(key);
    }
}

impl Default for EncryptionPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPlugin for EncryptionPlugin {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn transform_incoming(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        match event {
            ConnectionEvent::Message(bytes) => {
                let key = self.session_key.try_read().ok()?.clone();
                match key {
                    Some(key) => symmetric_decrypt(&key, &bytes).ok().map(ConnectionEvent::Message),
                    None => Some(ConnectionEvent::Message(bytes)),
                }
            }
            other => Some(other),
        }
    }

    fn transform_outgoing(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        match event {
            ConnectionEvent::Message(bytes) => {
                let key = self.session_key.try_read().ok()?.clone();
                match key {
                    Some(key) => symmetric_encrypt(&key, &bytes).ok().map(ConnectionEvent::Message),
                    None => Some(ConnectionEvent::Message(bytes)),
                }
            }
            other => Some(other),
        }
    }
}

/// Terminal stage of the incoming pipeline and the application's entry
/// point: buffers whatever survives the other plugins and exposes
/// `wait_for_message`/`wait_for_json_message_with_command`, the
/// one-shot "promise" pattern the handshake and pairing flows use to
/// wait for a specific reply while discarding anything else (pings,
/// unrelated protocol chatter) that arrives first.
pub struct PromisePlugin {
    incoming_tx: mpsc::UnboundedSender<ConnectionEvent>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl PromisePlugin {
    pub fn new() -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self { incoming_tx, incoming_rx: Mutex::new(incoming_rx) })
    }

    pub async fn wait_for_message(&self, timeout_dur: Duration) -> CoreResult<ConnectionEvent> {
        let mut rx = self.incoming_rx.lock().await;
        match timeout(timeout_dur, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(CoreError::ConnectionClosed),
            Err(_) => Err(CoreError::Timeout("wait_for_message".into())),
        }
    }

    pub async fn wait_for_json_message_with_command<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        timeout_dur: Duration,
    ) -> CoreResult<T> {
        let deadline = Instant::now() + timeout_dur;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::Timeout(format!("waiting for {command}")));
            }
            match self.wait_for_message(remaining).await? {
                ConnectionEvent::Message(bytes) => {
                    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else { continue };
                    if value.get("command").and_then(|c| c.as_str()) != Some(command) {
                        continue;
                    }
                    return serde_json::from_value(value)
                        .map_err(|e| CoreError::Invalid(format!("decode {command}: {e}")));
                }
                ConnectionEvent::Closed { .. } => return Err(CoreError::ConnectionClosed),
                _ => continue,
            }
        }
    }
}

impl ConnectionPlugin for PromisePlugin {
    fn name(&self) -> &'static str {
        "promise"
    }

    fn transform_incoming(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        let _ = self.incoming_tx.send(event);
        None
    }
}

/// Sends `{"command":"comm_ping"}` after `ping_interval` of outbound
/// silence, via its `InjectionHandle`, and terminates if no reply
/// arrives within `ping_interval + rtt`. Intercepts incoming
/// `comm_pong` frames itself so the application never sees them.
pub struct PingPlugin {
    handle: InjectionHandle,
    ping_interval: Duration,
    rtt: Duration,
    last_sent: Mutex<Instant>,
    last_pong: Mutex<Instant>,
}

impl PingPlugin {
    /// Construct and immediately spawn the ping loop, capturing
    /// `handle` at attachment time so the loop can inject pings and
    /// terminate the connection outside the normal transform flow.
    pub fn spawn(handle: InjectionHandle, ping_interval: Duration, rtt: Duration) -> Arc<Self> {
        let now = Instant::now();
        let plugin = Arc::new(Self {
            handle,
            ping_interval,
            rtt,
            last_sent: Mutex::new(now),
            last_pong: Mutex::new(now),
        });
        tokio::spawn(plugin.clone().run());
        plugin
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.ping_interval);
        loop {
            interval.tick().await;
            match self.handle.state().await {
                Some(ConnectionState::Closed) | None => return,
                _ => {}
            }
            let ping = serde_json::to_vec(&LivenessMessage::Ping).unwrap_or_default();
            self.handle.send(ping).await;
            *self.last_sent.lock().await = Instant::now();

            tokio::time::sleep(self.rtt).await;
            let last_pong = *self.last_pong.lock().await;
            let last_sent = *self.last_sent.lock().await;
            if last_pong < last_sent {
                self.handle.terminate("Ping: Connection timed out".to_string()).await;
                return;
            }
        }
    }
}

impl ConnectionPlugin for PingPlugin {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn transform_incoming(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        if let ConnectionEvent::Message(bytes) = &event {
            if matches!(serde_json::from_slice::<LivenessMessage>(bytes), Ok(LivenessMessage::Pong)) {
                if let Ok(mut guard) = self.last_pong.try_lock() {
                    *guard = Instant::now();
                }
                return None;
            }
        }
        Some(event)
    }
}

/// Replies to incoming pings with `{"command":"comm_pong"}` through
/// its `InjectionHandle` and terminates if no ping arrives within
/// `ping_interval + 2*rtt`.
pub struct PongPlugin {
    handle: InjectionHandle,
    timeout: Duration,
    last_ping: Mutex<Instant>,
}

impl PongPlugin {
    pub fn spawn(handle: InjectionHandle, ping_interval: Duration, rtt: Duration) -> Arc<Self> {
        let plugin = Arc::new(Self {
            handle,
            timeout: ping_interval + rtt * 2,
            last_ping: Mutex::new(Instant::now()),
        });
        tokio::spawn(plugin.clone().run());
        plugin
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.timeout / 4).await;
            match self.handle.state().await {
                Some(ConnectionState::Closed) | None => return,
                _ => {}
            }
            if self.last_ping.lock().await.elapsed() > self.timeout {
                self.handle.terminate("Pong: no ping received in time".to_string()).await;
                return;
            }
        }
    }
}

impl ConnectionPlugin for PongPlugin {
    fn name(&self) -> &'static str {
        "pong"
    }

    fn transform_incoming(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        if let ConnectionEvent::Message(bytes) = &event {
            if matches!(serde_json::from_slice::<LivenessMessage>(bytes), Ok(LivenessMessage::Ping)) {
                if let Ok(mut guard) = self.last_ping.try_lock() {
                    *guard = Instant::now();
                }
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    let pong = serde_json::to_vec(&LivenessMessage::Pong).unwrap_or_default();
                    handle.send(pong).await;
                });
                return None;
            }
        }
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Transport: length-prefixed frames over TCP, grounded on relay.rs
// ---------------------------------------------------------------------------

const MAX_FRAME_LEN: usize = 1 << 20;

/// Generic over the stream type so the same framing works whether the
/// transport is plaintext `TcpStream` or a `tokio_rustls`-wrapped one
/// (§4.4: "plaintext or TLS").
pub async fn read_frame<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> CoreResult<Vec<u8>> {
    let len = stream
        .read_u32()
        .await
        .map_err(|_| CoreError::ConnectionClosed)?;
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(CoreError::Protocol { expected: "frame <= 1MiB".into(), got: format!("{len} bytes") });
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| CoreError::ConnectionClosed)?;
    Ok(buf)
}

pub async fn write_frame<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> CoreResult<()> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(CoreError::Protocol { expected: "frame <= 1MiB".into(), got: format!("{} bytes", bytes.len()) });
    }
    stream
        .write_u32(bytes.len() as u32)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
    stream
        .write_all(bytes)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
    Ok(())
}

/// Owns the real byte stream: a reader task feeds every inbound frame
/// into the pipeline via `InjectionHandle::feed_incoming`, and
/// `transform_outgoing` hands every outbound frame to a writer task
/// over an internal channel, consuming the event so no later plugin
/// (there shouldn't be one registered after it) sees it.
pub struct TransportPlugin {
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TransportPlugin {
    /// Spawn the reader and writer loops over `stream` and return the
    /// plugin ready for `Connection::register_plugin`. `handle` must
    /// be a handle to the same `Connection` the plugin is about to be
    /// registered on.
    pub fn spawn<S>(stream: S, handle: InjectionHandle) -> Arc<Self>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = outgoing_rx.recv().await {
                if write_frame(&mut write_half, &bytes).await.is_err() {
                    break;
                }
            }
        });

        let reader_handle = handle;
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(bytes) => reader_handle.feed_incoming(bytes).await,
                    Err(_) => {
                        reader_handle.terminate("transport read closed".to_string()).await;
                        break;
                    }
                }
            }
        });

        Arc::new(Self {
            outgoing_tx,
            tasks: std::sync::Mutex::new(vec![writer_task, reader_task]),
        })
    }
}

impl ConnectionPlugin for TransportPlugin {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn transform_outgoing(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        if let ConnectionEvent::Message(bytes) = &event {
            let _ = self.outgoing_tx.send(bytes.clone());
        }
        None
    }

    fn on_close(&self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

/// Accept one incoming TLS connection over an already-accepted TCP
/// socket, grounded on `irc_server.rs::run_inner`'s
/// `acceptor.accept(socket).await` branch taken when the listener was
/// started with `run_tls`.
pub async fn accept_tls(
    acceptor: &tokio_rustls::TlsAcceptor,
    socket: TcpStream,
) -> CoreResult<tokio_rustls::server::TlsStream<TcpStream>> {
    acceptor.accept(socket).await.map_err(|e| CoreError::Storage(e.to_string()))
}

/// Connect out over TLS, grounded on the same plaintext-or-TLS split,
/// the client-side counterpart of `accept_tls`.
pub async fn connect_tls(
    connector: &tokio_rustls::TlsConnector,
    domain: rustls::pki_types::ServerName<'static>,
    socket: TcpStream,
) -> CoreResult<tokio_rustls::client::TlsStream<TcpStream>> {
    connector.connect(domain, socket).await.map_err(|e| CoreError::Storage(e.to_string()))
}

// ---------------------------------------------------------------------------
// Outgoing-connection retry (§4.4)
// ---------------------------------------------------------------------------

pub struct ConnectionEstablisher {
    retry_timeout: Duration,
    stopped: Arc<Notify>,
    stop_flag: Arc<RwLock<bool>>,
}

impl ConnectionEstablisher {
    pub fn new(retry_timeout: Duration) -> Self {
        Self {
            retry_timeout,
            stopped: Arc::new(Notify::new()),
            stop_flag: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn stop(&self) {
        *self.stop_flag.write().await = true;
        self.stopped.notify_waiters();
    }

    /// Retry `connect_once` every `retry_timeout` until it succeeds or
    /// `stop()` is called; invokes `on_connection` exactly once, on
    /// the first success.
    pub async fn run<F, Fut, C>(&self, mut connect_once: F, on_connection: C)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CoreResult<Arc<Connection>>>,
        C: Fn(Arc<Connection>),
    {
        loop {
            if *self.stop_flag.read().await {
                return;
            }
            match connect_once().await {
                Ok(conn) => {
                    on_connection(conn);
                    return;
                }
                Err(e) => {
                    info!("outgoing connection attempt failed: {e}, retrying");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry_timeout) => {}
                _ = self.stopped.notified() => return,
            }
        }
    }

    /// One-shot variant: succeeds once, rejects on timeout or `stop()`.
    pub async fn connect_once_successfully<F, Fut>(
        &self,
        mut connect_once: F,
        success_timeout: Duration,
    ) -> CoreResult<Arc<Connection>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CoreResult<Arc<Connection>>>,
    {
        let deadline = tokio::time::sleep(success_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Err(CoreError::Timeout("connect_once_successfully".into())),
                _ = self.stopped.notified() => return Err(CoreError::ConnectionClosed),
                result = connect_once() => {
                    match result {
                        Ok(conn) => return Ok(conn),
                        Err(_) => {
                            tokio::select! {
                                _ = tokio::time::sleep(self.retry_timeout) => {}
                                _ = self.stopped.notified() => return Err(CoreError::ConnectionClosed),
                            }
                        }
                    }
                }
            }
        }
    }
}
