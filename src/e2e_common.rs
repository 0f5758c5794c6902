//! In-process relay used by end-to-end tests and demos.
//!
//! Speaks just enough of the relay protocol: answers `/ckm` key exchanges
//! with a fixed Ed25519 identity, registers endpoints on `/m2m` (code 100
//! for sealed credentials, 200 for a known token), forwards client requests
//! to devices and device replies to clients (wrapped in arrays, as the real
//! relay does) and fans out `activeStart`/`exit` notices.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, LivenessConfig, ReconnectConfig, DEFAULT_SERVER};
use crate::crypto::cipher::open_credentials;
use crate::crypto::{Credentials, KeyExchange, P521KeyExchange, SealedCredentials, TransientKeys};
use crate::frame::Frame;
use crate::handshake::{HandshakeMessage, KeyReply};

/// Seed of the relay's identity key.
pub const RELAY_SEED: [u8; 32] = [7u8; 32];

/// Credentials accepted by a relay started with [`FakeRelay::start`].
pub fn test_credentials() -> crate::Result<Credentials> {
    Credentials::new("a@b.com", "Abcdef1!", Some("1234"))
}

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Accepted `(userid, password)`; any credentials when `None`.
    pub account: Option<(String, String)>,
    /// Device ids reported by `getDevices`/`getRegisteredDevices`, in
    /// addition to every device that registered.
    pub registered_devices: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PeerId {
    Device(u64),
    Client(String),
}

struct Peer {
    conn: u64,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RelayState {
    keys: HashMap<String, TransientKeys>,
    tokens: HashMap<String, String>,
    peers: HashMap<PeerId, Peer>,
    known_devices: Vec<u64>,
    received: Vec<Frame>,
    connections: u64,
    registrations: u32,
}

struct Shared {
    signing: SigningKey,
    options: RelayOptions,
    state: Mutex<RelayState>,
    changed: Notify,
    shutdown: CancellationToken,
}

pub struct FakeRelay {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl FakeRelay {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(RelayOptions {
            account: Some(("a@b.com".into(), "Abcdef1!".into())),
            registered_devices: Vec::new(),
        })
        .await
    }

    pub async fn start_with(options: RelayOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            signing: SigningKey::from_bytes(&RELAY_SEED),
            state: Mutex::new(RelayState {
                known_devices: options.registered_devices.clone(),
                ..RelayState::default()
            }),
            options,
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let accept = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept.shutdown.cancelled() => break,
                    conn = listener.accept() => match conn {
                        Ok((stream, _)) => {
                            tokio::spawn(serve(accept.clone(), stream));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "relay accept failed");
                            break;
                        }
                    }
                }
            }
        });
        Ok(Self { addr, shared })
    }

    pub fn server(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Base64 identity key to pin in [`Config::server_key`].
    pub fn relay_key(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.shared.signing.verifying_key().as_bytes())
    }

    /// Config pointing at this relay with every file under `dir` and short
    /// reconnect delays.
    pub fn config(&self, dir: &Path) -> Config {
        Config {
            server: self.server(),
            server_key: Some(self.relay_key()),
            token_path: dir.join("tk"),
            log_path: dir.join("log.txt"),
            restart_marker: dir.join("mon"),
            module_root: dir.to_path_buf(),
            handshake_timeout_ms: 2_000,
            reconnect: ReconnectConfig {
                base_ms: 20,
                spread_ms: 20,
                extension_ms: 10,
            },
            liveness: LivenessConfig {
                base_ms: 10,
                step_ms: 10,
                max_ms: 100,
            },
            ..Config::default()
        }
    }

    pub fn registrations(&self) -> u32 {
        self.shared.state.lock().registrations
    }

    pub fn is_device_connected(&self, id: u64) -> bool {
        self.shared.state.lock().peers.contains_key(&PeerId::Device(id))
    }

    pub fn is_client_connected(&self, app_id: &str) -> bool {
        self.shared
            .state
            .lock()
            .peers
            .contains_key(&PeerId::Client(app_id.to_string()))
    }

    /// Every frame received on `/m2m` so far.
    pub fn received(&self) -> Vec<Frame> {
        self.shared.state.lock().received.clone()
    }

    /// Waits until a received frame satisfies `pred`.
    pub async fn wait_for(&self, timeout: Duration, pred: impl Fn(&Frame) -> bool) -> Option<Frame> {
        self.wait(timeout, |state| state.received.iter().find(|f| pred(f)).cloned())
            .await
    }

    pub async fn wait_device(&self, id: u64, timeout: Duration) -> bool {
        self.wait(timeout, |state| state.peers.get(&PeerId::Device(id)).map(|_| ()))
            .await
            .is_some()
    }

    pub async fn wait_client(&self, app_id: &str, timeout: Duration) -> bool {
        let key = PeerId::Client(app_id.to_string());
        self.wait(timeout, |state| state.peers.get(&key).map(|_| ()))
            .await
            .is_some()
    }

    async fn wait<T>(&self, timeout: Duration, probe: impl Fn(&RelayState) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            if let Some(found) = probe(&*self.shared.state.lock()) {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Sends `frame` to a registered device.
    pub fn push_to_device(&self, id: u64, frame: &Frame) -> bool {
        self.shared.send_to(&PeerId::Device(id), frame, false)
    }

    /// Sends `frame` to a registered client.
    pub fn push_to_client(&self, app_id: &str, frame: &Frame) -> bool {
        self.shared
            .send_to(&PeerId::Client(app_id.to_string()), frame, true)
    }

    /// Drops every connection without a close handshake.
    pub fn drop_connections(&self) {
        let peers: Vec<PeerId> = self.shared.state.lock().peers.keys().cloned().collect();
        for peer in peers {
            self.shared.disconnect(&peer, None);
        }
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn send_to(&self, peer: &PeerId, frame: &Frame, batch: bool) -> bool {
        let text = if batch {
            serde_json::to_string(&[frame])
        } else {
            serde_json::to_string(frame)
        };
        let Ok(text) = text else {
            return false;
        };
        match self.state.lock().peers.get(peer) {
            Some(p) => p.tx.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    fn broadcast_clients(&self, frame: &Frame) {
        let clients: Vec<PeerId> = self
            .state
            .lock()
            .peers
            .keys()
            .filter(|p| matches!(p, PeerId::Client(_)))
            .cloned()
            .collect();
        for client in clients {
            self.send_to(&client, frame, true);
        }
    }

    fn devices(&self) -> Vec<u64> {
        let state = self.state.lock();
        let mut ids: Vec<u64> = state.known_devices.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn connected_devices(&self) -> Vec<u64> {
        self.state
            .lock()
            .peers
            .keys()
            .filter_map(|p| match p {
                PeerId::Device(id) => Some(*id),
                PeerId::Client(_) => None,
            })
            .collect()
    }

    /// Removes `peer` and tells the other side it went away. With `conn`
    /// set, only that connection's registration is removed.
    fn disconnect(&self, peer: &PeerId, conn: Option<u64>) {
        let removed = {
            let mut state = self.state.lock();
            match state.peers.get(peer) {
                Some(current) if conn.map_or(true, |c| c == current.conn) => state.peers.remove(peer),
                _ => None,
            }
        };
        let Some(removed) = removed else {
            return;
        };
        removed.cancel.cancel();
        match peer {
            PeerId::Device(id) => {
                self.broadcast_clients(&Frame::new().with("id", *id).with("exit", true));
            }
            PeerId::Client(app_id) => {
                for id in self.devices() {
                    let notice = Frame::new()
                        .with("id", id)
                        .with("appId", app_id.clone())
                        .with("exit", true)
                        .with("stopEvent", true);
                    self.send_to(&PeerId::Device(id), &notice, false);
                }
            }
        }
        self.changed.notify_waiters();
    }

    fn key_exchange(&self, text: &str) -> Option<String> {
        let HandshakeMessage::Request(request) = serde_json::from_str::<HandshakeMessage>(text).ok()? else {
            return None;
        };
        let b64 = base64::engine::general_purpose::STANDARD;
        let peer = b64.decode(request.bk?).ok()?;
        let exchange = P521KeyExchange::new();
        let shared = exchange.shared_secret(&peer).ok()?;
        let mut nonce = [0u8; 12];
        let mut salt = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        rand::thread_rng().fill_bytes(&mut salt);
        let (nk, st) = (hex::encode(nonce), hex::encode(salt));
        let keys = TransientKeys::derive(&shared, &nk, &st).ok()?;
        self.state.lock().keys.insert(st.clone(), keys);
        let reply = HandshakeMessage::Reply(KeyReply {
            puk: b64.encode(self.signing.verifying_key().as_bytes()),
            bk: b64.encode(self.signing.sign(DEFAULT_SERVER.as_bytes()).to_bytes()),
            sk: b64.encode(exchange.public_key()),
            nk,
            st,
        });
        serde_json::to_string(&reply).ok()
    }

    /// Handles the first frame of a main connection. Returns the registered
    /// peer and the reply.
    fn register(&self, frame: &Frame) -> (Option<PeerId>, Frame) {
        let peer = if frame.flag("device") {
            frame.u64_field("id").map(PeerId::Device)
        } else if frame.flag("app") {
            frame
                .app_id()
                .or_else(|| frame.str_field("id"))
                .map(|id| PeerId::Client(id.to_string()))
        } else {
            None
        };
        let Some(peer) = peer else {
            return (None, Frame::new().with("code", 530).with("reason", "invalid id"));
        };

        if frame.contains("euc") {
            if let Err(reason) = self.check_credentials(frame) {
                return (None, Frame::new().with("code", 500).with("reason", reason));
            }
            let aid = uuid::Uuid::new_v4().simple().to_string();
            let ak = uuid::Uuid::new_v4().simple().to_string();
            self.state.lock().tokens.insert(aid.clone(), ak.clone());
            let mut reply = Frame::new()
                .with("code", 100)
                .with("reason", "registered")
                .with("uid", "user-1")
                .with("aid", aid)
                .with("ak", ak);
            match &peer {
                PeerId::Device(id) => {
                    reply.set("device", true).set("id", *id);
                }
                PeerId::Client(app_id) => {
                    reply
                        .set("app", true)
                        .set("id", app_id.clone())
                        .set("appId", app_id.clone());
                }
            }
            return (Some(peer), reply);
        }

        let valid = match (frame.str_field("aid"), frame.str_field("ak")) {
            (Some(aid), Some(ak)) => self.state.lock().tokens.get(aid).map(String::as_str) == Some(ak),
            _ => false,
        };
        if valid {
            (Some(peer), Frame::new().with("code", 200).with("reason", "active"))
        } else {
            (None, Frame::new().with("code", 530).with("reason", "invalid token"))
        }
    }

    fn check_credentials(&self, frame: &Frame) -> Result<(), String> {
        let idn = frame.str_field("idn").ok_or("missing idn")?;
        let keys = self
            .state
            .lock()
            .keys
            .remove(idn)
            .ok_or("no key exchange for registration")?;
        let sealed = SealedCredentials {
            euc: frame.str_field("euc").unwrap_or_default().to_string(),
            att: frame.str_field("att").unwrap_or_default().to_string(),
            esc: None,
        };
        let (userid, password) = open_credentials(&keys, &sealed).map_err(|e| e.to_string())?;
        match &self.options.account {
            Some((expected_user, expected_pw)) if userid != *expected_user || password.as_str() != expected_pw.as_str() => {
                Err("invalid credentials".into())
            }
            _ => Ok(()),
        }
    }

    fn relay(&self, from: &PeerId, frame: Frame) {
        if frame.pid().map(|pid| pid.ends_with("renew-ws")).unwrap_or(false) {
            return;
        }
        if frame.flag("exit") {
            self.disconnect(from, None);
            return;
        }
        match from {
            PeerId::Client(_) => {
                if frame.flag("getRegisteredDevices") || frame.flag("getDevices") {
                    let devices: Vec<Value> = self.devices().into_iter().map(|id| json!({ "id": id })).collect();
                    let reply = frame.with("devices", devices);
                    self.send_to(from, &reply, true);
                    return;
                }
                let Some(device) = frame.u64_field("id") else {
                    return;
                };
                if !self.send_to(&PeerId::Device(device), &frame, false) {
                    let reply = frame.with("error", format!("device[{device}] is off-line"));
                    self.send_to(from, &reply, true);
                }
            }
            PeerId::Device(_) => {
                if let Some(app_id) = frame.app_id().map(str::to_string) {
                    self.send_to(&PeerId::Client(app_id), &frame, true);
                }
            }
        }
    }
}

async fn serve(shared: Arc<Shared>, stream: TcpStream) {
    let mut path = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::debug!(error = %err, "relay handshake failed");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    if path == "/ckm" {
        if let Some(Ok(Message::Text(text))) = stream.next().await {
            if let Some(reply) = shared.key_exchange(&text) {
                let _ = sink.send(Message::Text(reply)).await;
            }
        }
        let _ = sink.close().await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let cancel = shared.shutdown.child_token();
    let conn = {
        let mut state = shared.state.lock();
        state.connections += 1;
        state.connections
    };
    let mut registered: Option<PeerId> = None;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                writer.abort();
                break;
            }
            message = stream.next() => message,
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };
        let Ok(frames) = Frame::parse_batch(&text) else {
            continue;
        };
        for frame in frames {
            {
                let mut state = shared.state.lock();
                state.received.push(frame.clone());
            }
            shared.changed.notify_waiters();
            match &registered {
                Some(peer) => shared.relay(peer, frame),
                None => {
                    let (peer, reply) = shared.register(&frame);
                    if let Ok(text) = reply.to_text() {
                        let _ = tx.send(Message::Text(text));
                    }
                    if let Some(peer) = peer {
                        {
                            let mut state = shared.state.lock();
                            state.registrations += 1;
                            if let PeerId::Device(id) = &peer {
                                state.known_devices.push(*id);
                            }
                            state.peers.insert(
                                peer.clone(),
                                Peer {
                                    conn,
                                    tx: tx.clone(),
                                    cancel: cancel.clone(),
                                },
                            );
                        }
                        match &peer {
                            PeerId::Device(id) => {
                                shared.broadcast_clients(&active_start(*id));
                            }
                            PeerId::Client(_) => {
                                for id in shared.connected_devices() {
                                    shared.send_to(&peer, &active_start(id), true);
                                }
                            }
                        }
                        shared.changed.notify_waiters();
                        registered = Some(peer);
                    }
                }
            }
        }
    }

    if let Some(peer) = registered {
        shared.disconnect(&peer, Some(conn));
    }
}

fn active_start(id: u64) -> Frame {
    Frame::new()
        .with("id", id)
        .with("activeStart", true)
        .with("active", true)
}
