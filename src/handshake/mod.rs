//! Key exchange with the relay.
//!
//! One short-lived `/ckm` connection per fresh registration: the endpoint
//! sends an ephemeral secp521r1 public key, the relay answers with its pinned
//! Ed25519 identity, a signature over the shared verification string, its own
//! ephemeral key and the two derivation salts. The connection is closed as
//! soon as the reply arrives; the derived [`TransientKeys`] travel on to the
//! main connection's registration frame.

use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::crypto::{CryptoError, P521KeyExchange, TransientKeys};

pub mod client;
pub mod registration;
pub mod transport;

pub use client::KeyExchangeHandshake;
pub use transport::{TimeoutTransport, WsHandshakeTransport};

pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
/// `_sid` of key-exchange frames.
pub const KEY_EXCHANGE_SID: &str = "ckm";
/// `_pid` of the key-exchange request.
pub const KEY_EXCHANGE_PID: &str = "dck";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Endpoint to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequest {
    #[serde(rename = "_sid")]
    pub sid: String,
    #[serde(rename = "_pid")]
    pub pid: String,
    /// Asks the relay for a fresh key set.
    pub rk: bool,
    pub version: String,
    /// Random request id.
    pub rid: String,
    /// Base64 SEC1 public key of the endpoint's ephemeral key pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bk: Option<String>,
}

impl KeyRequest {
    pub fn new(rid: impl Into<String>, public_key: Option<String>) -> Self {
        Self {
            sid: KEY_EXCHANGE_SID.to_string(),
            pid: KEY_EXCHANGE_PID.to_string(),
            rk: true,
            version: PROTOCOL_VERSION.to_string(),
            rid: rid.into(),
            bk: public_key,
        }
    }
}

/// Relay to endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReply {
    /// Base64 Ed25519 identity key of the relay.
    pub puk: String,
    /// Base64 signature over the verification string.
    pub bk: String,
    /// Base64 SEC1 public key of the relay's ephemeral key pair.
    pub sk: String,
    /// Hex salt of the payload key; also the GCM nonce.
    pub nk: String,
    /// Hex salt of the security-code key.
    pub st: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakeMessage {
    Request(KeyRequest),
    Reply(KeyReply),
}

#[async_trait]
pub trait HandshakeTransport {
    async fn send(&mut self, msg: HandshakeMessage) -> Result<(), HandshakeError>;
    async fn recv(&mut self) -> Result<HandshakeMessage, HandshakeError>;
    async fn close(&mut self) -> Result<(), HandshakeError> {
        Ok(())
    }
}

/// What the endpoint trusts about the relay.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub relay_key: VerifyingKey,
    pub verification: String,
}

/// Produces a fresh transient key set. Used for registration and for
/// encrypted uploads.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn exchange(&self) -> Result<TransientKeys, HandshakeError>;
}

/// Runs the key exchange against the relay's `/ckm` endpoint.
#[derive(Debug, Clone)]
pub struct RelayKeySource {
    url: Result<String, String>,
    relay_key: Result<VerifyingKey, String>,
    verification: String,
    timeout: Duration,
}

impl RelayKeySource {
    /// Configuration problems are reported when a key exchange is attempted,
    /// so endpoints holding a token can run without a pinned relay key.
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.endpoint("/ckm").map_err(|e| e.to_string()),
            relay_key: config.relay_key().map_err(|e| e.to_string()),
            verification: config.verification_string.clone(),
            timeout: config.handshake_timeout(),
        }
    }
}

#[async_trait]
impl KeySource for RelayKeySource {
    async fn exchange(&self) -> Result<TransientKeys, HandshakeError> {
        let relay_key = self.relay_key.clone().map_err(HandshakeError::Authentication)?;
        let url = self.url.clone().map_err(HandshakeError::Transport)?;
        let inner = tokio::time::timeout(self.timeout, WsHandshakeTransport::connect(&url))
            .await
            .map_err(|_| HandshakeError::Transport("key exchange connect timeout".into()))??;
        let mut transport = TimeoutTransport::new(inner, self.timeout);
        let handshake = KeyExchangeHandshake::new(
            P521KeyExchange::new(),
            HandshakeContext {
                relay_key,
                verification: self.verification.clone(),
            },
        );
        handshake.run(&mut transport).await
    }
}
