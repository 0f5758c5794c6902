use base64::Engine;
use ed25519_dalek::{Signature, Verifier};
use uuid::Uuid;

use super::{HandshakeContext, HandshakeError, HandshakeMessage, HandshakeTransport, KeyReply, KeyRequest};
use crate::crypto::{KeyExchange, TransientKeys};

/// Endpoint side of the key exchange.
pub struct KeyExchangeHandshake<K> {
    key_exchange: K,
    context: HandshakeContext,
}

impl<K: KeyExchange> KeyExchangeHandshake<K> {
    pub fn new(key_exchange: K, context: HandshakeContext) -> Self {
        Self {
            key_exchange,
            context,
        }
    }

    pub async fn run<T>(&self, transport: &mut T) -> Result<TransientKeys, HandshakeError>
    where
        T: HandshakeTransport + Send,
    {
        let rid = Uuid::new_v4().simple().to_string();
        let public = b64().encode(self.key_exchange.public_key());
        transport
            .send(HandshakeMessage::Request(KeyRequest::new(rid, Some(public))))
            .await?;
        let reply = match transport.recv().await? {
            HandshakeMessage::Reply(reply) => reply,
            HandshakeMessage::Request(_) => {
                return Err(HandshakeError::Protocol("expected key exchange reply".into()))
            }
        };
        if let Err(err) = transport.close().await {
            tracing::debug!(error = %err, "key exchange connection did not close cleanly");
        }

        verify_relay(&reply, &self.context)?;

        let peer = b64()
            .decode(&reply.sk)
            .map_err(|e| HandshakeError::Protocol(format!("sk: {e}")))?;
        let shared = self.key_exchange.shared_secret(&peer)?;
        Ok(TransientKeys::derive(&shared, &reply.nk, &reply.st)?)
    }
}

/// Checks the relay's identity before any of its key material is used.
pub fn verify_relay(reply: &KeyReply, context: &HandshakeContext) -> Result<(), HandshakeError> {
    let presented = b64()
        .decode(&reply.puk)
        .map_err(|_| HandshakeError::Authentication("malformed relay identity".into()))?;
    if presented.as_slice() != context.relay_key.as_bytes() {
        return Err(HandshakeError::Authentication(
            "relay identity does not match the pinned key".into(),
        ));
    }
    let signature = b64()
        .decode(&reply.bk)
        .ok()
        .and_then(|bytes| Signature::from_slice(&bytes).ok())
        .ok_or_else(|| HandshakeError::Authentication("malformed relay signature".into()))?;
    context
        .relay_key
        .verify(context.verification.as_bytes(), &signature)
        .map_err(|_| HandshakeError::Authentication("relay signature verification failed".into()))
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}
