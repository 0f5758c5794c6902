//! AES-256-GCM sealing of credentials and payloads.
//!
//! All binary fields travel hex-encoded. Opening always fails closed: a wrong
//! key, tag or associated data yields [`CryptoError::Open`] and no plaintext.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::credentials::Credentials;
use super::{CryptoError, TransientKeys, KEY_LEN, NONCE_LEN};

pub const AAD_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Output of one AEAD operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub aad: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

pub fn seal_with_aad(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Seal)?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
        .map_err(|_| CryptoError::Seal)?;
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(Sealed {
        aad: aad.to_vec(),
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Seals with fresh random associated data.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Sealed, CryptoError> {
    let mut aad = [0u8; AAD_LEN];
    rand::thread_rng().fill_bytes(&mut aad);
    seal_with_aad(key, nonce, &aad, plaintext)
}

pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if tag.len() != TAG_LEN {
        return Err(CryptoError::Open);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Open)?;
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut buffer[..],
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::Open)?;
    Ok(buffer)
}

fn unhex(field: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(value).map_err(|e| CryptoError::Encoding(format!("{field}: {e}")))
}

#[derive(Serialize)]
struct UserCredential<'a> {
    userid: &'a str,
    userpw: &'a str,
}

#[derive(Deserialize)]
struct OpenedCredential {
    userid: String,
    userpw: String,
}

#[derive(Serialize, Deserialize)]
struct SealedCode {
    esc: String,
    stag: String,
}

/// Credential fields of a registration frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredentials {
    /// Hex ciphertext of `{"userid","userpw"}` under the payload key.
    pub euc: String,
    /// Hex associated data followed by hex tag.
    pub att: String,
    /// Hex of `{"esc","stag"}`: the security code under the code key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub esc: Option<String>,
}

pub fn seal_credentials(
    keys: &TransientKeys,
    credentials: &Credentials,
) -> Result<SealedCredentials, CryptoError> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(&UserCredential {
            userid: credentials.userid(),
            userpw: credentials.password(),
        })
        .map_err(|e| CryptoError::Encoding(e.to_string()))?,
    );
    let sealed = seal(keys.payload_key(), keys.nonce(), &plaintext)?;
    let esc = match credentials.security_code() {
        Some(code) => {
            let code_sealed = seal_with_aad(keys.code_key(), keys.nonce(), &[], code.as_bytes())?;
            let body = serde_json::to_vec(&SealedCode {
                esc: hex::encode(&code_sealed.ciphertext),
                stag: hex::encode(code_sealed.tag),
            })
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
            Some(hex::encode(body))
        }
        None => None,
    };
    Ok(SealedCredentials {
        euc: hex::encode(&sealed.ciphertext),
        att: format!("{}{}", hex::encode(&sealed.aad), hex::encode(sealed.tag)),
        esc,
    })
}

/// Relay-side inverse of [`seal_credentials`]. Returns `(userid, password)`.
pub fn open_credentials(
    keys: &TransientKeys,
    sealed: &SealedCredentials,
) -> Result<(String, Zeroizing<String>), CryptoError> {
    let att = unhex("att", &sealed.att)?;
    if att.len() != AAD_LEN + TAG_LEN {
        return Err(CryptoError::Open);
    }
    let (aad, tag) = att.split_at(AAD_LEN);
    let ciphertext = unhex("euc", &sealed.euc)?;
    let plaintext = open(keys.payload_key(), keys.nonce(), aad, &ciphertext, tag)?;
    let user: OpenedCredential =
        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Open)?;
    Ok((user.userid, Zeroizing::new(user.userpw)))
}

/// Relay-side inverse of the `esc` field.
pub fn open_security_code(keys: &TransientKeys, esc: &str) -> Result<String, CryptoError> {
    let body = unhex("esc", esc)?;
    let code: SealedCode = serde_json::from_slice(&body).map_err(|_| CryptoError::Open)?;
    decrypt_code(keys, &code.esc, &code.stag)
}

/// Decrypts a value sealed under the security-code key with no associated
/// data, such as the `edata`/`etag` pair of a security-code reset.
pub fn decrypt_code(keys: &TransientKeys, data_hex: &str, tag_hex: &str) -> Result<String, CryptoError> {
    let ciphertext = unhex("edata", data_hex)?;
    let tag = unhex("etag", tag_hex)?;
    let plaintext = open(keys.code_key(), keys.nonce(), &[], &ciphertext, &tag)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Open)
}

/// Encrypted payload fields attached to upload responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Hex associated data followed by hex ciphertext.
    pub cd: String,
    pub cl: usize,
    /// Hex tag.
    pub tg: String,
    pub tl: usize,
    /// Second salt, so the relay can locate the key set.
    pub idn: String,
}

pub fn encrypt_payload(keys: &TransientKeys, data: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    let sealed = seal(keys.payload_key(), keys.nonce(), data)?;
    let cd = format!("{}{}", hex::encode(&sealed.aad), hex::encode(&sealed.ciphertext));
    let tg = hex::encode(sealed.tag);
    Ok(EncryptedPayload {
        cl: cd.len(),
        tl: tg.len(),
        cd,
        tg,
        idn: keys.salt2().to_string(),
    })
}

pub fn decrypt_payload(
    keys: &TransientKeys,
    payload: &EncryptedPayload,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if payload.cd.len() != payload.cl || payload.tg.len() != payload.tl {
        return Err(CryptoError::Open);
    }
    let cd = unhex("cd", &payload.cd)?;
    if cd.len() < AAD_LEN {
        return Err(CryptoError::Open);
    }
    let (aad, ciphertext) = cd.split_at(AAD_LEN);
    let tag = unhex("tg", &payload.tg)?;
    open(keys.payload_key(), keys.nonce(), aad, ciphertext, &tag)
}
