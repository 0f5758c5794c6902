//! Registration frames sent as the first message of every main connection.

use serde::{Deserialize, Serialize};

use crate::crypto::{SealedCredentials, TransientKeys};
use crate::frame::{now_ms, Frame};
use crate::session::descriptor::SessionDescriptor;

pub const MAIN_SID: &str = "m2m";

/// Host facts reported with registration and status replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(rename = "type")]
    pub os: String,
    pub arch: String,
    pub version: String,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: super::PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn base(descriptor: &SessionDescriptor, system: &SystemInfo) -> Frame {
    let mut frame = descriptor.to_frame();
    frame
        .set("_sid", MAIN_SID)
        .set("tid", now_ms())
        .set("systemInfo", system.to_value());
    frame
}

/// First registration: sealed credentials plus the two salts the relay needs
/// to re-derive the keys.
pub fn fresh(
    descriptor: &SessionDescriptor,
    sealed: &SealedCredentials,
    keys: &TransientKeys,
    system: &SystemInfo,
) -> Frame {
    let mut frame = base(descriptor, system);
    frame
        .set("euc", sealed.euc.clone())
        .set("att", sealed.att.clone())
        .set("uid", keys.salt1())
        .set("idn", keys.salt2());
    if let Some(esc) = &sealed.esc {
        frame.set("esc", esc.clone());
    }
    frame
}

/// Reconnect with a previously issued token.
pub fn with_token(descriptor: &SessionDescriptor, system: &SystemInfo) -> Frame {
    base(descriptor, system)
}
