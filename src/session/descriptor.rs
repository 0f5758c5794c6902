//! Session identity and its persisted token.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::frame::{EndpointId, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Device,
    Client,
}

impl Role {
    /// Value of the `src` field on frames this endpoint sends.
    pub fn as_src(&self) -> &'static str {
        match self {
            Role::Device => "device",
            Role::Client => "client",
        }
    }

    /// `_pid` of the periodic renewal frame.
    pub fn renew_pid(&self) -> &'static str {
        match self {
            Role::Device => "device-renew-ws",
            Role::Client => "client-renew-ws",
        }
    }
}

/// The process's identity and registration token.
///
/// Serialized with exactly one of the `device`/`app` flags set; a blob with
/// both or neither is rejected on load. Fields issued by the relay that this
/// crate does not interpret are kept in `extra` and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDescriptor", into = "RawDescriptor")]
pub struct SessionDescriptor {
    pub role: Role,
    pub id: EndpointId,
    pub app_id: Option<String>,
    pub uid: Option<String>,
    pub aid: Option<String>,
    pub ak: Option<String>,
    pub options: Option<Value>,
    pub restartable: bool,
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    #[serde(default, skip_serializing_if = "is_false")]
    device: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    app: bool,
    id: EndpointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ak: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    restartable: bool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TryFrom<RawDescriptor> for SessionDescriptor {
    type Error = String;

    fn try_from(raw: RawDescriptor) -> std::result::Result<Self, Self::Error> {
        let role = match (raw.device, raw.app) {
            (true, false) => Role::Device,
            (false, true) => Role::Client,
            _ => return Err("descriptor must carry exactly one of device/app".into()),
        };
        Ok(Self {
            role,
            id: raw.id,
            app_id: raw.app_id,
            uid: raw.uid,
            aid: raw.aid,
            ak: raw.ak,
            options: raw.options,
            restartable: raw.restartable,
            extra: raw.extra,
        })
    }
}

impl From<SessionDescriptor> for RawDescriptor {
    fn from(d: SessionDescriptor) -> Self {
        Self {
            device: d.role == Role::Device,
            app: d.role == Role::Client,
            id: d.id,
            app_id: d.app_id,
            uid: d.uid,
            aid: d.aid,
            ak: d.ak,
            options: d.options,
            restartable: d.restartable,
            extra: d.extra,
        }
    }
}

/// Reply fields that describe the reply itself rather than the session.
const TRANSIENT_FIELDS: &[&str] = &[
    "code", "reason", "path", "data", "appData", "error", "src", "dst", "response", "_pid",
    "_sid", "tid", "euc", "att", "esc", "systemInfo",
];

impl SessionDescriptor {
    pub fn device(id: u64) -> Self {
        Self::unregistered(Role::Device, EndpointId::Num(id), None)
    }

    pub fn client(app_id: impl Into<String>) -> Self {
        let app_id = app_id.into();
        Self::unregistered(Role::Client, EndpointId::Name(app_id.clone()), Some(app_id))
    }

    fn unregistered(role: Role, id: EndpointId, app_id: Option<String>) -> Self {
        Self {
            role,
            id,
            app_id,
            uid: None,
            aid: None,
            ak: None,
            options: None,
            restartable: false,
            extra: Map::new(),
        }
    }

    /// True once the relay has issued a token.
    pub fn has_token(&self) -> bool {
        self.aid.is_some() && self.ak.is_some()
    }

    /// Whether this (stored) descriptor may be reused for `expected`: same
    /// role and same device id or client app id.
    pub fn matches_identity(&self, expected: &SessionDescriptor) -> bool {
        self.role == expected.role
            && match self.role {
                Role::Device => self.id == expected.id,
                Role::Client => self.app_id == expected.app_id,
            }
    }

    /// The value clients and the relay use to address this endpoint's frames.
    pub fn owner_key(&self) -> String {
        match self.role {
            Role::Device => self.id.to_string(),
            Role::Client => self.app_id.clone().unwrap_or_else(|| self.id.to_string()),
        }
    }

    /// Builds the descriptor carried by a registration reply (codes 100-110).
    /// The relay's reply replaces the descriptor wholesale; only the role and
    /// restart flag are retained from `current` when the reply omits them.
    pub fn from_reply(reply: &Frame, current: &SessionDescriptor) -> Result<Self> {
        let mut map = reply.as_map().clone();
        for field in TRANSIENT_FIELDS {
            map.remove(*field);
        }
        if !map.contains_key("device") && !map.contains_key("app") {
            let flag = if current.role == Role::Device { "device" } else { "app" };
            map.insert(flag.into(), Value::Bool(true));
        }
        if !map.contains_key("id") {
            map.insert("id".into(), current.id.to_value());
        }
        if current.restartable {
            map.insert("restartable".into(), Value::Bool(true));
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::Protocol(format!("registration reply: {e}")))
    }

    /// Descriptor fields as a frame, the base of every outbound frame.
    pub fn to_frame(&self) -> Frame {
        Frame::from_serialize(self).unwrap_or_default()
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn decode(blob: &str) -> Result<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(blob.trim())
            .map_err(|e| Error::Protocol(format!("token: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| Error::Protocol(format!("token: {e}")))
    }
}

/// Base64-JSON token file.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the file is missing or unreadable as a token.
    pub async fn load(&self) -> Result<Option<SessionDescriptor>> {
        let blob = match tokio::fs::read_to_string(&self.path).await {
            Ok(blob) => blob,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match SessionDescriptor::decode(&blob) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "discarding unreadable token");
                Ok(None)
            }
        }
    }

    /// Replaces the stored token.
    pub async fn save(&self, descriptor: &SessionDescriptor) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, descriptor.encode()?).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
