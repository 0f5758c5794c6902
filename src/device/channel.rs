//! Application data channels exposed by a device.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// What the remote side asked a channel for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMethod {
    /// Plain read, including every watch sample.
    Read,
    /// `getData`: read and acknowledge receipt.
    GetData,
    /// `sendData`: the request carries a `payload`.
    SendData,
    /// HTTP-style `get` on an api channel.
    Get,
    /// HTTP-style `post` on an api channel; the request carries a `body`.
    Post,
}

impl ChannelMethod {
    pub fn of(frame: &Frame) -> Self {
        if frame.flag("sendData") {
            ChannelMethod::SendData
        } else if frame.flag("getData") {
            ChannelMethod::GetData
        } else if frame.flag("post") {
            ChannelMethod::Post
        } else if frame.flag("get") {
            ChannelMethod::Get
        } else {
            ChannelMethod::Read
        }
    }

    fn is_api(&self) -> bool {
        matches!(self, ChannelMethod::Get | ChannelMethod::Post)
    }
}

/// One invocation of a channel handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub name: String,
    pub method: ChannelMethod,
    /// `payload` of a `sendData` or `body` of a `post`.
    pub data: Option<Value>,
    /// Owner of the request, when known.
    pub app_id: Option<String>,
}

impl ChannelRequest {
    pub fn read(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: ChannelMethod::Read,
            data: None,
            app_id: None,
        }
    }

    pub fn from_frame(name: &str, frame: &Frame) -> Self {
        let method = ChannelMethod::of(frame);
        let data = match method {
            ChannelMethod::SendData => frame.get("payload").cloned(),
            ChannelMethod::Post => frame.get("body").cloned(),
            _ => None,
        };
        Self {
            name: name.to_string(),
            method,
            data,
            app_id: frame.app_id().map(str::to_string),
        }
    }
}

/// Produces the value of a channel.
pub trait ChannelSource: Send + Sync {
    fn respond(&self, request: &ChannelRequest) -> Result<Value>;
}

impl<F> ChannelSource for F
where
    F: Fn(&ChannelRequest) -> Result<Value> + Send + Sync,
{
    fn respond(&self, request: &ChannelRequest) -> Result<Value> {
        self(request)
    }
}

#[derive(Clone)]
struct Entry {
    source: Arc<dyn ChannelSource>,
    api: bool,
}

/// Named channels of one device.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a data channel.
    pub fn register(&self, name: impl Into<String>, source: impl ChannelSource + 'static) -> Result<()> {
        self.insert(name.into(), Arc::new(source), false)
    }

    /// Registers an HTTP-style channel that answers `get` and `post`.
    pub fn register_api(&self, name: impl Into<String>, source: impl ChannelSource + 'static) -> Result<()> {
        self.insert(name.into(), Arc::new(source), true)
    }

    fn insert(&self, name: String, source: Arc<dyn ChannelSource>, api: bool) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Validation("channel name must not be empty".into()));
        }
        self.entries.write().insert(name, Entry { source, api });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Invokes the channel's handler.
    pub fn respond(&self, request: &ChannelRequest) -> Result<Value> {
        let entry = self.entries.read().get(&request.name).cloned();
        match entry {
            Some(entry) if request.method.is_api() && !entry.api => {
                Err(Error::Resource("invalid api".into()))
            }
            Some(entry) => entry.source.respond(request),
            None if request.method.is_api() => Err(Error::Resource("invalid api".into())),
            None => Err(Error::Resource("invalid channel".into())),
        }
    }

    pub fn sample(&self, name: &str) -> Result<Value> {
        self.respond(&ChannelRequest::read(name))
    }
}
