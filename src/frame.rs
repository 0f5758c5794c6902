//! JSON wire frames.
//!
//! Frames are open-ended JSON objects: the relay adds fields this crate never
//! reads, and responses echo the request they answer with a few fields
//! changed. `Frame` therefore keeps the full object and offers typed accessors
//! for the fields the protocol engine inspects. Classification into a closed
//! set of routes happens once, in [`crate::router`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::session::descriptor::Role;

/// Identity of an endpoint: devices use numeric ids, clients use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointId {
    Num(u64),
    Name(String),
}

impl EndpointId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(EndpointId::Num),
            Value::String(s) if !s.is_empty() => Some(EndpointId::Name(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            EndpointId::Num(n) => Value::from(*n),
            EndpointId::Name(s) => Value::from(s.clone()),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            EndpointId::Num(n) => Some(*n),
            EndpointId::Name(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Num(n) => write!(f, "{n}"),
            EndpointId::Name(s) => f.write_str(s),
        }
    }
}

impl From<u64> for EndpointId {
    fn from(id: u64) -> Self {
        EndpointId::Num(id)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        EndpointId::Name(id.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(Map<String, Value>);

impl Frame {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Converts any serializable object into a frame.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Protocol(format!("expected object, got {other}"))),
        }
    }

    /// Parses one inbound text message. The relay sends either a single object
    /// or an array of objects; empty objects are discarded.
    pub fn parse_batch(text: &str) -> Result<Vec<Frame>> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::Protocol(format!("invalid json: {e}")))?;
        match value {
            Value::Object(map) if !map.is_empty() => Ok(vec![Frame(map)]),
            Value::Object(_) => Ok(Vec::new()),
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) if !map.is_empty() => Some(Frame(map)),
                    _ => None,
                })
                .collect()),
            other => Err(Error::Protocol(format!("unexpected frame {other}"))),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Copies every field of `other` over this frame.
    pub fn merge(&mut self, other: &Map<String, Value>) {
        for (k, v) in other {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// JavaScript-style truthiness, which is how the relay encodes flags.
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn code(&self) -> Option<u16> {
        self.u64_field("code").and_then(|c| u16::try_from(c).ok())
    }

    pub fn id(&self) -> Option<EndpointId> {
        self.0.get("id").and_then(EndpointId::from_value)
    }

    pub fn app_id(&self) -> Option<&str> {
        self.str_field("appId")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn pin(&self) -> Option<u32> {
        self.u64_field("pin").and_then(|p| u32::try_from(p).ok())
    }

    pub fn pid(&self) -> Option<&str> {
        self.str_field("_pid")
    }

    pub fn error(&self) -> Option<&str> {
        self.str_field("error")
    }

    /// Turns a request into the response sent back through the relay: the
    /// request's origin becomes the destination and this endpoint becomes the
    /// source.
    pub fn into_response(mut self, role: Role) -> Self {
        if let Some(src) = self.str_field("src") {
            if src == "client" || src == "browser" {
                let src = src.to_string();
                self.set("dst", src);
            }
        }
        self.set("src", role.as_src());
        self.set("response", true);
        self
    }
}

impl From<Map<String, Value>> for Frame {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Milliseconds since the Unix epoch, used for `tid` fields.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_object_and_array_forms() {
        let one = Frame::parse_batch(r#"{"id":100,"code":200}"#).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].code(), Some(200));

        let many = Frame::parse_batch(r#"[{"id":100,"name":"temp"},{}]"#).unwrap();
        assert_eq!(many.len(), 1);
        assert_eq!(many[0].name(), Some("temp"));
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        assert!(matches!(
            Frame::parse_batch("{not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(Frame::parse_batch("42"), Err(Error::Protocol(_))));
    }

    #[test]
    fn flags_follow_relay_truthiness() {
        let frame = Frame::from_map(
            json!({"a": true, "b": false, "c": 1, "d": "", "e": "x", "f": null})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert!(frame.flag("a"));
        assert!(!frame.flag("b"));
        assert!(frame.flag("c"));
        assert!(!frame.flag("d"));
        assert!(frame.flag("e"));
        assert!(!frame.flag("f"));
        assert!(!frame.flag("missing"));
    }

    #[test]
    fn response_swaps_direction() {
        let request = Frame::new()
            .with("src", "client")
            .with("dst", "device")
            .with("name", "temp");
        let response = request.into_response(Role::Device);
        assert_eq!(response.str_field("src"), Some("device"));
        assert_eq!(response.str_field("dst"), Some("client"));
        assert!(response.flag("response"));
    }

    #[test]
    fn endpoint_ids_accept_numbers_and_strings() {
        let frame = Frame::new().with("id", 100);
        assert_eq!(frame.id(), Some(EndpointId::Num(100)));
        let frame = Frame::new().with("id", "app-1");
        assert_eq!(frame.id(), Some(EndpointId::Name("app-1".into())));
        assert_eq!(EndpointId::Name("120".into()).as_u64(), Some(120));
    }
}
