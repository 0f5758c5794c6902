//! Stateless handles on remote device resources.

use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::frame::{EndpointId, Frame};

use super::{Client, Reading, WatchStream};

const DEFAULT_WATCH_INTERVAL_MS: u64 = 5_000;

/// Options of a watch request.
///
/// Accepts a bare interval in milliseconds or an object whose `interval`
/// (alias `poll`) sets it; both normalise to the same request shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_WATCH_INTERVAL_MS),
        }
    }
}

impl From<u64> for WatchOptions {
    fn from(ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(ms),
        }
    }
}

impl From<Duration> for WatchOptions {
    fn from(interval: Duration) -> Self {
        Self { interval }
    }
}

impl TryFrom<&Value> for WatchOptions {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(Self::from)
                .ok_or_else(|| Error::Validation("interval must be a positive integer".into())),
            Value::Object(map) => {
                let interval = map.get("interval").or_else(|| map.get("poll"));
                match interval {
                    None => Ok(Self::default()),
                    Some(v) => v
                        .as_u64()
                        .map(Self::from)
                        .ok_or_else(|| Error::Validation("interval must be a positive integer".into())),
                }
            }
            _ => Err(Error::Validation("watch options must be a number or an object".into())),
        }
    }
}

impl WatchOptions {
    fn interval_ms(&self) -> Result<u64> {
        match self.interval.as_millis() {
            0 => Err(Error::Validation("interval must be a positive integer".into())),
            ms => Ok(ms as u64),
        }
    }
}

/// One device as seen by a client. Constructing it performs no I/O.
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    client: Client,
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioMode {
    Input,
    Output,
}

impl std::str::FromStr for GpioMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "input" | "in" => Ok(GpioMode::Input),
            "output" | "out" => Ok(GpioMode::Output),
            other => Err(Error::Validation(format!("invalid gpio mode {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum GpioHandle {
    Input(Input),
    Output(Output),
}

impl RemoteDevice {
    pub(crate) fn new(client: Client, id: u64) -> Self {
        Self { client, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self, name: impl Into<String>) -> Channel {
        Channel {
            client: self.client.clone(),
            device: self.id,
            name: name.into(),
        }
    }

    /// HTTP-style channel; use [`Channel::get`] and [`Channel::post`].
    pub fn api(&self, path: impl Into<String>) -> Channel {
        self.channel(path)
    }

    pub fn input(&self, pin: u32) -> Input {
        Input {
            client: self.client.clone(),
            device: self.id,
            pin,
        }
    }

    pub fn output(&self, pin: u32) -> Output {
        Output {
            client: self.client.clone(),
            device: self.id,
            pin,
        }
    }

    pub fn gpio(&self, pin: u32, mode: GpioMode) -> GpioHandle {
        match mode {
            GpioMode::Input => GpioHandle::Input(self.input(pin)),
            GpioMode::Output => GpioHandle::Output(self.output(pin)),
        }
    }

    /// Resource inventory and system information of the device.
    pub async fn setup_info(&self) -> Result<Value> {
        let mut request = self.client.device_request(self.id, "setupData");
        request.set("setupData", true);
        let reply = self
            .client
            .call(Some(&EndpointId::Num(self.id)), request)
            .await?;
        Ok(reply.get("setupData").cloned().unwrap_or(Value::Null))
    }

    pub async fn get_data(&self, name: &str) -> Result<Value> {
        self.channel(name).get_data().await
    }

    pub async fn watch(&self, name: &str, options: impl Into<WatchOptions>) -> Result<WatchStream> {
        self.channel(name).watch(options).await
    }

    pub async fn unwatch(&self, name: &str) -> Result<bool> {
        self.channel(name).unwatch().await
    }
}

/// A named data channel on a remote device.
///
/// One-shot calls on the same channel share a reply key, so concurrent
/// calls from clones of one handle are sent one after another.
#[derive(Debug, Clone)]
pub struct Channel {
    client: Client,
    device: u64,
    name: String,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn request(&self) -> Frame {
        let mut frame = self.client.device_request(self.device, "channel-data");
        frame
            .set("name", self.name.clone())
            .set("channel", true)
            .set("event", false)
            .set("watch", false);
        frame
    }

    async fn call(&self, request: Frame) -> Result<Value> {
        let reply = self
            .client
            .call(Some(&EndpointId::Num(self.device)), request)
            .await?;
        Ok(Reading::Channel.extract(&reply))
    }

    pub async fn get_data(&self) -> Result<Value> {
        let mut request = self.request();
        request.set("getData", true).set("rcvd", true);
        self.call(request).await
    }

    /// Pushes `payload` to the device's channel handler.
    pub async fn send_data(&self, payload: impl Into<Value>) -> Result<Value> {
        let payload = payload.into();
        if !matches!(payload, Value::String(_) | Value::Number(_) | Value::Object(_)) {
            return Err(Error::Validation("payload must be a string, number or object".into()));
        }
        let mut request = self.request();
        request.set("sendData", true).set("payload", payload);
        self.call(request).await
    }

    pub async fn get(&self) -> Result<Value> {
        let mut request = self.request();
        request.set("get", true).set("api", self.name.clone());
        self.call(request).await
    }

    pub async fn post(&self, body: impl Into<Value>) -> Result<Value> {
        let body = body.into();
        if !matches!(body, Value::String(_) | Value::Object(_)) {
            return Err(Error::Validation("body must be a string or object".into()));
        }
        let mut request = self.request();
        request
            .set("post", true)
            .set("body", body)
            .set("api", self.name.clone());
        self.call(request).await
    }

    pub async fn watch(&self, options: impl Into<WatchOptions>) -> Result<WatchStream> {
        let interval = options.into().interval_ms()?;
        let mut request = self.request();
        request
            .set("event", true)
            .set("watch", true)
            .set("interval", interval);
        self.client
            .watch(&EndpointId::Num(self.device), request, Reading::Channel)
            .await
    }

    /// Returns whether the device was watching the channel for this client.
    pub async fn unwatch(&self) -> Result<bool> {
        let mut request = self.request();
        request.remove("watch");
        request.set("unwatch", true);
        self.client
            .unwatch(&EndpointId::Num(self.device), request)
            .await
    }
}

/// An input pin on a remote device.
#[derive(Debug, Clone)]
pub struct Input {
    client: Client,
    device: u64,
    pin: u32,
}

impl Input {
    pub fn pin(&self) -> u32 {
        self.pin
    }

    fn request(&self, pid: &str) -> Frame {
        let mut frame = self.client.device_request(self.device, pid);
        frame
            .set("pin", self.pin)
            .set("input", true)
            .set("gpioInput", true);
        frame
    }

    pub async fn state(&self) -> Result<bool> {
        let mut request = self.request("gpio-input-state");
        request
            .set("event", false)
            .set("getState", true)
            .set("watch", false);
        let reply = self
            .client
            .call(Some(&EndpointId::Num(self.device)), request)
            .await?;
        state_of(&reply)
    }

    pub async fn watch(&self, options: impl Into<WatchOptions>) -> Result<WatchStream> {
        let interval = options.into().interval_ms()?;
        let mut request = self.request("gpio-input");
        request
            .set("event", true)
            .set("watch", true)
            .set("interval", interval);
        self.client
            .watch(&EndpointId::Num(self.device), request, Reading::State)
            .await
    }

    pub async fn unwatch(&self) -> Result<bool> {
        let mut request = self.request("gpio-input");
        request.set("event", false).set("unwatch", true);
        self.client
            .unwatch(&EndpointId::Num(self.device), request)
            .await
    }
}

/// An output pin on a remote device.
#[derive(Debug, Clone)]
pub struct Output {
    client: Client,
    device: u64,
    pin: u32,
}

impl Output {
    pub fn pin(&self) -> u32 {
        self.pin
    }

    fn request(&self, pid: &str, output: &str) -> Frame {
        let mut frame = self.client.device_request(self.device, pid);
        frame
            .set("pin", self.pin)
            .set("output", output)
            .set("gpioOutput", true)
            .set("event", false)
            .set("watch", false);
        frame
    }

    async fn call(&self, request: Frame, delay: Option<Duration>) -> Result<bool> {
        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .client
            .call(Some(&EndpointId::Num(self.device)), request)
            .await?;
        state_of(&reply)
    }

    pub async fn state(&self) -> Result<bool> {
        let mut request = self.request("gpio-output-state", "state");
        request.set("state", Value::Null);
        self.call(request, None).await
    }

    /// Drives the pin high, optionally after `delay`.
    pub async fn on(&self, delay: Option<Duration>) -> Result<bool> {
        let mut request = self.request("gpio-output-on", "on");
        request.set("on", true);
        self.call(request, delay).await
    }

    /// Drives the pin low, optionally after `delay`.
    pub async fn off(&self, delay: Option<Duration>) -> Result<bool> {
        let mut request = self.request("gpio-output-off", "off");
        request.set("off", true);
        self.call(request, delay).await
    }
}

fn state_of(reply: &Frame) -> Result<bool> {
    reply
        .get("state")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::Protocol("reply without pin state".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn watch_options_accept_number_and_object_forms() {
        assert_eq!(WatchOptions::from(2_000).interval, Duration::from_millis(2_000));
        let numeric = WatchOptions::try_from(&json!(2000)).unwrap();
        let object = WatchOptions::try_from(&json!({"interval": 2000})).unwrap();
        let poll = WatchOptions::try_from(&json!({"poll": 2000})).unwrap();
        assert_eq!(numeric, object);
        assert_eq!(object, poll);
        assert_eq!(WatchOptions::try_from(&json!({})).unwrap(), WatchOptions::default());
        assert!(WatchOptions::try_from(&json!("fast")).is_err());
        assert!(WatchOptions::from(0).interval_ms().is_err());
    }

    #[test]
    fn gpio_modes_parse() {
        assert_eq!("in".parse::<GpioMode>().unwrap(), GpioMode::Input);
        assert_eq!("output".parse::<GpioMode>().unwrap(), GpioMode::Output);
        assert!("both".parse::<GpioMode>().is_err());
    }

    #[test]
    fn input_watch_and_unwatch_share_the_watch_key() {
        let client = Client::builder()
            .app_id("c1")
            .event_log(std::sync::Arc::new(crate::eventlog::NullEventLog))
            .build()
            .unwrap();
        let input = client.access_device(100).unwrap().input(11);
        let mut watch = input.request("gpio-input");
        watch.set("event", true).set("watch", true);
        let mut unwatch = input.request("gpio-input");
        unwatch.set("event", false).set("unwatch", true);
        let watch_key = crate::router::CorrelationKey::from_frame(&watch).unwrap();
        let unwatch_key = crate::router::CorrelationKey::from_frame(&unwatch).unwrap();
        assert_eq!(unwatch_key.watch_counterpart(), watch_key);
        assert_eq!(watch.str_field("dst"), Some("device"));
        assert_eq!(watch.str_field("src"), Some("client"));
    }
}
