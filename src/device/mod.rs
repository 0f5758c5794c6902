//! Device endpoint: serves channels and GPIO pins to remote clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::admin;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::eventlog::{EventLog, FileEventLog};
use crate::frame::Frame;
use crate::handshake::{KeySource, RelayKeySource};
use crate::router::{self, DeviceRoute, ResourceOp};
use crate::session::{Endpoint, Session, SessionContext, SessionDescriptor, SessionState};

pub mod channel;
pub mod gpio;
pub mod watch;

pub use channel::{ChannelMethod, ChannelRegistry, ChannelRequest, ChannelSource};
pub use gpio::{GpioDriver, SimulatedGpio};
pub use watch::{Resource, Sampler, TickOutcome, WatchEngine, WatchKey, WatchOutcome};

/// Reads channels through the registry and pins through the driver.
struct DeviceSampler {
    channels: ChannelRegistry,
    gpio: Arc<dyn GpioDriver>,
}

impl Sampler for DeviceSampler {
    fn sample(&self, resource: &Resource) -> Result<Value> {
        match resource {
            Resource::Channel(name) => self.channels.sample(name),
            Resource::Input(pin) => self.gpio.read_input(*pin).map(Value::Bool),
            Resource::Output(pin) => self.gpio.read_output(*pin).map(Value::Bool),
        }
    }
}

pub struct DeviceBuilder {
    id: u64,
    config: Config,
    gpio: Option<Arc<dyn GpioDriver>>,
    event_log: Option<Arc<dyn EventLog>>,
    key_source: Option<Arc<dyn KeySource>>,
}

impl DeviceBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn gpio(mut self, driver: Arc<dyn GpioDriver>) -> Self {
        self.gpio = Some(driver);
        self
    }

    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Replaces the relay key exchange, mainly for tests.
    pub fn key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    pub fn build(self) -> Result<Device> {
        if self.id == 0 {
            return Err(Error::Validation("device id must be a positive integer".into()));
        }
        let mut descriptor = SessionDescriptor::device(self.id);
        descriptor.restartable = self.config.restartable;
        let log = self
            .event_log
            .unwrap_or_else(|| Arc::new(FileEventLog::new(self.config.log_path.clone())));
        let key_source = self
            .key_source
            .unwrap_or_else(|| Arc::new(RelayKeySource::from_config(&self.config)));
        let ctx = SessionContext::with_key_source(self.config, descriptor, log, key_source);

        let gpio = self
            .gpio
            .unwrap_or_else(|| Arc::new(SimulatedGpio::new([], [])));
        let channels = ChannelRegistry::new();
        let sampler = Arc::new(DeviceSampler {
            channels: channels.clone(),
            gpio: gpio.clone(),
        });
        let watches = WatchEngine::new(sampler, ctx.bus().clone());
        Ok(Device {
            inner: Arc::new(DeviceInner {
                ctx,
                channels,
                gpio,
                watches,
            }),
        })
    }
}

struct DeviceInner {
    ctx: SessionContext,
    channels: ChannelRegistry,
    gpio: Arc<dyn GpioDriver>,
    watches: WatchEngine,
}

/// A device process. Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("ctx", &self.inner.ctx)
            .field("channels", &self.inner.channels)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn builder(id: u64) -> DeviceBuilder {
        DeviceBuilder {
            id,
            config: Config::default(),
            gpio: None,
            event_log: None,
            key_source: None,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.ctx
    }

    /// Exposes a named data channel.
    pub fn set_channel_data(&self, name: impl Into<String>, source: impl ChannelSource + 'static) -> Result<()> {
        self.inner.channels.register(name, source)
    }

    /// Exposes an HTTP-style channel answering `get` and `post`.
    pub fn set_api(&self, name: impl Into<String>, source: impl ChannelSource + 'static) -> Result<()> {
        self.inner.channels.register_api(name, source)
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    pub fn gpio(&self) -> &Arc<dyn GpioDriver> {
        &self.inner.gpio
    }

    pub fn watches(&self) -> &WatchEngine {
        &self.inner.watches
    }

    /// The relay session serving this device.
    pub fn session(&self) -> Session<Device> {
        Session::new(self.inner.ctx.clone(), self.clone())
    }

    fn default_interval(&self) -> Duration {
        self.inner.ctx.config().watch_interval()
    }

    fn handle_channel(&self, ctx: &SessionContext, frame: Frame, name: Option<String>, op: ResourceOp) {
        let Some(name) = name else {
            ctx.send(error_response(ctx, frame, "invalid channel"));
            return;
        };
        let resource = Resource::Channel(name.clone());
        match op {
            ResourceOp::Watch => self.start_watch(ctx, frame, resource),
            ResourceOp::Unwatch => self.stop_watch(ctx, frame, resource),
            ResourceOp::Get => {
                let request = ChannelRequest::from_frame(&name, &frame);
                let mut response = frame.into_response(ctx.role());
                match self.inner.channels.respond(&request) {
                    Ok(value) => {
                        response.set("result", value);
                    }
                    Err(err) => {
                        response.set("error", err.to_string());
                    }
                }
                ctx.send(response);
            }
        }
    }

    fn handle_input(&self, ctx: &SessionContext, frame: Frame, pin: Option<u32>, op: ResourceOp) {
        let Some(pin) = pin else {
            ctx.send(error_response(ctx, frame, "invalid pin"));
            return;
        };
        match op {
            ResourceOp::Watch => self.start_watch(ctx, frame, Resource::Input(pin)),
            ResourceOp::Unwatch => self.stop_watch(ctx, frame, Resource::Input(pin)),
            ResourceOp::Get => {
                let state = self.inner.gpio.read_input(pin);
                ctx.send(state_response(ctx, frame, state));
            }
        }
    }

    fn handle_output(&self, ctx: &SessionContext, frame: Frame, pin: Option<u32>, op: ResourceOp) {
        let Some(pin) = pin else {
            ctx.send(error_response(ctx, frame, "invalid pin"));
            return;
        };
        match op {
            ResourceOp::Watch => self.start_watch(ctx, frame, Resource::Output(pin)),
            ResourceOp::Unwatch => self.stop_watch(ctx, frame, Resource::Output(pin)),
            ResourceOp::Get => {
                let gpio = &self.inner.gpio;
                let state = match frame.str_field("output") {
                    Some("on") => gpio.write_output(pin, true),
                    Some("off") => gpio.write_output(pin, false),
                    _ if frame.flag("on") => gpio.write_output(pin, true),
                    _ if frame.flag("off") => gpio.write_output(pin, false),
                    _ => gpio.read_output(pin),
                };
                ctx.send(state_response(ctx, frame, state));
            }
        }
    }

    fn start_watch(&self, ctx: &SessionContext, frame: Frame, resource: Resource) {
        let owner = router::owner_of(&frame).unwrap_or_default();
        let interval = frame
            .u64_field("interval")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.default_interval());
        let label = resource.label();
        let key = WatchKey::new(owner.clone(), resource);
        match self.inner.watches.watch(key, frame.clone(), interval) {
            Ok(WatchOutcome::Registered) => {
                tracing::info!(owner = %owner, resource = %label, interval_ms = interval.as_millis() as u64, "watch started");
                ctx.log().record("remote client", "start watch event", &[owner.as_str(), label.as_str()]);
            }
            Ok(WatchOutcome::Duplicate) => {}
            Err(err) => {
                ctx.send(error_response(ctx, frame, &err.to_string()));
            }
        }
    }

    fn stop_watch(&self, ctx: &SessionContext, frame: Frame, resource: Resource) {
        let owner = router::owner_of(&frame).unwrap_or_default();
        let label = resource.label();
        let removed = self.inner.watches.unwatch(&WatchKey::new(owner.clone(), resource));
        if removed {
            ctx.log().record("remote client", "unwatch/stop event", &[owner.as_str(), label.as_str()]);
        }
        let mut response = frame.into_response(ctx.role());
        response.set("unwatch", removed);
        ctx.send(response);
    }

    fn setup_data(&self, ctx: &SessionContext, frame: Frame) {
        let gpio = &self.inner.gpio;
        let setup = json!({
            "id": ctx.descriptor().id.to_value(),
            "systemInfo": ctx.system_info().to_value(),
            "gpio": {
                "type": gpio.kind(),
                "input": { "pin": gpio.input_pins() },
                "output": { "pin": gpio.output_pins() },
            },
            "channel": { "name": self.inner.channels.names() },
            "watchChannel": { "name": self.inner.watches.watched_channels() },
        });
        let mut response = frame.into_response(ctx.role());
        response.set("setupData", setup);
        ctx.send(response);
    }

    fn status(&self, ctx: &SessionContext, frame: Frame) {
        let descriptor = ctx.descriptor();
        let mut response = frame.into_response(ctx.role());
        response
            .set("active", ctx.state().is_registered())
            .set("systemInfo", ctx.system_info().to_value())
            .set("options", descriptor.options.clone().unwrap_or(Value::Null))
            .set("restartable", ctx.config().restartable || descriptor.restartable)
            .set("enable", self.inner.watches.is_enabled());
        ctx.send(response);
    }

    fn enable(&self, ctx: &SessionContext, frame: Frame, enable: bool) {
        let next = if enable {
            self.inner.watches.resume();
            SessionState::Active
        } else {
            self.inner.watches.suspend();
            SessionState::Suspended
        };
        if let Err(err) = ctx.transition(next) {
            tracing::debug!(error = %err, "enable request outside a registered session");
        }
        ctx.log().record("remote", if enable { "enabled" } else { "disabled" }, &[]);
        let mut response = frame.into_response(ctx.role());
        response.set("enable", enable).set("result", "success");
        ctx.send(response);
    }
}

fn error_response(ctx: &SessionContext, frame: Frame, error: &str) -> Frame {
    let mut response = frame.into_response(ctx.role());
    response.set("error", error);
    response
}

fn state_response(ctx: &SessionContext, frame: Frame, state: Result<bool>) -> Frame {
    let mut response = frame.into_response(ctx.role());
    match state {
        Ok(state) => response.set("state", state),
        Err(err) => response.set("error", err.to_string()),
    };
    response
}

#[async_trait]
impl Endpoint for Device {
    async fn handle(&self, ctx: &SessionContext, frame: Frame) -> Result<()> {
        let own_id = ctx.descriptor().id;
        let Some(route) = router::route_device(&frame, &own_id) else {
            return Ok(());
        };
        match route {
            DeviceRoute::PeerExit { owner } => {
                let removed = self.inner.watches.drop_owner(&owner);
                tracing::info!(owner = %owner, removed, "client off-line");
                ctx.log().record("remote client", "exit stop event", &[owner.as_str()]);
            }
            DeviceRoute::Channel { name, op } => self.handle_channel(ctx, frame, name, op),
            DeviceRoute::Input { pin, op } => self.handle_input(ctx, frame, pin, op),
            DeviceRoute::Output { pin, op } => self.handle_output(ctx, frame, pin, op),
            DeviceRoute::SetupData => self.setup_data(ctx, frame),
            DeviceRoute::Status => self.status(ctx, frame),
            DeviceRoute::Admin(op) => {
                let response = admin::handle(ctx, op, frame).await;
                ctx.send(response);
            }
            DeviceRoute::Enable(enable) => self.enable(ctx, frame, enable),
        }
        Ok(())
    }

    async fn on_active(&self, ctx: &SessionContext, code: u16) -> Result<()> {
        self.inner.watches.set_online(true);
        tracing::info!(device_id = %ctx.descriptor().id, code, watches = self.inner.watches.len(), "device active");
        Ok(())
    }

    async fn on_disconnect(&self, _ctx: &SessionContext) {
        self.inner.watches.set_online(false);
    }

    async fn on_shutdown(&self, ctx: &SessionContext) {
        self.inner.watches.clear();
        self.inner.gpio.close();
        ctx.log().record("process", "exit", &[ctx.descriptor().id.to_string().as_str()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::eventlog::NullEventLog;

    fn device() -> Device {
        let gpio = Arc::new(SimulatedGpio::new([11], [33]));
        gpio.set_input(11, true).unwrap();
        let device = Device::builder(100)
            .gpio(gpio)
            .event_log(Arc::new(NullEventLog))
            .build()
            .unwrap();
        device
            .set_channel_data("temp", |_: &ChannelRequest| -> Result<Value> { Ok(json!(21.5)) })
            .unwrap();
        device
    }

    fn request(value: Value) -> Frame {
        Frame::from_map(value.as_object().cloned().unwrap())
    }

    #[test]
    fn id_must_be_positive() {
        assert!(matches!(Device::builder(0).build(), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn get_watch_and_unwatch_channel() {
        let device = device();
        let ctx = device.context().clone();
        let mut out = ctx.bus().subscribe(Topic::Outbound);

        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","name":"temp","src":"client"})))
            .await
            .unwrap();
        let reply = out.try_recv().unwrap();
        assert_eq!(reply.get("result"), Some(&json!(21.5)));

        let watch = json!({"id":100,"appId":"c1","name":"temp","event":true,"watch":true,"interval":2000});
        device.handle(&ctx, request(watch.clone())).await.unwrap();
        device.handle(&ctx, request(watch)).await.unwrap();
        assert_eq!(device.watches().len(), 1);
        assert!(out.try_recv().is_some());
        assert!(out.try_recv().is_none());

        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","name":"temp","event":false,"unwatch":true})))
            .await
            .unwrap();
        assert_eq!(out.try_recv().unwrap().get("unwatch"), Some(&json!(true)));
        assert!(device.watches().is_empty());

        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","name":"temp","event":false,"unwatch":true})))
            .await
            .unwrap();
        assert_eq!(out.try_recv().unwrap().get("unwatch"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn resource_errors_are_reported_in_the_reply() {
        let device = device();
        let ctx = device.context().clone();
        let mut out = ctx.bus().subscribe(Topic::Outbound);
        let cases = [
            (json!({"id":100,"appId":"c1","name":"humidity"}), "invalid channel"),
            (json!({"id":100,"appId":"c1","gpioInput":true,"input":true,"pin":7}), "invalid input"),
            (json!({"id":100,"appId":"c1","gpioOutput":true,"output":"on","pin":7}), "invalid output"),
            (json!({"id":100,"appId":"c1","gpioInput":true,"input":true}), "invalid pin"),
        ];
        for (frame, error) in cases {
            device.handle(&ctx, request(frame)).await.unwrap();
            assert_eq!(out.try_recv().unwrap().error(), Some(error));
        }
    }

    #[tokio::test]
    async fn gpio_requests_read_and_drive_pins() {
        let device = device();
        let ctx = device.context().clone();
        let mut out = ctx.bus().subscribe(Topic::Outbound);
        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","gpioInput":true,"input":true,"pin":11,"getState":true})))
            .await
            .unwrap();
        assert_eq!(out.try_recv().unwrap().get("state"), Some(&json!(true)));

        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","gpioOutput":true,"output":"on","on":true,"pin":33})))
            .await
            .unwrap();
        assert_eq!(out.try_recv().unwrap().get("state"), Some(&json!(true)));
        assert!(device.gpio().read_output(33).unwrap());

        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","gpioOutput":true,"output":"state","pin":33})))
            .await
            .unwrap();
        assert_eq!(out.try_recv().unwrap().get("state"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn peer_exit_drops_only_that_owner() {
        let device = device();
        let ctx = device.context().clone();
        for owner in ["c1", "c2"] {
            device
                .handle(&ctx, request(json!({"id":100,"appId":owner,"name":"temp","event":true,"watch":true})))
                .await
                .unwrap();
            device
                .handle(&ctx, request(json!({"id":100,"appId":owner,"gpioInput":true,"input":true,"pin":11,"event":true,"watch":true})))
                .await
                .unwrap();
        }
        assert_eq!(device.watches().len(), 4);
        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","exit":true})))
            .await
            .unwrap();
        assert_eq!(device.watches().len(), 2);
        assert!(device.watches().contains(&WatchKey::new("c2", Resource::Channel("temp".into()))));
        assert!(device.watches().contains(&WatchKey::new("c2", Resource::Input(11))));
    }

    #[tokio::test]
    async fn setup_and_status_describe_the_device() {
        let device = device();
        let ctx = device.context().clone();
        let mut out = ctx.bus().subscribe(Topic::Outbound);
        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","setupData":true,"_pid":"setupData"})))
            .await
            .unwrap();
        let setup = out.try_recv().unwrap();
        let data = setup.get("setupData").unwrap();
        assert_eq!(data["gpio"]["input"]["pin"], json!([11]));
        assert_eq!(data["channel"]["name"], json!(["temp"]));
        assert_eq!(data["id"], json!(100));

        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","enable":false})))
            .await
            .unwrap();
        assert!(!device.watches().is_enabled());
        out.try_recv().unwrap();

        device
            .handle(&ctx, request(json!({"id":100,"appId":"c1","status":true})))
            .await
            .unwrap();
        let status = out.try_recv().unwrap();
        assert_eq!(status.get("enable"), Some(&json!(false)));
        assert_eq!(status.get("active"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn frames_for_other_devices_are_ignored() {
        let device = device();
        let ctx = device.context().clone();
        let mut out = ctx.bus().subscribe(Topic::Outbound);
        device
            .handle(&ctx, request(json!({"id":200,"appId":"c1","name":"temp"})))
            .await
            .unwrap();
        assert!(out.try_recv().is_none());
    }
}
