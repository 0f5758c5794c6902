//! Client endpoint: remote access to device channels and pins.
//!
//! Requests are correlated with replies through [`CorrelationKey`]s computed
//! from the request itself; the device echoes every field the key is built
//! from, so the reply lands on the subscription opened before sending.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::admin;
use crate::bus::{Subscription, Topic};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::eventlog::{EventLog, FileEventLog};
use crate::frame::{EndpointId, Frame};
use crate::handshake::{KeySource, RelayKeySource};
use crate::router::{self, ClientRoute, CorrelationKey};
use crate::session::{Endpoint, Session, SessionContext, SessionDescriptor};

pub mod liveness;
pub mod resource;
pub mod sync;

pub use liveness::Liveness;
pub use resource::{Channel, GpioHandle, GpioMode, Input, Output, RemoteDevice, WatchOptions};
pub use sync::ActiveSync;

pub struct ClientBuilder {
    app_id: Option<String>,
    config: Config,
    event_log: Option<Arc<dyn EventLog>>,
    key_source: Option<Arc<dyn KeySource>>,
}

impl ClientBuilder {
    /// Fixed application id. A random one is generated otherwise.
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    pub fn build(self) -> Result<Client> {
        let app_id = self
            .app_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        if app_id.trim().is_empty() {
            return Err(Error::Validation("app id must not be empty".into()));
        }
        let mut descriptor = SessionDescriptor::client(app_id.clone());
        descriptor.restartable = self.config.restartable;
        let log = self
            .event_log
            .unwrap_or_else(|| Arc::new(FileEventLog::new(self.config.log_path.clone())));
        let key_source = self
            .key_source
            .unwrap_or_else(|| Arc::new(RelayKeySource::from_config(&self.config)));
        let liveness = Liveness::new(self.config.liveness);
        let ctx = SessionContext::with_key_source(self.config, descriptor, log, key_source);
        Ok(Client {
            inner: Arc::new(ClientInner {
                ctx,
                app_id,
                liveness,
                sync: ActiveSync::new(),
                accessed: Mutex::new(BTreeSet::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct ClientInner {
    ctx: SessionContext,
    app_id: String,
    liveness: Liveness,
    sync: ActiveSync,
    accessed: Mutex<BTreeSet<u64>>,
    /// One-shot calls sharing a key take turns; replies carry no request id.
    in_flight: Mutex<HashMap<CorrelationKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Turn of one call on its correlation key. The gate entry goes away with
/// the last holder.
struct CallTurn<'a> {
    inner: &'a ClientInner,
    key: CorrelationKey,
    gate: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl<'a> CallTurn<'a> {
    async fn take(inner: &'a ClientInner, key: CorrelationKey) -> CallTurn<'a> {
        let gate = inner.in_flight.lock().entry(key.clone()).or_default().clone();
        let guard = gate.lock_owned().await;
        CallTurn {
            inner,
            key,
            gate: Some(guard),
        }
    }
}

impl Drop for CallTurn<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        self.gate.take();
        if in_flight.get(&self.key).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            in_flight.remove(&self.key);
        }
    }
}

/// A client process. Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("app_id", &self.inner.app_id)
            .field("ctx", &self.inner.ctx)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            app_id: None,
            config: Config::default(),
            event_log: None,
            key_source: None,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.ctx
    }

    pub fn liveness(&self) -> &Liveness {
        &self.inner.liveness
    }

    pub fn active_sync(&self) -> &ActiveSync {
        &self.inner.sync
    }

    /// The relay session serving this client.
    pub fn session(&self) -> Session<Client> {
        Session::new(self.inner.ctx.clone(), self.clone())
    }

    /// Handle on one remote device. Performs no I/O.
    pub fn access_device(&self, id: u64) -> Result<RemoteDevice> {
        if id == 0 {
            return Err(Error::Validation("device id must be a positive integer".into()));
        }
        self.inner.accessed.lock().insert(id);
        Ok(RemoteDevice::new(self.clone(), id))
    }

    pub fn access_devices(&self, ids: &[u64]) -> Result<Vec<RemoteDevice>> {
        ids.iter().map(|id| self.access_device(*id)).collect()
    }

    /// Devices registered under this client's account.
    pub async fn get_devices(&self) -> Result<Vec<Value>> {
        let mut request = self.own_request("getDevices");
        request.set("getDevices", true);
        let reply = self.call(None, request).await?;
        Ok(reply
            .get("devices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Request addressed to the relay itself.
    fn own_request(&self, pid: &str) -> Frame {
        let mut frame = self.inner.ctx.descriptor().to_frame();
        frame.set("_pid", pid);
        frame
    }

    /// Request addressed to `device`.
    pub(crate) fn device_request(&self, device: u64, pid: &str) -> Frame {
        let mut frame = self.inner.ctx.descriptor().to_frame();
        frame
            .set("id", device)
            .set("appId", self.inner.app_id.clone())
            .set("_pid", pid)
            .set("src", "client")
            .set("dst", "device");
        frame
    }

    fn send(&self, request: Frame) -> Result<()> {
        if self.inner.ctx.send(request) {
            Ok(())
        } else {
            Err(Error::Transport("not connected".into()))
        }
    }

    fn key_of(request: &Frame) -> Result<CorrelationKey> {
        CorrelationKey::from_frame(request)
            .ok_or_else(|| Error::Validation("request cannot be correlated".into()))
    }

    /// Sends `request` and waits for its single reply. A reply carrying
    /// `error` becomes `Error::Resource`.
    pub(crate) async fn call(&self, device: Option<&EndpointId>, request: Frame) -> Result<Frame> {
        if let Some(device) = device {
            self.inner.liveness.check(device).await?;
        }
        let key = Self::key_of(&request)?;
        let _turn = CallTurn::take(&self.inner, key.clone()).await;
        let reply = self.inner.ctx.bus().once(Topic::Correlated(key));
        self.send(request)?;
        let reply = reply
            .recv()
            .await
            .ok_or_else(|| Error::Transport("request abandoned".into()))?;
        match reply.error() {
            Some(error) => Err(Error::Resource(error.to_string())),
            None => Ok(reply),
        }
    }

    /// Registers a standing watch and returns its delivery stream.
    pub(crate) async fn watch(&self, device: &EndpointId, request: Frame, reading: Reading) -> Result<WatchStream> {
        self.inner.liveness.check(device).await?;
        let key = Self::key_of(&request)?;
        let subscription = self.inner.ctx.bus().subscribe(Topic::Correlated(key.clone()));
        if self.inner.sync.record(key.clone(), request.clone()) {
            if let Err(err) = self.send(request) {
                self.inner.sync.remove(&key);
                return Err(err);
            }
        } else {
            tracing::debug!(device = %device, "already watching, sharing deliveries");
        }
        Ok(WatchStream {
            key,
            subscription,
            reading,
        })
    }

    /// Cancels a standing watch. Returns whether the device had one.
    pub(crate) async fn unwatch(&self, device: &EndpointId, request: Frame) -> Result<bool> {
        let reply = self.call(Some(device), request).await?;
        let removed = reply.flag("unwatch");
        if removed {
            if let Some(key) = CorrelationKey::from_frame(&reply) {
                let watch = key.watch_counterpart();
                self.inner.sync.remove(&watch);
                self.inner.ctx.bus().close(&Topic::Correlated(watch));
            }
        }
        Ok(removed)
    }

    fn device_online(&self, ctx: &SessionContext, id: EndpointId, frame: &Frame) {
        self.inner.liveness.mark_online(&id);
        let resend = self.inner.sync.refresh(&id, frame);
        tracing::info!(device = %id, watches = resend.len(), "device on-line");
        ctx.log().record("remote", &format!("device[{id}] is online"), &[]);
        for request in resend {
            ctx.send(request);
        }
    }

    fn device_offline(&self, ctx: &SessionContext, id: EndpointId) {
        let error = liveness::offline_error(&id);
        let notice = Frame::new().with("id", id.to_value()).with("error", error.clone());
        let reached = ctx.bus().publish_where(
            |topic| matches!(topic, Topic::Correlated(key) if key.device == id),
            notice,
        );
        tracing::info!(device = %id, subscriptions = reached, "device off-line");
        ctx.log().record("remote", &error, &[]);
        self.inner.liveness.mark_offline(id);
    }

    fn registered_devices(&self, frame: &Frame) {
        let Some(devices) = frame.get("devices").and_then(Value::as_array) else {
            return;
        };
        let known: BTreeSet<u64> = devices
            .iter()
            .filter_map(|d| d.get("id").and_then(EndpointId::from_value))
            .filter_map(|id| id.as_u64())
            .collect();
        for id in self.inner.accessed.lock().iter() {
            if known.contains(id) {
                tracing::info!(device_id = id, "accessing device");
            } else {
                tracing::warn!(device_id = id, "device id is invalid, device is not registered");
                self.inner.liveness.mark_invalid(EndpointId::Num(*id));
            }
        }
    }

    fn status(&self, ctx: &SessionContext, frame: Frame) {
        let descriptor = ctx.descriptor();
        let accessed: Vec<u64> = self.inner.accessed.lock().iter().copied().collect();
        let mut response = frame.into_response(ctx.role());
        response
            .set("active", true)
            .set("appId", self.inner.app_id.clone())
            .set("systemInfo", ctx.system_info().to_value())
            .set("clientDeviceId", json!(accessed))
            .set("restartable", ctx.config().restartable || descriptor.restartable);
        if let Some(options) = descriptor.options {
            response.set("options", options);
        }
        ctx.send(response);
    }
}

/// Which reply field carries the delivered value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reading {
    Channel,
    State,
}

impl Reading {
    pub(crate) fn extract(&self, frame: &Frame) -> Value {
        match self {
            Reading::Channel => frame
                .get("result")
                .or_else(|| frame.get("value"))
                .cloned()
                .unwrap_or(Value::Null),
            Reading::State => frame.get("state").cloned().unwrap_or(Value::Null),
        }
    }
}

/// Deliveries of one standing watch. Ends after a successful unwatch.
#[derive(Debug)]
pub struct WatchStream {
    key: CorrelationKey,
    subscription: Subscription,
    reading: Reading,
}

impl WatchStream {
    /// Next delivered value. Off-line notices and device-side errors are
    /// yielded as `Error::Resource`; the stream stays open after them.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        let frame = self.subscription.recv().await?;
        Some(match frame.error() {
            Some(error) => Err(Error::Resource(error.to_string())),
            None => Ok(self.reading.extract(&frame)),
        })
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }
}

#[async_trait]
impl Endpoint for Client {
    async fn handle(&self, ctx: &SessionContext, frame: Frame) -> Result<()> {
        let Some(route) = router::route_client(&frame, &self.inner.app_id) else {
            return Ok(());
        };
        match route {
            ClientRoute::DeviceOnline(id) => self.device_online(ctx, id, &frame),
            ClientRoute::DeviceOffline(id) => self.device_offline(ctx, id),
            ClientRoute::Status => self.status(ctx, frame),
            ClientRoute::Admin(op) => {
                let response = admin::handle(ctx, op, frame).await;
                ctx.send(response);
            }
            ClientRoute::RegisteredDevices => self.registered_devices(&frame),
            ClientRoute::Deliver(key) => {
                if !ctx.bus().publish(&Topic::Correlated(key), frame) {
                    tracing::debug!("reply without a waiting request");
                }
            }
        }
        Ok(())
    }

    async fn on_active(&self, ctx: &SessionContext, code: u16) -> Result<()> {
        tracing::info!(app_id = %self.inner.app_id, code, "client active");
        let mut request = self.own_request("getRegisteredDevices");
        request.set("getRegisteredDevices", true);
        ctx.send(request);
        Ok(())
    }

    async fn on_disconnect(&self, _ctx: &SessionContext) {}

    async fn on_shutdown(&self, ctx: &SessionContext) {
        ctx.log().record("process", "exit", &[self.inner.app_id.as_str()]);
    }
}
